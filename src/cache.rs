use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// The arguments of one memoized call, in canonical JSON form.
///
/// Positional order is significant, keyword order is not. Values go through
/// `serde`, so a `Uuid` and its hyphenated string produce the same key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keywords: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.positional.push(canonical(&value));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.keywords.insert(name.into(), canonical(&value));
        self
    }

    fn digest(&self) -> String {
        let keywords: Vec<(&String, &Value)> = self.keywords.iter().collect();
        let payload = json!([self.positional, keywords]);
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        format!("{:x}", Sha256::digest(bytes))
    }

    fn matches(&self, param: &Param, value: &Value) -> bool {
        match param {
            Param::Position(i) => self.positional.get(*i) == Some(value),
            Param::Keyword(name) => self.keywords.get(name.as_str()) == Some(value),
        }
    }
}

fn canonical(value: &impl Serialize) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "cache argument is not serializable, keying on its error");
            Value::String(format!("<unserializable: {e}>"))
        }
    }
}

/// Selects which stored argument `invalidate_by_param` compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Position(usize),
    Keyword(String),
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    function: String,
    args: CallArgs,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(self.inserted_at) > ttl)
    }
}

/// Snapshot of the table for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub functions: Vec<String>,
}

/// Keyed memoization shared by every caller holding a clone.
///
/// One lock guards the whole table and is only held for map operations; the
/// wrapped computation always runs unlocked. Two concurrent misses on the same
/// key may both compute, and the later insert wins.
#[derive(Clone, Default)]
pub struct MemoCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value or runs `compute` and stores its `Ok` result.
    /// Errors propagate and are never stored.
    pub fn get_or_compute<T, E, F>(
        &self,
        function: &str,
        args: CallArgs,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let key = cache_key(function, &args);
        if let Some(hit) = self.lookup::<T>(&key) {
            return Ok(hit);
        }
        let value = compute()?;
        self.store(key, function, args, ttl, value.clone());
        Ok(value)
    }

    /// Async twin of [`get_or_compute`](Self::get_or_compute). Shares the
    /// same table, so sync and async callers see each other's entries.
    pub async fn get_or_compute_async<T, E, F, Fut>(
        &self,
        function: &str,
        args: CallArgs,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = cache_key(function, &args);
        if let Some(hit) = self.lookup::<T>(&key) {
            return Ok(hit);
        }
        let value = compute().await?;
        self.store(key, function, args, ttl, value.clone());
        Ok(value)
    }

    /// Drop every entry recorded for `function`.
    pub fn invalidate_function(&self, function: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.function != function);
        let removed = before - entries.len();
        debug!(function, removed, "cache invalidated by function");
        removed
    }

    /// Drop the entries of `function` whose selected argument equals `value`.
    pub fn invalidate_by_param(&self, function: &str, param: Param, value: impl Serialize) -> usize {
        let value = canonical(&value);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !(e.function == function && e.args.matches(&param, &value)));
        let removed = before - entries.len();
        debug!(function, ?param, removed, "cache invalidated by parameter");
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let mut functions: Vec<String> = entries.values().map(|e| e.function.clone()).collect();
        functions.sort();
        functions.dedup();
        CacheStats {
            total_entries: entries.len(),
            functions,
        }
    }

    fn lookup<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            entries.remove(key);
            return None;
        }
        // A type mismatch means two functions share a name; treat it as a miss.
        entry.value.downcast_ref::<T>().cloned()
    }

    fn store<T: Send + Sync + 'static>(
        &self,
        key: String,
        function: &str,
        args: CallArgs,
        ttl: Option<Duration>,
        value: T,
    ) {
        let entry = Entry {
            value: Arc::new(value),
            function: function.to_string(),
            args,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.lock().insert(key, entry);
    }
}

fn cache_key(function: &str, args: &CallArgs) -> String {
    format!("{function}:{}", args.digest())
}
