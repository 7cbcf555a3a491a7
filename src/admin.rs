use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::cache::{CacheStats, MemoCache};
use crate::connectors::ConnectorResolver;
use crate::error::GateError;
use crate::store::{delete_threads, BatchDeleteReport, ThreadStore};
use crate::usage::{UsageAccountant, UsageReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

/// What a connector set would give an agent, without running a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolPreview {
    pub tools: Vec<Value>,
    pub instructions: Vec<String>,
}

/// Operator-facing operations. Thin wrappers; all checks live in the
/// components they call.
pub struct Admin {
    connectors: Arc<ConnectorResolver>,
    usage: Arc<UsageAccountant>,
    threads: Arc<dyn ThreadStore>,
    cache: MemoCache,
}

impl Admin {
    pub fn new(
        connectors: Arc<ConnectorResolver>,
        usage: Arc<UsageAccountant>,
        threads: Arc<dyn ThreadStore>,
        cache: MemoCache,
    ) -> Self {
        Self {
            connectors,
            usage,
            threads,
            cache,
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Run the full connector checks and discovery for `connector_ids`.
    pub async fn preview_tools(
        &self,
        connector_ids: &[Uuid],
        user_id: &str,
        session_token: &str,
    ) -> Result<ToolPreview, GateError> {
        let resolved = self
            .connectors
            .resolve(connector_ids, user_id, session_token)
            .await?;
        info!(user_id, tools = resolved.tools.len(), "tool preview");
        Ok(ToolPreview {
            tools: resolved.tools.summaries(),
            instructions: resolved.instructions,
        })
    }

    pub async fn usage_report(&self, user_id: &str) -> Result<UsageReport, GateError> {
        self.usage.usage_report(user_id).await
    }

    pub async fn delete_threads(&self, thread_ids: &[String]) -> BatchDeleteReport {
        delete_threads(self.threads.as_ref(), thread_ids).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
