pub mod memory;
pub mod telemetry;
pub mod threads;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::InMemoryDirectory;
pub use telemetry::HttpTelemetryStore;
pub use threads::{
    delete_threads, BatchDeleteReport, DeleteFailure, FileThreadStore, NoThreadStore,
    ThreadCheckpoint, ThreadStore,
};
pub use types::{
    Account, AgentRecord, Connector, Plan, SessionRecord, Subscription, SubscriptionStatus,
    TokenQuery, TraceRecord, UsageRecord,
};

/// Session lookup by bearer token. Returns every match so callers can reject
/// ambiguous tokens.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_sessions(&self, token: &str) -> Result<Vec<SessionRecord>, StoreError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Subscriptions whose status still grants the plan.
    async fn active_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError>;

    async fn plan(&self, plan_id: i64) -> Result<Option<Plan>, StoreError>;
}

/// Execution counters. Written by the billing side, only read here.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn usage(&self, user_id: &str, plan_name: &str)
        -> Result<Option<UsageRecord>, StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All of the user's linked accounts for any of `providers`, in one read.
    async fn accounts(&self, user_id: &str, providers: &[String])
        -> Result<Vec<Account>, StoreError>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError>;
}

#[async_trait]
pub trait ConnectorStore: Send + Sync {
    /// Batch load. Unknown ids are simply absent from the result.
    async fn connectors(&self, ids: &[Uuid]) -> Result<Vec<Connector>, StoreError>;
}

/// Best-effort metrics backend. Missing data is `None`, never an error.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn sum_tokens(&self, query: &TokenQuery) -> Result<Option<u64>, StoreError>;

    async fn traces(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, StoreError>;
}

/// Every external store the gate consults.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub usage: Arc<dyn UsageStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub agents: Arc<dyn AgentStore>,
    pub connectors: Arc<dyn ConnectorStore>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub threads: Arc<dyn ThreadStore>,
}

impl Stores {
    /// Back every store with one in-memory directory. Threads are not
    /// persisted until [`with_threads`](Self::with_threads) is called.
    pub fn in_memory(directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            sessions: directory.clone(),
            subscriptions: directory.clone(),
            usage: directory.clone(),
            accounts: directory.clone(),
            agents: directory.clone(),
            connectors: directory.clone(),
            telemetry: directory,
            threads: Arc::new(NoThreadStore),
        }
    }

    pub fn with_telemetry(mut self, telemetry: impl TelemetryStore + 'static) -> Self {
        self.telemetry = Arc::new(telemetry);
        self
    }

    pub fn with_threads(mut self, threads: impl ThreadStore + 'static) -> Self {
        self.threads = Arc::new(threads);
        self
    }
}
