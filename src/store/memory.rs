use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::types::{
    Account, AgentRecord, Connector, Plan, SessionRecord, Subscription, TokenQuery, TraceRecord,
    UsageRecord,
};
use super::{
    AccountStore, AgentStore, ConnectorStore, SessionStore, SubscriptionStore, TelemetryStore,
    UsageStore,
};
use crate::error::StoreError;

/// A token count recorded against a user, model and time.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub user_id: String,
    pub model: String,
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
    pub tokens: u64,
}

#[derive(Default)]
struct Tables {
    sessions: Vec<SessionRecord>,
    subscriptions: Vec<Subscription>,
    plans: Vec<Plan>,
    usage: Vec<UsageRecord>,
    accounts: Vec<Account>,
    agents: Vec<AgentRecord>,
    connectors: Vec<Connector>,
    token_events: Vec<TokenEvent>,
    traces: Vec<(String, DateTime<Utc>, TraceRecord)>,
    telemetry_offline: bool,
}

/// Every store in one process-local table set. For tests and local runs.
#[derive(Default)]
pub struct InMemoryDirectory {
    tables: RwLock<Tables>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session: SessionRecord) {
        self.tables.write().sessions.push(session);
    }

    pub fn add_subscription(&self, subscription: Subscription) {
        self.tables.write().subscriptions.push(subscription);
    }

    pub fn add_plan(&self, plan: Plan) {
        self.tables.write().plans.push(plan);
    }

    /// Replaces any existing record for the same user and plan.
    pub fn set_usage(&self, record: UsageRecord) {
        let mut tables = self.tables.write();
        tables
            .usage
            .retain(|u| !(u.user_id == record.user_id && u.plan_name == record.plan_name));
        tables.usage.push(record);
    }

    pub fn add_account(&self, account: Account) {
        self.tables.write().accounts.push(account);
    }

    pub fn add_agent(&self, agent: AgentRecord) {
        self.tables.write().agents.push(agent);
    }

    pub fn add_connector(&self, connector: Connector) {
        self.tables.write().connectors.push(connector);
    }

    pub fn record_tokens(&self, event: TokenEvent) {
        self.tables.write().token_events.push(event);
    }

    pub fn add_trace(&self, user_id: &str, at: DateTime<Utc>, trace: TraceRecord) {
        self.tables
            .write()
            .traces
            .push((user_id.to_string(), at, trace));
    }

    /// Make telemetry queries fail with a transport error.
    pub fn set_telemetry_offline(&self, offline: bool) {
        self.tables.write().telemetry_offline = offline;
    }
}

#[async_trait]
impl SessionStore for InMemoryDirectory {
    async fn find_sessions(&self, token: &str) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .sessions
            .iter()
            .filter(|s| s.token == token)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryDirectory {
    async fn active_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .tables
            .read()
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status.is_active())
            .cloned()
            .collect())
    }

    async fn plan(&self, plan_id: i64) -> Result<Option<Plan>, StoreError> {
        Ok(self
            .tables
            .read()
            .plans
            .iter()
            .find(|p| p.id == plan_id)
            .cloned())
    }
}

#[async_trait]
impl UsageStore for InMemoryDirectory {
    async fn usage(
        &self,
        user_id: &str,
        plan_name: &str,
    ) -> Result<Option<UsageRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .usage
            .iter()
            .find(|u| u.user_id == user_id && u.plan_name == plan_name)
            .cloned())
    }
}

#[async_trait]
impl AccountStore for InMemoryDirectory {
    async fn accounts(
        &self,
        user_id: &str,
        providers: &[String],
    ) -> Result<Vec<Account>, StoreError> {
        Ok(self
            .tables
            .read()
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id && providers.contains(&a.provider_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AgentStore for InMemoryDirectory {
    async fn agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .cloned())
    }
}

#[async_trait]
impl ConnectorStore for InMemoryDirectory {
    async fn connectors(&self, ids: &[Uuid]) -> Result<Vec<Connector>, StoreError> {
        Ok(self
            .tables
            .read()
            .connectors
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TelemetryStore for InMemoryDirectory {
    async fn sum_tokens(&self, query: &TokenQuery) -> Result<Option<u64>, StoreError> {
        let tables = self.tables.read();
        if tables.telemetry_offline {
            return Err(StoreError::Unavailable("telemetry offline".into()));
        }
        let mut matched = false;
        let total: u64 = tables
            .token_events
            .iter()
            .filter(|e| e.user_id == query.user_id)
            .filter(|e| e.at >= query.from && e.at <= query.to)
            .filter(|e| query.model.as_ref().map_or(true, |m| &e.model == m))
            .filter(|e| {
                query
                    .session_id
                    .as_ref()
                    .map_or(true, |s| e.session_id.as_ref() == Some(s))
            })
            .inspect(|_| matched = true)
            .map(|e| e.tokens)
            .sum();
        Ok(matched.then_some(total))
    }

    async fn traces(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, StoreError> {
        let tables = self.tables.read();
        if tables.telemetry_offline {
            return Err(StoreError::Unavailable("telemetry offline".into()));
        }
        Ok(tables
            .traces
            .iter()
            .filter(|(u, at, _)| u == user_id && *at >= from && *at <= to)
            .map(|(_, _, t)| t.clone())
            .collect())
    }
}
