use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A login session issued by the identity system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Paused,
    Unpaid,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Statuses that still grant the plan.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: String,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    pub renews_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// End of the current billing period, if the billing system reported one.
    pub fn period_anchor(&self) -> Option<DateTime<Utc>> {
        self.renews_at.or(self.ends_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
}

/// A remote tool provider (MCP server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// OAuth provider whose linked account must back this connector.
    pub provider: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A user's linked OAuth account for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub provider_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    /// Comma-separated scope list as stored by the auth system.
    pub scope: Option<String>,
}

impl Account {
    pub fn granted_scopes(&self) -> Option<HashSet<&str>> {
        self.scope.as_deref().map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub user_id: String,
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub connector_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub plan_name: String,
    pub execution_count: u64,
}

/// Filter for summing token usage in the telemetry store.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenQuery {
    pub user_id: String,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// One recorded trace, as exported by the telemetry store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceRecord {
    #[serde(default)]
    pub total_cost: f64,
    /// Trace output; model responses live under `output.response`.
    #[serde(default)]
    pub output: Value,
}
