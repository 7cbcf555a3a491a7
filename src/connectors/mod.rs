mod headers;
pub mod http;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OAuthClient;
use crate::entitlement::EntitlementResolver;
use crate::error::{DiscoveryError, GateError};
use crate::store::{Account, AccountStore, AgentRecord, Connector, ConnectorStore};
use crate::tools::ToolRegistry;

pub use headers::{session_headers, ProviderPolicy};
pub use http::{HttpToolDiscovery, RemoteTool};

pub const STREAMABLE_HTTP: &str = "streamable_http";

/// How to reach one connector: endpoint, transport and request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionParams {
    pub url: String,
    pub transport: String,
    pub headers: BTreeMap<String, String>,
}

/// What discovery hands back: the callable tools plus any server
/// instructions to append to the system prompt.
#[derive(Debug, Default)]
pub struct DiscoveredTools {
    pub tools: ToolRegistry,
    pub instructions: Vec<String>,
}

/// Lists tools on a set of connectors. Keys are connector names.
#[async_trait]
pub trait ToolDiscovery: Send + Sync {
    async fn discover(
        &self,
        connections: &BTreeMap<String, ConnectionParams>,
    ) -> Result<DiscoveredTools, DiscoveryError>;
}

/// Tools ready for one turn.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTools {
    pub tools: Arc<ToolRegistry>,
    pub instructions: Vec<String>,
}

impl ResolvedTools {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.instructions.is_empty()
    }
}

/// Turns connector ids into authenticated connection parameters and then
/// into tools.
///
/// Every check that can fail runs before any network call: plan entitlement,
/// linked account, granted scopes and token expiry. Connectors and accounts
/// are each loaded with a single store read.
pub struct ConnectorResolver {
    entitlements: Arc<EntitlementResolver>,
    connectors: Arc<dyn ConnectorStore>,
    accounts: Arc<dyn AccountStore>,
    discovery: Arc<dyn ToolDiscovery>,
    oauth: OAuthClient,
}

impl ConnectorResolver {
    pub fn new(
        entitlements: Arc<EntitlementResolver>,
        connectors: Arc<dyn ConnectorStore>,
        accounts: Arc<dyn AccountStore>,
        discovery: Arc<dyn ToolDiscovery>,
        oauth: OAuthClient,
    ) -> Self {
        Self {
            entitlements,
            connectors,
            accounts,
            discovery,
            oauth,
        }
    }

    /// Validate `connector_ids` for `user_id` and build their connection
    /// parameters, keyed by connector name.
    pub async fn connection_params(
        &self,
        connector_ids: &[Uuid],
        user_id: &str,
        session_token: &str,
    ) -> Result<BTreeMap<String, ConnectionParams>, GateError> {
        let mut params = BTreeMap::new();
        if connector_ids.is_empty() {
            return Ok(params);
        }

        let connectors: HashMap<Uuid, Connector> = self
            .connectors
            .connectors(connector_ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let mut providers: Vec<String> = connectors
            .values()
            .filter_map(|c| c.provider.clone())
            .collect();
        providers.sort();
        providers.dedup();

        let accounts = if providers.is_empty() {
            Vec::new()
        } else {
            self.accounts.accounts(user_id, &providers).await?
        };
        let tier = self.entitlements.resolve_plan(user_id).await?;
        let now = Utc::now();

        for id in connector_ids {
            self.entitlements.is_connector_allowed(*id, tier)?;

            let connector = connectors.get(id).ok_or_else(|| {
                GateError::Configuration(format!("connector {id} does not exist"))
            })?;

            let mut headers = session_headers(session_token);
            if let Some(provider) = connector.provider.as_deref() {
                let account = accounts
                    .iter()
                    .find(|a| a.provider_id == provider)
                    .ok_or_else(|| GateError::AccountMissing {
                        provider: provider.to_string(),
                    })?;
                check_scopes(connector, account)?;

                let policy = ProviderPolicy::for_provider(provider);
                if policy.is_expired(account, now) {
                    return Err(GateError::ExpiredCredential {
                        provider: provider.to_string(),
                    });
                }
                headers = policy.headers(account, &self.oauth, headers);
            }

            if params.contains_key(&connector.name) {
                warn!(connector = %connector.name, %id, "duplicate connector name, keeping first");
                continue;
            }
            debug!(connector = %connector.name, %id, "connector validated");
            params.insert(
                connector.name.clone(),
                ConnectionParams {
                    url: connector.url.clone(),
                    transport: STREAMABLE_HTTP.to_string(),
                    headers,
                },
            );
        }

        Ok(params)
    }

    /// Validate and discover tools for `connector_ids`. An empty list never
    /// reaches discovery.
    pub async fn resolve(
        &self,
        connector_ids: &[Uuid],
        user_id: &str,
        session_token: &str,
    ) -> Result<ResolvedTools, GateError> {
        let params = self
            .connection_params(connector_ids, user_id, session_token)
            .await?;
        if params.is_empty() {
            return Ok(ResolvedTools::default());
        }

        let discovered = self.discovery.discover(&params).await.map_err(|e| {
            warn!(user_id, error = %e, "tool discovery failed");
            GateError::from(e)
        })?;
        info!(
            user_id,
            connectors = params.len(),
            tools = discovered.tools.len(),
            "tools resolved"
        );
        Ok(ResolvedTools {
            tools: Arc::new(discovered.tools),
            instructions: discovered.instructions,
        })
    }

    /// Tools for every connector linked to `agent`.
    pub async fn resolve_for_agent(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        session_token: &str,
    ) -> Result<ResolvedTools, GateError> {
        self.resolve(&agent.connector_ids, user_id, session_token)
            .await
    }
}

fn check_scopes(connector: &Connector, account: &Account) -> Result<(), GateError> {
    let scope_error = || GateError::Scope {
        connector: connector.name.clone(),
        provider: account.provider_id.clone(),
    };
    let granted = account.granted_scopes().ok_or_else(scope_error)?;
    if connector
        .scopes
        .iter()
        .all(|s| granted.contains(s.trim()))
    {
        Ok(())
    } else {
        warn!(connector = %connector.name, provider = %account.provider_id, "account scopes too narrow");
        Err(scope_error())
    }
}
