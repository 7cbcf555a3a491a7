pub mod admin;
pub mod cache;
pub mod config;
pub mod connectors;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod model;
pub mod plan;
pub mod store;
pub mod stream;
pub mod tools;
pub mod turn;
pub mod types;
pub mod usage;

use std::sync::Arc;

use tracing::info;

pub use admin::{Admin, Health, ToolPreview};
pub use cache::{CacheStats, CallArgs, MemoCache, Param};
pub use config::{OAuthClient, Settings};
pub use connectors::{
    ConnectionParams, ConnectorResolver, DiscoveredTools, HttpToolDiscovery, ResolvedTools,
    ToolDiscovery,
};
pub use entitlement::EntitlementResolver;
pub use error::{DiscoveryError, ExecutorError, GateError, StoreError};
pub use events::{EventMetadata, StreamEvent};
pub use executor::{AgentExecutor, EventStream, ExecutorRequest};
pub use model::{resolve_model, ModelBackend, ModelFamily, ModelHandle};
pub use plan::{PlanCatalog, PlanTier, TierGrant};
pub use store::{HttpTelemetryStore, InMemoryDirectory, Stores, ThreadStore};
pub use stream::{encode_stream, Frame, StreamEncoder, CONTENT_TYPE, PROTOCOL_HEADER};
pub use tools::{ToolHandler, ToolRegistry};
pub use turn::{coalesce, TurnConfig, TurnFailure, TurnPipeline, TurnState};
pub use types::{Message, ToolCall, Usage};
pub use usage::{UsageAccountant, UsageReport};

/// The assembled service: one shared cache, the gate components on top of
/// the stores, the turn pipeline and the admin surface.
pub struct Gate {
    cache: MemoCache,
    entitlements: Arc<EntitlementResolver>,
    usage: Arc<UsageAccountant>,
    connectors: Arc<ConnectorResolver>,
    pipeline: TurnPipeline,
    admin: Admin,
}

impl Gate {
    pub fn builder(
        settings: Settings,
        stores: Stores,
        executor: impl AgentExecutor + 'static,
    ) -> GateBuilder {
        GateBuilder {
            settings,
            stores,
            executor: Arc::new(executor),
            catalog: None,
            discovery: None,
            cache: None,
        }
    }

    /// Read settings from the environment, install logging and use the
    /// remote telemetry store when it is configured.
    pub fn from_env(
        stores: Stores,
        executor: impl AgentExecutor + 'static,
    ) -> Result<Self, GateError> {
        let settings = Settings::from_env()?;
        logging::init(&settings.log_filter);

        let stores = match settings.telemetry() {
            Some((host, public_key, secret_key)) => {
                info!(host, "using remote telemetry");
                stores.with_telemetry(HttpTelemetryStore::new(host, public_key, secret_key))
            }
            None => stores,
        };
        Ok(Self::builder(settings, stores, executor).build())
    }

    pub fn cache(&self) -> &MemoCache {
        &self.cache
    }

    pub fn entitlements(&self) -> &EntitlementResolver {
        &self.entitlements
    }

    pub fn usage(&self) -> &UsageAccountant {
        &self.usage
    }

    pub fn connectors(&self) -> &ConnectorResolver {
        &self.connectors
    }

    pub fn pipeline(&self) -> &TurnPipeline {
        &self.pipeline
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }
}

pub struct GateBuilder {
    settings: Settings,
    stores: Stores,
    executor: Arc<dyn AgentExecutor>,
    catalog: Option<PlanCatalog>,
    discovery: Option<Arc<dyn ToolDiscovery>>,
    cache: Option<MemoCache>,
}

impl GateBuilder {
    /// Replace the built-in plan catalog.
    pub fn catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace HTTP tool discovery.
    pub fn discovery(mut self, discovery: impl ToolDiscovery + 'static) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    /// Share an existing cache instead of starting an empty one.
    pub fn cache(mut self, cache: MemoCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Gate {
        let GateBuilder {
            settings,
            stores,
            executor,
            catalog,
            discovery,
            cache,
        } = self;
        let settings = Arc::new(settings);
        let cache = cache.unwrap_or_default();
        let discovery =
            discovery.unwrap_or_else(|| Arc::new(HttpToolDiscovery::new()) as Arc<dyn ToolDiscovery>);

        let entitlements = Arc::new(
            EntitlementResolver::new(
                stores.subscriptions.clone(),
                Arc::new(catalog.unwrap_or_default()),
                cache.clone(),
            )
            .with_plan_ttl(settings.plan_cache_ttl()),
        );
        let usage = Arc::new(UsageAccountant::new(
            entitlements.clone(),
            stores.telemetry.clone(),
            stores.usage.clone(),
        ));
        let connectors = Arc::new(ConnectorResolver::new(
            entitlements.clone(),
            stores.connectors.clone(),
            stores.accounts.clone(),
            discovery,
            settings.google_oauth(),
        ));
        let pipeline = TurnPipeline::new(
            stores.sessions.clone(),
            stores.agents.clone(),
            stores.threads.clone(),
            entitlements.clone(),
            usage.clone(),
            connectors.clone(),
            executor,
            settings,
            cache.clone(),
        );
        let admin = Admin::new(
            connectors.clone(),
            usage.clone(),
            stores.threads.clone(),
            cache.clone(),
        );

        Gate {
            cache,
            entitlements,
            usage,
            connectors,
            pipeline,
            admin,
        }
    }
}
