use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::{CallArgs, MemoCache, Param};
use crate::error::GateError;
use crate::plan::{PlanCatalog, PlanTier};
use crate::store::{Subscription, SubscriptionStore};

const ACTIVE_SUBSCRIPTION: &str = "active_subscription";
const RESOLVE_PLAN: &str = "resolve_plan";

/// Answers "which plan is this user on" and "may this plan use X".
///
/// Plan resolution is memoized per user. Subscription changes are rare next
/// to request volume, so callers that need fresh data invalidate explicitly
/// with [`invalidate_user`](Self::invalidate_user).
pub struct EntitlementResolver {
    subscriptions: Arc<dyn SubscriptionStore>,
    catalog: Arc<PlanCatalog>,
    cache: MemoCache,
    plan_ttl: Option<Duration>,
}

impl EntitlementResolver {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        catalog: Arc<PlanCatalog>,
        cache: MemoCache,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            cache,
            plan_ttl: None,
        }
    }

    /// Expire memoized plan lookups after `ttl`. `None` keeps them until
    /// invalidated.
    pub fn with_plan_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.plan_ttl = ttl;
        self
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The user's single active subscription, if any. More than one is a data
    /// integrity problem and is reported, never resolved.
    pub async fn active_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, GateError> {
        self.cache
            .get_or_compute_async(
                ACTIVE_SUBSCRIPTION,
                CallArgs::new().arg(user_id),
                self.plan_ttl,
                || self.load_active_subscription(user_id),
            )
            .await
    }

    pub async fn resolve_plan(&self, user_id: &str) -> Result<PlanTier, GateError> {
        self.cache
            .get_or_compute_async(
                RESOLVE_PLAN,
                CallArgs::new().arg(user_id),
                self.plan_ttl,
                || self.load_plan(user_id),
            )
            .await
    }

    /// Forget everything memoized for `user_id`.
    pub fn invalidate_user(&self, user_id: &str) {
        for function in [ACTIVE_SUBSCRIPTION, RESOLVE_PLAN] {
            self.cache
                .invalidate_by_param(function, Param::Position(0), user_id);
        }
    }

    pub fn is_model_allowed(&self, model: &str, tier: PlanTier) -> Result<(), GateError> {
        if tier == PlanTier::highest() || self.catalog.allowed_models(tier).contains(model) {
            return Ok(());
        }
        warn!(model, %tier, "model not in plan");
        Err(GateError::Entitlement {
            resource: "model",
            id: model.to_string(),
            tier,
        })
    }

    pub fn is_connector_allowed(&self, connector_id: Uuid, tier: PlanTier) -> Result<(), GateError> {
        if tier == PlanTier::highest() || self.catalog.allowed_connectors(tier).contains(&connector_id)
        {
            return Ok(());
        }
        warn!(%connector_id, %tier, "connector not in plan");
        Err(GateError::Entitlement {
            resource: "MCP",
            id: connector_id.to_string(),
            tier,
        })
    }

    pub async fn check_model(&self, user_id: &str, model: &str) -> Result<PlanTier, GateError> {
        let tier = self.resolve_plan(user_id).await?;
        self.is_model_allowed(model, tier)?;
        Ok(tier)
    }

    pub async fn check_connector(
        &self,
        user_id: &str,
        connector_id: Uuid,
    ) -> Result<PlanTier, GateError> {
        let tier = self.resolve_plan(user_id).await?;
        self.is_connector_allowed(connector_id, tier)?;
        Ok(tier)
    }

    async fn load_active_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, GateError> {
        let mut subscriptions = self.subscriptions.active_subscriptions(user_id).await?;
        match subscriptions.len() {
            0 | 1 => Ok(subscriptions.pop()),
            n => {
                error!(user_id, count = n, "multiple active subscriptions");
                Err(GateError::Configuration(format!(
                    "Multiple active subscriptions found for user {user_id}."
                )))
            }
        }
    }

    async fn load_plan(&self, user_id: &str) -> Result<PlanTier, GateError> {
        let Some(subscription) = self.active_subscription(user_id).await? else {
            debug!(user_id, "no active subscription, using lowest tier");
            return Ok(PlanTier::lowest());
        };

        let plan = self
            .subscriptions
            .plan(subscription.plan_id)
            .await?
            .ok_or_else(|| {
                error!(user_id, plan_id = subscription.plan_id, "plan row missing");
                GateError::Configuration("Plan not found for active subscription.".into())
            })?;

        let tier = PlanTier::from_plan_name(&plan.name).ok_or_else(|| {
            error!(user_id, plan = %plan.name, "plan name has no tier");
            GateError::Configuration(format!("Unknown plan name: {}", plan.name))
        })?;
        debug!(user_id, %tier, "resolved plan");
        Ok(tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDirectory, Plan, SubscriptionStatus};

    fn subscription(id: i64, user: &str, plan_id: i64, status: SubscriptionStatus) -> Subscription {
        Subscription {
            id,
            user_id: user.into(),
            plan_id,
            status,
            renews_at: None,
            ends_at: None,
        }
    }

    fn directory() -> Arc<InMemoryDirectory> {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.add_plan(Plan { id: 1, name: "pro".into() });
        dir.add_plan(Plan { id: 2, name: "enterprise".into() });
        dir.add_plan(Plan { id: 3, name: "legacy".into() });
        dir
    }

    fn resolver(dir: &Arc<InMemoryDirectory>) -> EntitlementResolver {
        EntitlementResolver::new(dir.clone(), Arc::new(PlanCatalog::default()), MemoCache::new())
    }

    #[tokio::test]
    async fn no_subscription_is_lowest_tier() {
        let dir = directory();
        dir.add_subscription(subscription(1, "u1", 1, SubscriptionStatus::Cancelled));
        let tier = resolver(&dir).resolve_plan("u1").await.unwrap();
        assert_eq!(tier, PlanTier::lowest());
    }

    #[tokio::test]
    async fn single_subscription_maps_to_plan() {
        let dir = directory();
        dir.add_subscription(subscription(1, "u1", 1, SubscriptionStatus::Trialing));
        assert_eq!(resolver(&dir).resolve_plan("u1").await.unwrap(), PlanTier::Pro);
    }

    #[tokio::test]
    async fn multiple_active_subscriptions_fail() {
        let dir = directory();
        dir.add_subscription(subscription(1, "u1", 1, SubscriptionStatus::Active));
        dir.add_subscription(subscription(2, "u1", 2, SubscriptionStatus::PastDue));
        let err = resolver(&dir).resolve_plan("u1").await.unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_or_unknown_plan_fails() {
        let dir = directory();
        dir.add_subscription(subscription(1, "u1", 99, SubscriptionStatus::Active));
        dir.add_subscription(subscription(2, "u2", 3, SubscriptionStatus::Active));
        let r = resolver(&dir);
        assert!(matches!(r.resolve_plan("u1").await, Err(GateError::Configuration(_))));
        assert!(matches!(r.resolve_plan("u2").await, Err(GateError::Configuration(_))));
    }

    #[tokio::test]
    async fn plan_is_memoized_until_invalidated() {
        let dir = directory();
        let r = resolver(&dir);
        assert_eq!(r.resolve_plan("u1").await.unwrap(), PlanTier::Basic);

        dir.add_subscription(subscription(1, "u1", 2, SubscriptionStatus::Active));
        assert_eq!(r.resolve_plan("u1").await.unwrap(), PlanTier::Basic);

        r.invalidate_user("u1");
        assert_eq!(r.resolve_plan("u1").await.unwrap(), PlanTier::Enterprise);
    }

    #[tokio::test]
    async fn model_outside_plan_is_refused() {
        let dir = directory();
        let r = resolver(&dir);
        assert!(r.check_model("u1", "gpt-4.1-mini").await.is_ok());
        let err = r.check_model("u1", "gpt-4.1").await.unwrap_err();
        assert_eq!(err.user_message(), "Please upgrade to access this model.");
    }

    #[test]
    fn highest_tier_short_circuits() {
        let dir = directory();
        let r = resolver(&dir);
        assert!(r.is_model_allowed("anything", PlanTier::Enterprise).is_ok());
        assert!(r.is_connector_allowed(Uuid::new_v4(), PlanTier::Enterprise).is_ok());
        assert!(r.is_connector_allowed(Uuid::new_v4(), PlanTier::Pro).is_err());
        assert!(r
            .is_connector_allowed(crate::plan::BASIC_CONNECTOR, PlanTier::Basic)
            .is_ok());
    }
}
