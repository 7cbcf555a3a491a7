use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription level, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Basic,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Basic, PlanTier::Pro, PlanTier::Enterprise];

    pub fn lowest() -> Self {
        PlanTier::Basic
    }

    pub fn highest() -> Self {
        PlanTier::Enterprise
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Basic => "basic",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }

    /// Map a plan row's name onto a tier. Case-insensitive.
    pub fn from_plan_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        PlanTier::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tier adds on top of the tiers below it, plus its own ceilings.
#[derive(Debug, Clone, Default)]
pub struct TierGrant {
    pub models: Vec<String>,
    pub connectors: Vec<Uuid>,
    /// Tokens per 30-day window, per model. Absent means zero.
    pub token_ceilings: HashMap<String, u64>,
    pub execution_ceiling: u64,
}

#[derive(Debug, Clone, Default)]
struct TierPolicy {
    models: HashSet<String>,
    connectors: HashSet<Uuid>,
    token_ceilings: HashMap<String, u64>,
    execution_ceiling: u64,
}

/// Static entitlement table. Allow-lists are made cumulative once, here, so
/// request-time checks are plain set lookups.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    tiers: BTreeMap<PlanTier, TierPolicy>,
}

impl PlanCatalog {
    pub fn new(mut grants: BTreeMap<PlanTier, TierGrant>) -> Self {
        let mut tiers = BTreeMap::new();
        let mut models = HashSet::new();
        let mut connectors = HashSet::new();

        for tier in PlanTier::ALL {
            let grant = grants.remove(&tier).unwrap_or_default();
            models.extend(grant.models);
            connectors.extend(grant.connectors);
            tiers.insert(
                tier,
                TierPolicy {
                    models: models.clone(),
                    connectors: connectors.clone(),
                    token_ceilings: grant.token_ceilings,
                    execution_ceiling: grant.execution_ceiling,
                },
            );
        }

        Self { tiers }
    }

    pub fn allowed_models(&self, tier: PlanTier) -> &HashSet<String> {
        &self.policy(tier).models
    }

    pub fn allowed_connectors(&self, tier: PlanTier) -> &HashSet<Uuid> {
        &self.policy(tier).connectors
    }

    /// Token ceiling for `model` on `tier`; zero when not configured.
    pub fn token_ceiling(&self, tier: PlanTier, model: &str) -> u64 {
        self.policy(tier)
            .token_ceilings
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    pub fn execution_ceiling(&self, tier: PlanTier) -> u64 {
        self.policy(tier).execution_ceiling
    }

    fn policy(&self, tier: PlanTier) -> &TierPolicy {
        // `new` inserts every tier.
        &self.tiers[&tier]
    }
}

/// Connector available on every plan.
pub const BASIC_CONNECTOR: Uuid = Uuid::from_u128(0x009ff9fb_1883_4d50_b5bf_b9135c116f73);

impl Default for PlanCatalog {
    fn default() -> Self {
        let ceilings = |pairs: &[(&str, u64)]| -> HashMap<String, u64> {
            pairs.iter().map(|(m, n)| (m.to_string(), *n)).collect()
        };

        let mut grants = BTreeMap::new();
        grants.insert(
            PlanTier::Basic,
            TierGrant {
                models: vec!["gpt-4.1-mini".into()],
                connectors: vec![BASIC_CONNECTOR],
                token_ceilings: ceilings(&[("gpt-4.1-mini", 200_000)]),
                execution_ceiling: 50,
            },
        );
        grants.insert(
            PlanTier::Pro,
            TierGrant {
                models: vec!["gpt-4.1".into(), "gemini-flash".into()],
                connectors: vec![],
                token_ceilings: ceilings(&[
                    ("gpt-4.1-mini", 2_000_000),
                    ("gpt-4.1", 1_000_000),
                    ("gemini-flash", 1_000_000),
                ]),
                execution_ceiling: 1_000,
            },
        );
        grants.insert(
            PlanTier::Enterprise,
            TierGrant {
                models: vec!["gemini-2.5-pro".into()],
                connectors: vec![],
                token_ceilings: ceilings(&[
                    ("gpt-4.1-mini", 20_000_000),
                    ("gpt-4.1", 10_000_000),
                    ("gemini-flash", 10_000_000),
                    ("gemini-2.5-pro", 5_000_000),
                ]),
                execution_ceiling: 20_000,
            },
        );
        Self::new(grants)
    }
}
