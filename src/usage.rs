use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::entitlement::EntitlementResolver;
use crate::error::GateError;
use crate::store::{TelemetryStore, TokenQuery, TraceRecord, UsageStore};

/// Length of the rolling billing window.
pub const USAGE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl UsageWindow {
    pub fn ending_at(anchor: DateTime<Utc>) -> Self {
        Self {
            from: anchor - Duration::days(USAGE_WINDOW_DAYS),
            to: anchor,
        }
    }
}

/// Per-model totals for the usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub user_id: String,
    pub window: UsageWindow,
    pub models: BTreeMap<String, ModelUsage>,
}

/// Read-only quota checks. Counters are written elsewhere; nothing here
/// mutates them.
pub struct UsageAccountant {
    entitlements: Arc<EntitlementResolver>,
    telemetry: Arc<dyn TelemetryStore>,
    usage: Arc<dyn UsageStore>,
}

impl UsageAccountant {
    pub fn new(
        entitlements: Arc<EntitlementResolver>,
        telemetry: Arc<dyn TelemetryStore>,
        usage: Arc<dyn UsageStore>,
    ) -> Self {
        Self {
            entitlements,
            telemetry,
            usage,
        }
    }

    /// `[anchor - 30 days, anchor]`. The anchor is the end of the paid period
    /// when there is one, otherwise now.
    pub async fn active_window(&self, user_id: &str) -> Result<UsageWindow, GateError> {
        let anchor = self
            .entitlements
            .active_subscription(user_id)
            .await?
            .and_then(|s| s.period_anchor())
            .unwrap_or_else(Utc::now);
        Ok(UsageWindow::ending_at(anchor))
    }

    pub async fn token_usage_in_active_window(
        &self,
        user_id: &str,
        model: &str,
    ) -> Result<u64, GateError> {
        let window = self.active_window(user_id).await?;
        let query = TokenQuery {
            user_id: user_id.to_string(),
            model: Some(model.to_string()),
            session_id: None,
            from: window.from,
            to: window.to,
        };
        let used = self.telemetry.sum_tokens(&query).await?.unwrap_or(0);
        debug!(user_id, model, used, "token usage in window");
        Ok(used)
    }

    /// Fails once usage reaches the plan's ceiling for `model`. A zero
    /// ceiling makes the model unusable on that plan.
    pub async fn enforce_token_limit(&self, user_id: &str, model: &str) -> Result<(), GateError> {
        let tier = self.entitlements.resolve_plan(user_id).await?;
        let ceiling = self.entitlements.catalog().token_ceiling(tier, model);
        let used = if ceiling == 0 {
            0
        } else {
            self.token_usage_in_active_window(user_id, model).await?
        };

        if used >= ceiling {
            info!(user_id, model, %tier, used, ceiling, "token quota reached");
            return Err(GateError::Quota(format!(
                "You have reached the {model} token limit of your {tier} plan. \
                 Please upgrade your plan or wait for your usage window to reset."
            )));
        }
        Ok(())
    }

    /// Fails only when the stored execution count is strictly above the
    /// plan's ceiling.
    pub async fn enforce_execution_limit(&self, user_id: &str) -> Result<(), GateError> {
        let tier = self.entitlements.resolve_plan(user_id).await?;
        let ceiling = self.entitlements.catalog().execution_ceiling(tier);
        let count = self
            .usage
            .usage(user_id, tier.as_str())
            .await?
            .map_or(0, |u| u.execution_count);

        if count > ceiling {
            info!(user_id, %tier, count, ceiling, "execution quota exceeded");
            return Err(GateError::Quota(format!(
                "You have used all executions included in your {tier} plan. \
                 Please upgrade your plan to continue."
            )));
        }
        Ok(())
    }

    /// Per-model token and cost totals for the active window.
    pub async fn usage_report(&self, user_id: &str) -> Result<UsageReport, GateError> {
        let window = self.active_window(user_id).await?;
        let traces = self.telemetry.traces(user_id, window.from, window.to).await?;
        Ok(UsageReport {
            user_id: user_id.to_string(),
            window,
            models: summarize_traces(&traces),
        })
    }
}

/// Fold trace outputs into per-model totals. Responses without a model name
/// are skipped. `response_metadata.token_usage` wins over `usage_metadata`.
pub fn summarize_traces(traces: &[TraceRecord]) -> BTreeMap<String, ModelUsage> {
    let mut totals: BTreeMap<String, ModelUsage> = BTreeMap::new();

    for trace in traces {
        let Some(responses) = trace.output.get("response").and_then(Value::as_array) else {
            continue;
        };
        let mut costed = Vec::new();

        for response in responses {
            let metadata = &response["response_metadata"];
            let Some(model) = metadata["model_name"].as_str() else {
                continue;
            };
            let entry = totals.entry(model.to_string()).or_default();
            if !costed.iter().any(|m| m == model) {
                entry.total_cost += trace.total_cost;
                costed.push(model.to_string());
            }

            let (input, output, total) = if metadata["token_usage"].is_object() {
                let u = &metadata["token_usage"];
                (
                    u["prompt_tokens"].as_u64(),
                    u["completion_tokens"].as_u64(),
                    u["total_tokens"].as_u64(),
                )
            } else if response["usage_metadata"].is_object() {
                let u = &response["usage_metadata"];
                (
                    u["input_tokens"].as_u64(),
                    u["output_tokens"].as_u64(),
                    u["total_tokens"].as_u64(),
                )
            } else {
                warn!(model, "response without token usage");
                continue;
            };

            entry.total_input_tokens += input.unwrap_or(0);
            entry.total_output_tokens += output.unwrap_or(0);
            entry.total_tokens += total.unwrap_or(0);
        }
    }

    totals
}
