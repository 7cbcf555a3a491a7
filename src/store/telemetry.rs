use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::debug;

use super::types::{TokenQuery, TraceRecord};
use super::TelemetryStore;
use crate::error::StoreError;

/// Langfuse-style public metrics API over HTTP.
pub struct HttpTelemetryStore {
    client: reqwest::Client,
    base_url: String,
    public_key: String,
    secret_key: String,
}

impl HttpTelemetryStore {
    pub fn new(
        base_url: impl Into<String>,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, StoreError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url.trim_end_matches('/')))
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .query(params)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        if status != 200 {
            return Err(StoreError::ApiError { status, body: text });
        }

        serde_json::from_str(&text).map_err(|e| StoreError::Parse(e.to_string()))
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sum `totalUsage` over the daily buckets, optionally for one model.
/// Returns `None` when no bucket matched.
fn sum_daily_usage(body: &Value, model: Option<&str>) -> Option<u64> {
    let mut total = None;
    for day in body["data"].as_array().into_iter().flatten() {
        for usage in day["usage"].as_array().into_iter().flatten() {
            if model.is_some_and(|m| usage["model"].as_str() != Some(m)) {
                continue;
            }
            let tokens = usage["totalUsage"].as_u64().unwrap_or(0);
            *total.get_or_insert(0) += tokens;
        }
    }
    total
}

#[async_trait]
impl TelemetryStore for HttpTelemetryStore {
    async fn sum_tokens(&self, query: &TokenQuery) -> Result<Option<u64>, StoreError> {
        let mut params = vec![
            ("userId", query.user_id.clone()),
            ("fromTimestamp", timestamp(query.from)),
            ("toTimestamp", timestamp(query.to)),
        ];
        if let Some(ref session) = query.session_id {
            params.push(("tags", session.clone()));
        }
        let body = self.get("/api/public/metrics/daily", &params).await?;
        let total = sum_daily_usage(&body, query.model.as_deref());
        debug!(user_id = %query.user_id, model = ?query.model, ?total, "telemetry token sum");
        Ok(total)
    }

    async fn traces(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TraceRecord>, StoreError> {
        let params = [
            ("userId", user_id.to_string()),
            ("fromTimestamp", timestamp(from)),
            ("toTimestamp", timestamp(to)),
        ];
        let body = self.get("/api/public/traces", &params).await?;
        Ok(body["data"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|t| TraceRecord {
                total_cost: t["totalCost"].as_f64().unwrap_or(0.0),
                output: t["output"].clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Value {
        json!({
            "data": [
                { "date": "2025-06-01", "usage": [
                    { "model": "gpt-4.1", "totalUsage": 120 },
                    { "model": "gpt-4.1-mini", "totalUsage": 30 }
                ]},
                { "date": "2025-06-02", "usage": [
                    { "model": "gpt-4.1", "totalUsage": 80 }
                ]}
            ]
        })
    }

    #[test]
    fn sums_one_model() {
        assert_eq!(sum_daily_usage(&body(), Some("gpt-4.1")), Some(200));
    }

    #[test]
    fn sums_all_models() {
        assert_eq!(sum_daily_usage(&body(), None), Some(230));
    }

    #[test]
    fn missing_data_is_none() {
        assert_eq!(sum_daily_usage(&json!({}), None), None);
        assert_eq!(sum_daily_usage(&body(), Some("gemini-flash")), None);
    }
}
