use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::GateError;

/// Process settings. Read from the environment (and an optional `.env`),
/// keys case-insensitive, unknown keys ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database_url: String,
    pub google_api_key: Option<String>,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub azure_inference_credential: String,
    pub azure_inference_endpoint: String,
    #[serde(default = "default_azure_api_version")]
    pub azure_api_version: String,
    pub telemetry_host: Option<String>,
    pub telemetry_public_key: Option<String>,
    pub telemetry_secret_key: Option<String>,
    /// Upper bound on one executor call. Unset means no bound.
    #[serde(default, deserialize_with = "deserialize_opt_u64_from_any")]
    pub executor_timeout_secs: Option<u64>,
    /// How long a resolved plan stays memoized. Unset keeps it until invalidated.
    #[serde(default, deserialize_with = "deserialize_opt_u64_from_any")]
    pub plan_cache_ttl_secs: Option<u64>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_azure_api_version() -> String {
    "2025-01-01-preview".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// OAuth client credentials forwarded to connectors that refresh tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, GateError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, GateError> {
        let map: Map<String, Value> = vars
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), Value::String(v)))
            .collect();
        serde_json::from_value(Value::Object(map))
            .map_err(|e| GateError::Configuration(format!("invalid settings: {e}")))
    }

    pub fn google_oauth(&self) -> OAuthClient {
        OAuthClient {
            client_id: self.google_client_id.clone(),
            client_secret: self.google_client_secret.clone(),
        }
    }

    pub fn executor_timeout(&self) -> Option<Duration> {
        self.executor_timeout_secs.map(Duration::from_secs)
    }

    pub fn plan_cache_ttl(&self) -> Option<Duration> {
        self.plan_cache_ttl_secs.map(Duration::from_secs)
    }

    /// Telemetry host and key pair, when all three are configured.
    pub fn telemetry(&self) -> Option<(&str, &str, &str)> {
        Some((
            self.telemetry_host.as_deref()?,
            self.telemetry_public_key.as_deref()?,
            self.telemetry_secret_key.as_deref()?,
        ))
    }
}

fn deserialize_opt_u64_from_any<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OptU64Visitor;

    impl<'de> Visitor<'de> for OptU64Visitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an unsigned integer or a numeric string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(value))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<u64>().map(Some).map_err(E::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(OptU64Visitor)
}

/// Minimal settings for tests and local runs without an environment.
impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            google_api_key: None,
            google_client_id: String::new(),
            google_client_secret: String::new(),
            azure_inference_credential: String::new(),
            azure_inference_endpoint: String::new(),
            azure_api_version: default_azure_api_version(),
            telemetry_host: None,
            telemetry_public_key: None,
            telemetry_secret_key: None,
            executor_timeout_secs: None,
            plan_cache_ttl_secs: None,
            log_filter: default_log_filter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GOOGLE_CLIENT_ID", "cid"),
            ("GOOGLE_CLIENT_SECRET", "secret"),
            ("AZURE_INFERENCE_CREDENTIAL", "cred"),
            ("AZURE_INFERENCE_ENDPOINT", "https://example.azure.com"),
        ]
    }

    #[test]
    fn keys_are_case_insensitive_and_numbers_parse() {
        let mut pairs = required();
        pairs.push(("Executor_Timeout_Secs", "45"));
        pairs.push(("PATH", "/usr/bin"));
        let settings = Settings::from_vars(vars(&pairs)).unwrap();
        assert_eq!(settings.google_oauth().client_id, "cid");
        assert_eq!(settings.executor_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(settings.plan_cache_ttl(), None);
        assert_eq!(settings.azure_api_version, "2025-01-01-preview");
        assert!(settings.telemetry().is_none());
    }

    #[test]
    fn missing_required_key_is_configuration_error() {
        let err = Settings::from_vars(vars(&[("GOOGLE_CLIENT_ID", "cid")])).unwrap_err();
        assert!(matches!(err, GateError::Configuration(_)));
    }

    #[test]
    fn bad_number_is_rejected() {
        let mut pairs = required();
        pairs.push(("PLAN_CACHE_TTL_SECS", "soon"));
        assert!(Settings::from_vars(vars(&pairs)).is_err());
    }
}
