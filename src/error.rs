use crate::plan::PlanTier;

/// Everything that can stop a turn. Messages are shown to end users, so they
/// read as guidance rather than internals.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{0} value is required!")]
    Validation(String),
    #[error("invalid session: {0}")]
    Authentication(String),
    #[error("Please upgrade to access this {resource}.")]
    Entitlement {
        resource: &'static str,
        id: String,
        tier: PlanTier,
    },
    #[error("{0}")]
    Quota(String),
    #[error("No account found for provider_id {provider}. Connect your {provider} account first.")]
    AccountMissing { provider: String },
    #[error("Account scopes do not cover the scopes required by {connector}. Please re-authenticate with {provider}.")]
    Scope { connector: String, provider: String },
    #[error("Access token for provider_id {provider} has expired. Please sign in with {provider} again.")]
    ExpiredCredential { provider: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("connector error: {0}")]
    Connector(String),
    #[error("turn cancelled")]
    Cancelled,
}

impl GateError {
    /// Short machine tag, used in logs and admin responses.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Validation(_) => "validation",
            GateError::Authentication(_) => "authentication",
            GateError::Entitlement { .. } => "entitlement",
            GateError::Quota(_) => "quota",
            GateError::AccountMissing { .. } => "account_missing",
            GateError::Scope { .. } => "scope",
            GateError::ExpiredCredential { .. } => "expired_credential",
            GateError::Configuration(_) => "configuration",
            GateError::Upstream(_) => "upstream",
            GateError::Connector(_) => "connector",
            GateError::Cancelled => "cancelled",
        }
    }

    /// Text suitable for direct display in the chat client.
    pub fn user_message(&self) -> String {
        match self {
            GateError::Authentication(_) => {
                "Your session is invalid or has expired. Please sign in again.".into()
            }
            GateError::Configuration(_) | GateError::Upstream(_) => {
                "Something went wrong on our side. Please try again shortly.".into()
            }
            other => other.to_string(),
        }
    }
}

/// Failure reading from one of the external stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by the agent executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("cancelled")]
    Cancelled,
}

/// Failure talking to a connector during tool discovery or a tool call.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{connector}: request failed: {message}")]
    Request { connector: String, message: String },
    #[error("{connector}: server returned {status}: {body}")]
    ApiError {
        connector: String,
        status: u16,
        body: String,
    },
    #[error("{connector}: {message}")]
    Protocol { connector: String, message: String },
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        GateError::Upstream(e.to_string())
    }
}

impl From<DiscoveryError> for GateError {
    fn from(e: DiscoveryError) -> Self {
        GateError::Connector(e.to_string())
    }
}

impl From<ExecutorError> for GateError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Cancelled => GateError::Cancelled,
            other => GateError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_message_prompts_upgrade() {
        let err = GateError::Entitlement {
            resource: "model",
            id: "gpt-4.1".into(),
            tier: PlanTier::Basic,
        };
        assert_eq!(err.user_message(), "Please upgrade to access this model.");
        assert_eq!(err.kind(), "entitlement");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = GateError::Configuration("Multiple active subscriptions found".into());
        assert!(!err.user_message().contains("Multiple"));
        let err: GateError = StoreError::Unavailable("db down".into()).into();
        assert_eq!(err.kind(), "upstream");
    }

    #[test]
    fn validation_names_the_field() {
        let err = GateError::Validation("session_id".into());
        assert_eq!(err.user_message(), "session_id value is required!");
    }
}
