use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::OAuthClient;
use crate::store::Account;

/// How credentials for a provider are forwarded to its connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPolicy {
    /// Expiring access tokens; the connector may refresh them itself, so it
    /// gets the refresh token and our OAuth client credentials too.
    Google,
    /// Long-lived token, forwarded as is.
    Generic,
}

impl ProviderPolicy {
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "google" => ProviderPolicy::Google,
            _ => ProviderPolicy::Generic,
        }
    }

    pub fn tokens_expire(&self) -> bool {
        matches!(self, ProviderPolicy::Google)
    }

    pub fn is_expired(&self, account: &Account, now: DateTime<Utc>) -> bool {
        self.tokens_expire()
            && account
                .access_token_expires_at
                .is_some_and(|expires| expires < now)
    }

    /// Provider headers for `account`, merged over `base`.
    pub fn headers(
        &self,
        account: &Account,
        oauth: &OAuthClient,
        mut base: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut put = |k: &str, v: Option<&str>| {
            if let Some(v) = v {
                base.insert(k.to_string(), v.to_string());
            }
        };

        match self {
            ProviderPolicy::Google => {
                let expires = account.access_token_expires_at.map(|t| t.to_rfc3339());
                put("X-ACCESS-TOKEN", account.access_token.as_deref());
                put("X-REFRESH-TOKEN", account.refresh_token.as_deref());
                put("X-SCOPES", account.scope.as_deref());
                put("X-ACCESS-TOKEN-EXPIRES-AT", expires.as_deref());
                put("X-CLIENT-ID", Some(oauth.client_id.as_str()));
                put("X-CLIENT-SECRET", Some(oauth.client_secret.as_str()));
            }
            ProviderPolicy::Generic => {
                put("X-ACCESS-TOKEN", account.access_token.as_deref());
            }
        }
        base
    }
}

/// Header every connector request carries: the caller's own session.
pub fn session_headers(session_token: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        "Authorization".to_string(),
        format!("Bearer {session_token}"),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account() -> Account {
        Account {
            user_id: "u1".into(),
            provider_id: "google".into(),
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            access_token_expires_at: Some(Utc::now() + Duration::hours(1)),
            scope: Some("drive,calendar".into()),
        }
    }

    fn oauth() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: "cs".into(),
        }
    }

    #[test]
    fn google_forwards_full_credential_set() {
        let h = ProviderPolicy::Google.headers(&account(), &oauth(), session_headers("tok"));
        assert_eq!(h["Authorization"], "Bearer tok");
        assert_eq!(h["X-ACCESS-TOKEN"], "at");
        assert_eq!(h["X-REFRESH-TOKEN"], "rt");
        assert_eq!(h["X-SCOPES"], "drive,calendar");
        assert_eq!(h["X-CLIENT-ID"], "cid");
        assert_eq!(h["X-CLIENT-SECRET"], "cs");
        assert!(h.contains_key("X-ACCESS-TOKEN-EXPIRES-AT"));
    }

    #[test]
    fn generic_forwards_access_token_only() {
        let h = ProviderPolicy::for_provider("notion").headers(
            &account(),
            &oauth(),
            session_headers("tok"),
        );
        assert_eq!(h.len(), 2);
        assert_eq!(h["X-ACCESS-TOKEN"], "at");
    }

    #[test]
    fn only_expiring_providers_check_expiry() {
        let mut acc = account();
        acc.access_token_expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(ProviderPolicy::Google.is_expired(&acc, Utc::now()));
        assert!(!ProviderPolicy::Generic.is_expired(&acc, Utc::now()));
        acc.access_token_expires_at = None;
        assert!(!ProviderPolicy::Google.is_expired(&acc, Utc::now()));
    }
}
