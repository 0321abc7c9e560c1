//! Token types and wire responses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Refresh this long before the access token actually expires.
pub const REFRESH_MARGIN_SECS: i64 = 30;

/// A complete token set owned by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access: String,
    pub refresh: String,
    pub expires_at: DateTime<Utc>,
    /// Origin the tokens were issued by, checked against `iss` callbacks.
    pub issuer: String,
}

impl TokenSet {
    /// Whether an authenticated call should refresh first.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// The triple hosts persist in their keychain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access: String,
    pub refresh: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&TokenSet> for StoredTokens {
    fn from(t: &TokenSet) -> Self {
        Self {
            access: t.access.clone(),
            refresh: t.refresh.clone(),
            expires_at: t.expires_at,
        }
    }
}

impl StoredTokens {
    pub fn into_token_set(self, issuer: &str) -> TokenSet {
        TokenSet {
            access: self.access,
            refresh: self.refresh,
            expires_at: self.expires_at,
            issuer: issuer.to_string(),
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Token endpoint error body (RFC 6749 §5.2).
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// A pending authorization: the URL to open plus everything needed to
/// validate and exchange the callback.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub url: String,
    pub state: String,
    pub verifier: String,
    pub redirect_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access: "a".into(),
            refresh: "r".into(),
            expires_at,
            issuer: "https://vpn.example.org".into(),
        }
    }

    #[test]
    fn refresh_margin_is_thirty_seconds() {
        let now = Utc::now();
        assert!(!tokens(now + Duration::seconds(31)).needs_refresh(now));
        assert!(tokens(now + Duration::seconds(29)).needs_refresh(now));
        assert!(tokens(now - Duration::seconds(1)).needs_refresh(now));
    }

    #[test]
    fn stored_tokens_round_trip() {
        let set = tokens(Utc::now());
        let stored = StoredTokens::from(&set);
        let back = stored.into_token_set(&set.issuer);
        assert_eq!(back, set);
    }

    #[test]
    fn token_response_tolerates_missing_refresh() {
        let resp: TokenResponse =
            serde_json::from_str(r#"{"access_token": "abc", "expires_in": 3600}"#).unwrap();
        assert_eq!(resp.access_token, "abc");
        assert!(resp.refresh_token.is_none());
        assert_eq!(resp.expires_in, Some(3600));
    }
}
