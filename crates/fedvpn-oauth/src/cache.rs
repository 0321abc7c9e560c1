//! Token cache with host keychain bridging.
//!
//! Tokens are cached per server key. Authenticated calls go through
//! [`TokenCache::ensure_valid`], which holds the entry's lock across the
//! check-and-refresh so concurrent calls produce at most one refresh
//! round-trip against the token endpoint.

use crate::flow;
use crate::types::{StoredTokens, TokenSet};
use chrono::Utc;
use fedvpn_core::error::{CoreResult, Error};
use fedvpn_core::http::HttpClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Host-side token persistence (OS keychain or similar).
///
/// `get` is consulted before every authenticated call so host-stored tokens
/// win; `set` fires after every successful acquisition, ordered per key.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredTokens>;
    fn set(&self, key: &str, tokens: StoredTokens);
}

#[derive(Debug, Default)]
struct EntryState {
    tokens: Option<TokenSet>,
    /// Set after a 401: the next ensure refreshes no matter the expiry.
    force_refresh: bool,
}

type Entry = Arc<Mutex<EntryState>>;

/// In-memory token cache keyed by `(type, identifier)` strings.
#[derive(Clone, Default)]
pub struct TokenCache {
    entries: Arc<std::sync::Mutex<HashMap<String, Entry>>>,
    store: Option<Arc<dyn TokenStore>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.entries)
            .field("store", &self.store.as_ref().map(|_| "<dyn TokenStore>"))
            .finish()
    }
}

impl TokenCache {
    pub fn new(store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            entries: Arc::default(),
            store,
        }
    }

    fn entry(&self, key: &str) -> Entry {
        let mut map = self.entries.lock().expect("token cache lock poisoned");
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    /// Install freshly exchanged tokens and notify the host.
    pub async fn put(&self, key: &str, tokens: TokenSet) {
        let entry = self.entry(key);
        {
            let mut guard = entry.lock().await;
            guard.tokens = Some(tokens.clone());
            guard.force_refresh = false;
        }
        if let Some(store) = &self.store {
            store.set(key, StoredTokens::from(&tokens));
        }
    }

    pub async fn get(&self, key: &str) -> Option<TokenSet> {
        self.entry(key).lock().await.tokens.clone()
    }

    /// Drop tokens (renew-session, deregistration).
    pub async fn clear(&self, key: &str) {
        let entry = self.entry(key);
        let mut guard = entry.lock().await;
        guard.tokens = None;
        guard.force_refresh = false;
    }

    /// Force the next [`Self::ensure_valid`] to refresh (after a 401).
    pub async fn mark_expired(&self, key: &str) {
        self.entry(key).lock().await.force_refresh = true;
    }

    /// A valid access-token set for `key`, refreshing when within the
    /// refresh margin. Returns `TokensInvalid` when no usable tokens exist.
    pub async fn ensure_valid(
        &self,
        key: &str,
        http: &HttpClient,
        token_endpoint: &str,
        client_id: &str,
        issuer: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<TokenSet> {
        let entry = self.entry(key);
        // Held across the refresh round-trip: the single-flight guarantee.
        let mut guard = entry.lock().await;

        // Host-stored tokens win over the in-memory copy.
        if let Some(store) = &self.store {
            if let Some(stored) = store.get(key) {
                let differs = guard
                    .tokens
                    .as_ref()
                    .map(|t| StoredTokens::from(t) != stored)
                    .unwrap_or(true);
                if differs {
                    debug!(key, "adopting host-stored tokens");
                    guard.tokens = Some(stored.into_token_set(issuer));
                }
            }
        }

        let Some(current) = guard.tokens.clone() else {
            return Err(Error::tokens_invalid(format!("no tokens for '{key}'")));
        };

        if !guard.force_refresh && !current.needs_refresh(Utc::now()) {
            return Ok(current);
        }

        let refreshed = flow::refresh_tokens(http, token_endpoint, client_id, &current, cancel).await?;
        guard.tokens = Some(refreshed.clone());
        guard.force_refresh = false;
        if let Some(store) = &self.store {
            store.set(key, StoredTokens::from(&refreshed));
        }
        Ok(refreshed)
    }
}
