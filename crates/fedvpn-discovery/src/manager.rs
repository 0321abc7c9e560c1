//! Discovery manager: fetch, verify, cache, refresh.
//!
//! The cache sits behind a read/write lock. Refreshes clone the cache under
//! a read lock, do all network and verification work on the clone, and swap
//! the result back under a short write lock, so readers only ever block for
//! the swap.

use crate::cache::DiscoveryCache;
use crate::keys::{DISCOVERY_ROOT, ORGANIZATION_LIST_FILE, SERVER_LIST_FILE, TRUSTED_KEYS};
use crate::search;
use crate::signature;
use crate::types::{
    DiscoveryServer, DiscoveryServerType, Organization, OrganizationListDoc, ServerListDoc,
};
use chrono::Utc;
use fedvpn_core::error::{CoreResult, Error, ErrorKind};
use fedvpn_core::http::HttpClient;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A catalog handed to the caller: the freshest available document, a
/// staleness marker, and the non-fatal error that kept it stale, if any.
#[derive(Debug, Clone)]
pub struct CatalogResult<T> {
    pub document: T,
    pub stale: bool,
    pub warning: Option<Error>,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    http: HttpClient,
    root: String,
    trusted_keys: Vec<String>,
    cache: Arc<RwLock<DiscoveryCache>>,
}

impl Discovery {
    /// Manager against the production discovery root.
    pub fn new(http: HttpClient) -> Self {
        Self::with_root(http, DISCOVERY_ROOT, TRUSTED_KEYS)
    }

    /// Manager against a custom root and key set.
    pub fn with_root(http: HttpClient, root: &str, trusted_keys: &[&str]) -> Self {
        Self {
            http,
            root: root.trim_end_matches('/').to_string() + "/",
            trusted_keys: trusted_keys.iter().map(|k| k.to_string()).collect(),
            cache: Arc::new(RwLock::new(DiscoveryCache::default())),
        }
    }

    /// Replace the cache wholesale (loaded from persisted state).
    pub async fn restore(&self, cache: DiscoveryCache) {
        *self.cache.write().await = cache;
    }

    /// Snapshot for persistence.
    pub async fn snapshot(&self) -> DiscoveryCache {
        self.cache.read().await.clone()
    }

    /// Invalidate the organization list (secure-internet authorization
    /// needed, or such a server was removed).
    pub async fn expire_organizations(&self) {
        self.cache.write().await.expire_organizations();
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// Refresh the server list if the network allows it.
    pub async fn refresh_servers(&self, cancel: &CancellationToken) -> CoreResult<()> {
        let mut clone = self.cache.read().await.clone();
        let since = clone.servers.as_ref().and_then(|c| c.last_modified.clone());

        match self
            .fetch_verified::<ServerListDoc>(SERVER_LIST_FILE, since.as_deref(), cancel)
            .await?
        {
            Fetched::NotModified => clone.touch_servers(Utc::now()),
            Fetched::Document(doc, signed_at, last_modified) => {
                clone.update_servers(doc, signed_at, last_modified, Utc::now())?
            }
        }

        let mut live = self.cache.write().await;
        if let Some(new) = clone.servers.take() {
            // A concurrent refresh may have advanced the live cache past the
            // clone; the non-decreasing version invariant wins over the swap.
            let acceptable = match &live.servers {
                Some(current) => {
                    new.signed_at >= current.signed_at
                        && new.document.version >= current.document.version
                }
                None => true,
            };
            if acceptable {
                live.servers = Some(new);
            }
        }
        Ok(())
    }

    /// Refresh the organization list if the network allows it.
    pub async fn refresh_organizations(&self, cancel: &CancellationToken) -> CoreResult<()> {
        let mut clone = self.cache.read().await.clone();
        let since = clone
            .organizations
            .as_ref()
            .and_then(|c| c.last_modified.clone());

        match self
            .fetch_verified::<OrganizationListDoc>(ORGANIZATION_LIST_FILE, since.as_deref(), cancel)
            .await?
        {
            Fetched::NotModified => clone.touch_organizations(Utc::now()),
            Fetched::Document(doc, signed_at, last_modified) => {
                clone.update_organizations(doc, signed_at, last_modified, Utc::now())?
            }
        }

        let mut live = self.cache.write().await;
        if let Some(new) = clone.organizations.take() {
            let acceptable = match &live.organizations {
                Some(current) => {
                    new.signed_at >= current.signed_at
                        && new.document.version >= current.document.version
                }
                None => true,
            };
            if acceptable {
                live.organizations = Some(new);
                live.organizations_expired = clone.organizations_expired;
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    /// The server list; refreshed when its TTL lapsed, served stale with a
    /// warning when the refresh fails.
    pub async fn servers(&self, cancel: &CancellationToken) -> CoreResult<CatalogResult<ServerListDoc>> {
        let fresh = self.cache.read().await.servers_fresh(Utc::now());
        let mut warning = None;
        if !fresh {
            if let Err(e) = self.refresh_servers(cancel).await {
                if e.kind == ErrorKind::Cancelled {
                    return Err(e);
                }
                warn!("server list refresh failed, serving cache: {e}");
                warning = Some(e);
            }
        }

        let guard = self.cache.read().await;
        match &guard.servers {
            Some(cached) => Ok(CatalogResult {
                document: cached.document.clone(),
                stale: !guard.servers_fresh(Utc::now()),
                warning,
            }),
            None => Err(Error::discovery_unavailable(
                warning.unwrap_or_else(|| Error::internal("no cached server list")),
            )),
        }
    }

    /// The organization list; fetched when absent or marked expired.
    pub async fn organizations(
        &self,
        cancel: &CancellationToken,
    ) -> CoreResult<CatalogResult<OrganizationListDoc>> {
        let fresh = self.cache.read().await.organizations_fresh();
        let mut warning = None;
        if !fresh {
            if let Err(e) = self.refresh_organizations(cancel).await {
                if e.kind == ErrorKind::Cancelled {
                    return Err(e);
                }
                warn!("organization list refresh failed, serving cache: {e}");
                warning = Some(e);
            }
        }

        let guard = self.cache.read().await;
        match &guard.organizations {
            Some(cached) => Ok(CatalogResult {
                document: cached.document.clone(),
                stale: !guard.organizations_fresh(),
                warning,
            }),
            None => Err(Error::discovery_unavailable(
                warning.unwrap_or_else(|| Error::internal("no cached organization list")),
            )),
        }
    }

    // ── Lookups (cache only) ─────────────────────────────────────

    pub async fn server_by_url(
        &self,
        base_url: &str,
        server_type: DiscoveryServerType,
    ) -> CoreResult<DiscoveryServer> {
        let guard = self.cache.read().await;
        guard
            .servers
            .as_ref()
            .and_then(|c| c.document.by_url(base_url, server_type))
            .cloned()
            .ok_or_else(|| Error::internal(format!("server '{base_url}' is not in the discovery list")))
    }

    pub async fn server_by_country_code(&self, country_code: &str) -> CoreResult<DiscoveryServer> {
        let guard = self.cache.read().await;
        guard
            .servers
            .as_ref()
            .and_then(|c| c.document.by_country_code(country_code))
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!("no secure-internet server for country '{country_code}'"))
            })
    }

    pub async fn organization_by_id(&self, org_id: &str) -> CoreResult<Organization> {
        let guard = self.cache.read().await;
        guard
            .organizations
            .as_ref()
            .and_then(|c| c.document.by_id(org_id))
            .cloned()
            .ok_or_else(|| Error::internal(format!("organization '{org_id}' is not in the discovery list")))
    }

    /// Resolve an organization's secure-internet home into its catalog entry.
    pub async fn secure_home_args(
        &self,
        org_id: &str,
    ) -> CoreResult<(Organization, DiscoveryServer)> {
        let org = self.organization_by_id(org_id).await?;
        let guard = self.cache.read().await;
        let server = guard
            .servers
            .as_ref()
            .and_then(|c| {
                c.document
                    .by_url(&org.secure_internet_home, DiscoveryServerType::SecureInternet)
            })
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!(
                    "organization '{org_id}' points at '{}' which is not a listed secure-internet server",
                    org.secure_internet_home
                ))
            })?;
        Ok((org, server))
    }

    pub async fn search_servers(&self, query: &str) -> Vec<DiscoveryServer> {
        let guard = self.cache.read().await;
        match &guard.servers {
            Some(cached) => search::search_servers(&cached.document, query)
                .into_iter()
                .cloned()
                .collect(),
            None => vec![],
        }
    }

    pub async fn search_organizations(&self, query: &str) -> Vec<Organization> {
        let guard = self.cache.read().await;
        match &guard.organizations {
            Some(cached) => search::search_organizations(&cached.document, query)
                .into_iter()
                .cloned()
                .collect(),
            None => vec![],
        }
    }

    // ── Fetch + verify ───────────────────────────────────────────

    async fn fetch_verified<T: serde::de::DeserializeOwned>(
        &self,
        file: &str,
        if_modified_since: Option<&str>,
        cancel: &CancellationToken,
    ) -> CoreResult<Fetched<T>> {
        let url = format!("{}{}", self.root, file);
        let resp = self
            .http
            .get_if_modified_since(&url, if_modified_since, cancel)
            .await?;
        if resp.is_not_modified() {
            debug!(%url, "catalog not modified");
            return Ok(Fetched::NotModified);
        }
        if !resp.is_success() {
            return Err(Error::unreachable(format!(
                "discovery returned HTTP {} for {url}",
                resp.status
            )));
        }

        let sig_url = format!("{url}.minisig");
        let sig_resp = self.http.get(&sig_url, cancel).await?;
        if !sig_resp.is_success() {
            return Err(Error::unreachable(format!(
                "discovery returned HTTP {} for {sig_url}",
                sig_resp.status
            )));
        }

        let keys: Vec<&str> = self.trusted_keys.iter().map(String::as_str).collect();
        let meta = signature::verify(&sig_resp.text()?, &resp.body, file, &keys)?;
        let document: T = resp.json()?;
        Ok(Fetched::Document(document, meta.timestamp, resp.last_modified))
    }
}

enum Fetched<T> {
    NotModified,
    Document(T, u64, Option<String>),
}
