//! Rollback-resistant catalog cache.
//!
//! The effective version of each catalog never decreases: updates carrying
//! an older signed timestamp or a smaller document version are rejected and
//! leave the cache untouched.

use crate::types::{Cached, OrganizationListDoc, ServerListDoc};
use chrono::{DateTime, Duration, Utc};
use fedvpn_core::error::{CoreResult, Error};
use serde::{Deserialize, Serialize};

/// The server list is served from cache for this long after a fetch.
const SERVERS_FRESH_SECS: i64 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Cached<ServerListDoc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizations: Option<Cached<OrganizationListDoc>>,
    /// Set when a secure-internet authorization or removal invalidated the
    /// organization list; cleared by the next successful fetch.
    #[serde(default)]
    pub organizations_expired: bool,
}

impl DiscoveryCache {
    /// Whether the cached server list still satisfies its one-hour TTL.
    pub fn servers_fresh(&self, now: DateTime<Utc>) -> bool {
        self.servers
            .as_ref()
            .is_some_and(|c| now - c.fetched_at < Duration::seconds(SERVERS_FRESH_SECS))
    }

    /// The organization list has no TTL; it only goes stale when marked.
    pub fn organizations_fresh(&self) -> bool {
        self.organizations.is_some() && !self.organizations_expired
    }

    /// Mark the organization list expired (secure-internet authorization
    /// required, or a secure-internet server was removed).
    pub fn expire_organizations(&mut self) {
        self.organizations_expired = true;
    }

    /// Install a newly verified server list, enforcing rollback protection.
    pub fn update_servers(
        &mut self,
        document: ServerListDoc,
        signed_at: u64,
        last_modified: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        if let Some(current) = &self.servers {
            check_rollback(
                "server list",
                signed_at,
                current.signed_at,
                document.version,
                current.document.version,
            )?;
        }
        self.servers = Some(Cached {
            document,
            signed_at,
            fetched_at,
            last_modified,
        });
        Ok(())
    }

    /// Install a newly verified organization list.
    pub fn update_organizations(
        &mut self,
        document: OrganizationListDoc,
        signed_at: u64,
        last_modified: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        if let Some(current) = &self.organizations {
            check_rollback(
                "organization list",
                signed_at,
                current.signed_at,
                document.version,
                current.document.version,
            )?;
        }
        self.organizations = Some(Cached {
            document,
            signed_at,
            fetched_at,
            last_modified,
        });
        self.organizations_expired = false;
        Ok(())
    }

    /// A `304 Not Modified` answer refreshes only the fetch instant.
    pub fn touch_servers(&mut self, fetched_at: DateTime<Utc>) {
        if let Some(cached) = &mut self.servers {
            cached.fetched_at = fetched_at;
        }
    }

    pub fn touch_organizations(&mut self, fetched_at: DateTime<Utc>) {
        if let Some(cached) = &mut self.organizations {
            cached.fetched_at = fetched_at;
        }
        self.organizations_expired = false;
    }
}

fn check_rollback(
    what: &str,
    signed_at: u64,
    cached_signed_at: u64,
    version: u64,
    cached_version: u64,
) -> CoreResult<()> {
    if signed_at < cached_signed_at {
        return Err(Error::rollback(format!(
            "{what} signed at {signed_at}, cache holds {cached_signed_at}"
        )));
    }
    if version < cached_version {
        return Err(Error::rollback(format!(
            "{what} version {version} is older than cached {cached_version}"
        )));
    }
    Ok(())
}
