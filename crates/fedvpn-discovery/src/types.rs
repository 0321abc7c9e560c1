//! Wire documents and cached-catalog types for discovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A display string that may come as a plain string or a language map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Translated {
    Single(String),
    Map(BTreeMap<String, String>),
}

impl Default for Translated {
    fn default() -> Self {
        Self::Single(String::new())
    }
}

impl Translated {
    /// Best translation for display: exact language tag, then an `en`
    /// prefix, then whatever the map yields first.
    pub fn best(&self, lang: &str) -> &str {
        match self {
            Self::Single(s) => s,
            Self::Map(map) => {
                if let Some(s) = map.get(lang) {
                    return s;
                }
                if let Some((_, s)) = map.iter().find(|(k, _)| k.starts_with("en")) {
                    return s;
                }
                map.values().next().map(String::as_str).unwrap_or("")
            }
        }
    }

    /// All values, for search scoring.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(s) => vec![s.as_str()],
            Self::Map(map) => map.values().map(String::as_str).collect(),
        }
    }
}

/// Variant tag used by the server catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryServerType {
    InstituteAccess,
    SecureInternet,
    /// Forward compatibility with catalog entries this build does not know.
    #[serde(other)]
    Unknown,
}

/// One entry of `server_list.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryServer {
    pub base_url: String,
    pub server_type: DiscoveryServerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default)]
    pub display_name: Translated,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_list: Option<Translated>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub support_contact: Vec<String>,
}

/// One entry of `organization_list.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    #[serde(default)]
    pub display_name: Translated,
    pub secure_internet_home: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_list: Option<Translated>,
}

/// `server_list.json` as published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerListDoc {
    #[serde(rename = "v", default)]
    pub version: u64,
    #[serde(default)]
    pub server_list: Vec<DiscoveryServer>,
}

/// `organization_list.json` as published.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrganizationListDoc {
    #[serde(rename = "v", default)]
    pub version: u64,
    #[serde(default)]
    pub organization_list: Vec<Organization>,
}

/// A verified catalog plus the metadata needed for conditional refresh and
/// rollback detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cached<T> {
    pub document: T,
    /// Unix timestamp from the signature's trusted comment.
    pub signed_at: u64,
    pub fetched_at: DateTime<Utc>,
    /// `Last-Modified` response header, replayed as `If-Modified-Since`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl ServerListDoc {
    pub fn by_url(&self, base_url: &str, server_type: DiscoveryServerType) -> Option<&DiscoveryServer> {
        self.server_list
            .iter()
            .find(|s| s.server_type == server_type && s.base_url == base_url)
    }

    /// Secure-internet entry for a country code.
    pub fn by_country_code(&self, country_code: &str) -> Option<&DiscoveryServer> {
        self.server_list.iter().find(|s| {
            s.server_type == DiscoveryServerType::SecureInternet
                && s.country_code.as_deref() == Some(country_code)
        })
    }

    /// All secure-internet country codes, sorted.
    pub fn country_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .server_list
            .iter()
            .filter(|s| s.server_type == DiscoveryServerType::SecureInternet)
            .filter_map(|s| s.country_code.clone())
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }
}

impl OrganizationListDoc {
    pub fn by_id(&self, org_id: &str) -> Option<&Organization> {
        self.organization_list.iter().find(|o| o.org_id == org_id)
    }
}
