//! v1 → v2 state migration.
//!
//! The v1 file bundled a large raw discovery dump with per-variant server
//! maps. Migration keeps what still matters (the server set, profile
//! choices, the secure-internet country) and drops the legacy discovery
//! blob; a fresh one is fetched on the next refresh. Unknown per-server
//! flags like `delisted` are carried along but never acted upon.

use crate::types::StateFile;
use fedvpn_server::types::{ProfileInfo, ServerKey, ServerRecord, ServerType};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct StateFileV1 {
    #[serde(default)]
    servers: V1Servers,
    // The legacy raw discovery dump ("organizations", "servers_discovery")
    // is intentionally not modeled: it is dropped wholesale.
}

#[derive(Debug, Default, Deserialize)]
struct V1Servers {
    #[serde(default)]
    institute_servers: BTreeMap<String, V1Server>,
    #[serde(default)]
    custom_servers: BTreeMap<String, V1Server>,
    #[serde(default)]
    secure_internet_home: Option<V1SecureInternet>,
}

#[derive(Debug, Default, Deserialize)]
struct V1Server {
    #[serde(default)]
    profiles: V1Profiles,
    #[serde(default)]
    delisted: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct V1Profiles {
    #[serde(default)]
    current_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
struct V1SecureInternet {
    org_id: String,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    current_profiles: BTreeMap<String, String>,
    #[serde(default)]
    delisted: Option<bool>,
}

/// Whether a raw state value is a v1 file.
pub fn is_v1(value: &serde_json::Value) -> bool {
    match value.get("version").and_then(|v| v.as_u64()) {
        Some(v) => v < 2,
        None => value.get("servers").is_some() || value.get("server_list").is_none(),
    }
}

/// Build a v2 state from a parsed v1 value.
pub fn migrate_v1(value: serde_json::Value) -> StateFile {
    let v1: StateFileV1 = serde_json::from_value(value).unwrap_or_default();
    let mut state = StateFile::default();

    for (url, server) in v1.servers.institute_servers {
        let key = ServerKey::new(ServerType::InstituteAccess, url);
        state.insert_server(&key, record_from_v1(server));
    }
    for (url, server) in v1.servers.custom_servers {
        let key = ServerKey::new(ServerType::Custom, url);
        state.insert_server(&key, record_from_v1(server));
    }
    if let Some(home) = v1.servers.secure_internet_home {
        let key = ServerKey::new(ServerType::SecureInternet, home.org_id.clone());
        let current = home
            .country_code
            .as_deref()
            .and_then(|cc| home.current_profiles.get(cc))
            .cloned();
        let record = ServerRecord {
            profiles: ProfileInfo {
                current,
                profile_list: vec![],
            },
            country_code: home.country_code,
            profile_by_country: home.current_profiles,
            delisted: home.delisted,
            ..ServerRecord::default()
        };
        state.insert_server(&key, record);
    }

    info!(
        servers = state.server_list.len(),
        "migrated v1 state file to v2"
    );
    state
}

fn record_from_v1(server: V1Server) -> ServerRecord {
    ServerRecord {
        profiles: ProfileInfo {
            current: server.profiles.current_profile,
            profile_list: vec![],
        },
        delisted: server.delisted,
        ..ServerRecord::default()
    }
}
