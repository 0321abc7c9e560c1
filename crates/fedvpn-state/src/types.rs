//! The state-file schema (v2).

use fedvpn_discovery::cache::DiscoveryCache;
use fedvpn_server::types::{ServerKey, ServerRecord, ServerType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STATE_VERSION: u64 = 2;

fn state_version() -> u64 {
    STATE_VERSION
}

/// `state.json`, version 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default = "state_version")]
    pub version: u64,
    /// Server records keyed by `<type>,<identifier>`.
    #[serde(default)]
    pub server_list: BTreeMap<String, ServerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chosen_id: Option<String>,
    #[serde(default)]
    pub discovery: DiscoveryCache,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            server_list: BTreeMap::new(),
            last_chosen_id: None,
            discovery: DiscoveryCache::default(),
        }
    }
}

impl StateFile {
    pub fn server(&self, key: &ServerKey) -> Option<&ServerRecord> {
        self.server_list.get(&key.storage_key())
    }

    pub fn server_mut(&mut self, key: &ServerKey) -> Option<&mut ServerRecord> {
        self.server_list.get_mut(&key.storage_key())
    }

    pub fn insert_server(&mut self, key: &ServerKey, record: ServerRecord) {
        self.server_list.insert(key.storage_key(), record);
    }

    pub fn remove_server(&mut self, key: &ServerKey) -> Option<ServerRecord> {
        let storage_key = key.storage_key();
        if self.last_chosen_id.as_deref() == Some(storage_key.as_str()) {
            self.last_chosen_id = None;
        }
        self.server_list.remove(&storage_key)
    }

    /// The secure-internet record, if one exists (at most one may).
    pub fn secure_internet(&self) -> Option<(ServerKey, &ServerRecord)> {
        self.server_list.iter().find_map(|(k, record)| {
            let key = ServerKey::parse(k).ok()?;
            (key.server_type == ServerType::SecureInternet).then_some((key, record))
        })
    }

    pub fn set_last_chosen(&mut self, key: &ServerKey) {
        self.last_chosen_id = Some(key.storage_key());
    }

    pub fn last_chosen(&self) -> Option<ServerKey> {
        self.last_chosen_id
            .as_deref()
            .and_then(|id| ServerKey::parse(id).ok())
    }
}
