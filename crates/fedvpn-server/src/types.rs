//! Server variants, profile catalogs, and the persisted server record.

use chrono::{DateTime, Utc};
use fedvpn_discovery::types::Translated;
use fedvpn_core::error::{CoreResult, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The three server variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    /// Run by a single institution; identified by its canonical URL.
    InstituteAccess,
    /// Roaming federation access; identified by the organization id.
    SecureInternet,
    /// User-entered URL outside the catalogs.
    Custom,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstituteAccess => "institute_access",
            Self::SecureInternet => "secure_internet",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "institute_access" => Ok(Self::InstituteAccess),
            "secure_internet" => Ok(Self::SecureInternet),
            "custom" => Ok(Self::Custom),
            other => Err(Error::internal(format!("unknown server type '{other}'"))),
        }
    }

    /// Whether the identifier is a URL (institute/custom) or an org id.
    pub fn identified_by_url(&self) -> bool {
        !matches!(self, Self::SecureInternet)
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map key of a server record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub server_type: ServerType,
    pub identifier: String,
}

impl ServerKey {
    pub fn new(server_type: ServerType, identifier: impl Into<String>) -> Self {
        Self {
            server_type,
            identifier: identifier.into(),
        }
    }

    /// `<type>,<identifier>` as used in the state file and token cache.
    pub fn storage_key(&self) -> String {
        format!("{},{}", self.server_type.as_str(), self.identifier)
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        let (server_type, identifier) = s
            .split_once(',')
            .ok_or_else(|| Error::internal(format!("malformed server key '{s}'")))?;
        Ok(Self {
            server_type: ServerType::parse(server_type)?,
            identifier: identifier.to_string(),
        })
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.server_type, self.identifier)
    }
}

/// Tunnel protocols a profile may allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    OpenVpn,
    WireGuard,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenVpn => write!(f, "openvpn"),
            Self::WireGuard => write!(f, "wireguard"),
        }
    }
}

/// One profile from the portal's `/info` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: String,
    #[serde(default)]
    pub display_name: Translated,
    #[serde(default)]
    pub vpn_proto_list: Vec<Protocol>,
    #[serde(default)]
    pub default_gateway: bool,
}

impl Profile {
    /// Whether the profile can be used with any of the client's protocols.
    pub fn supported_by(&self, client_protocols: &[Protocol]) -> bool {
        self.vpn_proto_list.is_empty()
            || self.vpn_proto_list.iter().any(|p| client_protocols.contains(p))
    }
}

/// The profile catalog plus the remembered choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(default)]
    pub profile_list: Vec<Profile>,
}

impl ProfileInfo {
    pub fn new(profile_list: Vec<Profile>) -> Self {
        Self {
            current: None,
            profile_list,
        }
    }

    pub fn by_id(&self, profile_id: &str) -> Option<&Profile> {
        self.profile_list.iter().find(|p| p.profile_id == profile_id)
    }

    /// The currently chosen profile, if it still exists.
    pub fn current_profile(&self) -> Option<&Profile> {
        self.current.as_deref().and_then(|id| self.by_id(id))
    }

    /// Remember a choice; the id must be in the list.
    pub fn set_current(&mut self, profile_id: &str) -> CoreResult<()> {
        if self.by_id(profile_id).is_none() {
            return Err(Error::internal(format!(
                "profile '{profile_id}' is not in the server's list"
            )));
        }
        self.current = Some(profile_id.to_string());
        Ok(())
    }

    /// Profiles usable with the client's protocols.
    pub fn usable(&self, client_protocols: &[Protocol]) -> Vec<&Profile> {
        self.profile_list
            .iter()
            .filter(|p| p.supported_by(client_protocols))
            .collect()
    }

    /// Clear a remembered choice that vanished from the list or became
    /// unsupported on this client. Returns whether it was cleared.
    pub fn correct_current(&mut self, client_protocols: &[Protocol]) -> bool {
        let valid = self
            .current_profile()
            .map(|p| p.supported_by(client_protocols))
            .unwrap_or(false);
        if self.current.is_some() && !valid {
            self.current = None;
            return true;
        }
        false
    }

    /// Replace the list from a fresh `/info`, keeping a still-valid choice.
    pub fn update_list(&mut self, profile_list: Vec<Profile>, client_protocols: &[Protocol]) {
        self.profile_list = profile_list;
        self.correct_current(client_protocols);
    }
}

/// A server as persisted in the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub profiles: ProfileInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_authorize_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
    /// Secure internet only: the chosen country.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// Secure internet only: remembered profile per country.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profile_by_country: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Translated>,
    /// Legacy flag carried through from old state files; never acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delisted: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, protocols: &[Protocol]) -> Profile {
        Profile {
            profile_id: id.into(),
            display_name: Translated::Single(id.to_uppercase()),
            vpn_proto_list: protocols.to_vec(),
            default_gateway: true,
        }
    }

    const BOTH: [Protocol; 2] = [Protocol::OpenVpn, Protocol::WireGuard];

    // ── ServerType / ServerKey ───────────────────────────────────

    #[test]
    fn server_type_round_trips_through_strings() {
        for t in [
            ServerType::InstituteAccess,
            ServerType::SecureInternet,
            ServerType::Custom,
        ] {
            assert_eq!(ServerType::parse(t.as_str()).unwrap(), t);
        }
        assert!(ServerType::parse("nonsense").is_err());
    }

    #[test]
    fn storage_key_round_trips() {
        let key = ServerKey::new(ServerType::Custom, "https://vpn.example.org/");
        let parsed = ServerKey::parse(&key.storage_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn storage_key_allows_commas_in_identifier() {
        // Org ids are opaque; only the first comma separates.
        let parsed = ServerKey::parse("secure_internet,https://idp.example/a,b").unwrap();
        assert_eq!(parsed.identifier, "https://idp.example/a,b");
    }

    #[test]
    fn protocol_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::WireGuard).unwrap(), "\"wireguard\"");
        assert_eq!(
            serde_json::from_str::<Protocol>("\"openvpn\"").unwrap(),
            Protocol::OpenVpn
        );
    }

    // ── ProfileInfo ──────────────────────────────────────────────

    #[test]
    fn set_current_requires_listed_id() {
        let mut info = ProfileInfo::new(vec![profile("p1", &BOTH)]);
        assert!(info.set_current("p1").is_ok());
        assert!(info.set_current("missing").is_err());
        assert_eq!(info.current.as_deref(), Some("p1"));
    }

    #[test]
    fn vanished_current_is_cleared() {
        let mut info = ProfileInfo::new(vec![profile("p1", &BOTH)]);
        info.set_current("p1").unwrap();
        info.update_list(vec![profile("p2", &BOTH)], &BOTH);
        assert!(info.current.is_none());
    }

    #[test]
    fn unsupported_current_is_cleared() {
        let mut info = ProfileInfo::new(vec![profile("wg-only", &[Protocol::WireGuard])]);
        info.set_current("wg-only").unwrap();
        // A host without WireGuard support.
        assert!(info.correct_current(&[Protocol::OpenVpn]));
        assert!(info.current.is_none());
    }

    #[test]
    fn valid_current_survives_update() {
        let mut info = ProfileInfo::new(vec![profile("p1", &BOTH)]);
        info.set_current("p1").unwrap();
        info.update_list(vec![profile("p1", &BOTH), profile("p2", &BOTH)], &BOTH);
        assert_eq!(info.current.as_deref(), Some("p1"));
    }

    #[test]
    fn profile_with_empty_proto_list_counts_as_supported() {
        let info = ProfileInfo::new(vec![profile("p1", &[])]);
        assert_eq!(info.usable(&[Protocol::OpenVpn]).len(), 1);
    }

    #[test]
    fn usable_filters_by_protocol() {
        let info = ProfileInfo::new(vec![
            profile("ovpn", &[Protocol::OpenVpn]),
            profile("wg", &[Protocol::WireGuard]),
        ]);
        let usable = info.usable(&[Protocol::OpenVpn]);
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].profile_id, "ovpn");
    }

    // ── ServerRecord serde ───────────────────────────────────────

    #[test]
    fn record_round_trips_with_delisted_flag() {
        let json = r#"{
          "profiles": {"current": "p1", "profile_list": [
            {"profile_id": "p1", "display_name": {"en": "P1"}, "vpn_proto_list": ["openvpn"]}
          ]},
          "country_code": "NL",
          "delisted": true
        }"#;
        let record: ServerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.delisted, Some(true));
        let out = serde_json::to_string(&record).unwrap();
        assert!(out.contains("\"delisted\":true"));
    }
}
