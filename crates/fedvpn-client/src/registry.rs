//! Registered application ids and their capabilities.
//!
//! The federation only issues OAuth client ids to the known applications;
//! anything else is refused at construction. Capabilities hang off the id:
//! discovery is an eduVPN-only feature, and the mobile ids authorize
//! through a custom-scheme redirect instead of the loopback listener.

use fedvpn_core::error::{CoreResult, Error, ErrorKind};
use std::fmt;

/// Longest accepted client version string.
const MAX_VERSION_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppFamily {
    EduVpn,
    LetsConnect,
    GovVpn,
}

impl AppFamily {
    fn id_prefix(&self) -> &'static str {
        match self {
            Self::EduVpn => "org.eduvpn.app",
            Self::LetsConnect => "org.letsconnect-vpn.app",
            Self::GovVpn => "org.govvpn.app",
        }
    }

    /// Human-readable name used in the User-Agent.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::EduVpn => "eduVPN",
            Self::LetsConnect => "Let's Connect!",
            Self::GovVpn => "govVPN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Android,
    Ios,
    Macos,
    Linux,
}

impl Platform {
    fn id_suffix(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Macos => "macos",
            Self::Linux => "linux",
        }
    }

    const ALL: [Platform; 5] = [
        Platform::Windows,
        Platform::Android,
        Platform::Ios,
        Platform::Macos,
        Platform::Linux,
    ];
}

/// A validated client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    id: String,
    family: AppFamily,
    platform: Platform,
}

impl ClientId {
    /// Validate against the closed allowlist of registered applications.
    pub fn parse(id: &str) -> CoreResult<Self> {
        for family in [AppFamily::EduVpn, AppFamily::LetsConnect, AppFamily::GovVpn] {
            for platform in Platform::ALL {
                if id == format!("{}.{}", family.id_prefix(), platform.id_suffix()) {
                    return Ok(Self {
                        id: id.to_string(),
                        family,
                        platform,
                    });
                }
            }
        }
        Err(Error::new(
            ErrorKind::InvalidClientId,
            format!("'{id}' is not a registered application id"),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn family(&self) -> AppFamily {
        self.family
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Discovery of the federation catalogs is an eduVPN capability.
    pub fn discovery_enabled(&self) -> bool {
        self.family == AppFamily::EduVpn
    }

    /// Mobile platforms get the authorization redirect handed back on a
    /// custom scheme instead of a loopback listener.
    pub fn uses_custom_scheme(&self) -> bool {
        matches!(self.platform, Platform::Android | Platform::Ios)
    }

    /// The custom-scheme redirect URI for mobile ids.
    pub fn custom_scheme_redirect(&self) -> String {
        format!("{}:/api/callback", self.family.id_prefix())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Version strings are capped and must stay printable.
pub fn validate_version(version: &str) -> CoreResult<()> {
    if version.is_empty() || version.chars().count() > MAX_VERSION_CHARS {
        return Err(Error::new(
            ErrorKind::InvalidVersion,
            format!("version must be 1..={MAX_VERSION_CHARS} characters"),
        ));
    }
    if version.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(Error::new(
            ErrorKind::InvalidVersion,
            "version must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

/// `"<display name>/<version>"`, registered once at construction.
pub fn user_agent(client_id: &ClientId, version: &str) -> String {
    format!("{}/{}", client_id.family().display_name(), version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_full_allowlist_parses() {
        let apps = ["org.eduvpn.app", "org.letsconnect-vpn.app", "org.govvpn.app"];
        let platforms = ["windows", "android", "ios", "macos", "linux"];
        for app in apps {
            for platform in platforms {
                let id = format!("{app}.{platform}");
                assert!(ClientId::parse(&id).is_ok(), "{id}");
            }
        }
    }

    #[test]
    fn unknown_ids_are_rejected() {
        for id in [
            "org.eduvpn.app",
            "org.eduvpn.app.freebsd",
            "com.example.vpn.linux",
            "",
        ] {
            let err = ClientId::parse(id).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidClientId, "{id}");
        }
    }

    #[test]
    fn discovery_is_eduvpn_only() {
        assert!(ClientId::parse("org.eduvpn.app.linux").unwrap().discovery_enabled());
        assert!(!ClientId::parse("org.letsconnect-vpn.app.linux")
            .unwrap()
            .discovery_enabled());
        assert!(!ClientId::parse("org.govvpn.app.windows")
            .unwrap()
            .discovery_enabled());
    }

    #[test]
    fn mobile_ids_use_custom_scheme() {
        assert!(ClientId::parse("org.eduvpn.app.ios").unwrap().uses_custom_scheme());
        assert!(ClientId::parse("org.eduvpn.app.android").unwrap().uses_custom_scheme());
        assert!(!ClientId::parse("org.eduvpn.app.linux").unwrap().uses_custom_scheme());
        assert_eq!(
            ClientId::parse("org.eduvpn.app.android")
                .unwrap()
                .custom_scheme_redirect(),
            "org.eduvpn.app:/api/callback"
        );
    }

    #[test]
    fn version_cap_is_twenty_chars() {
        assert!(validate_version("1.2.3").is_ok());
        assert!(validate_version(&"v".repeat(20)).is_ok());
        assert!(validate_version(&"v".repeat(21)).is_err());
        assert!(validate_version("").is_err());
        assert!(validate_version("1.0 beta").is_err());
    }

    #[test]
    fn user_agent_format() {
        let id = ClientId::parse("org.letsconnect-vpn.app.macos").unwrap();
        assert_eq!(user_agent(&id, "3.1.0"), "Let's Connect!/3.1.0");
    }
}
