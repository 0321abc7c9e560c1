//! Workspace-wide error envelope.
//!
//! Every error carries a machine-readable kind, a human-readable detail
//! message for logs, and optional arguments. Kinds split into two groups:
//! external kinds expose a stable translation key that host applications
//! feed into their own catalogs, internal kinds do not and are only ever
//! shown to developers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Categorised FedVPN error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Arguments for the translated message (server URL, organization id, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    /// Wrapped cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // ── External kinds (translated by the host) ──────────────────
    /// Autoconnect was requested but the server needs the user to
    /// reauthorize in a browser first.
    AutoconnectNeedsReauth,
    /// The server could not be reached at the transport level.
    ServerUnreachable,
    /// Adding a server failed; `args["id"]` names the URL or org id.
    AddServerFailed,
    /// Obtaining a VPN configuration failed; `args["url"]` names the server.
    ConfigFetchFailed,
    /// The discovery catalogs could not be obtained or refreshed.
    DiscoveryUnavailable,
    /// The given server URL could not be canonicalized.
    InvalidUrl,
    /// The operation ran past its deadline.
    Timeout,

    // ── Internal kinds (developer-facing) ────────────────────────
    /// Client id is not on the registered-application allowlist.
    InvalidClientId,
    /// Client version string failed validation.
    InvalidVersion,
    /// The operation is not available for this client id.
    CapabilityDisabled,
    /// The requested FSM transition is not an edge of the table.
    InvalidFsmTransition,
    /// Signature verification failed.
    SignatureInvalid,
    /// A downloaded catalog is older than the cached one.
    SignatureRollback,
    /// Filesystem read/write failure.
    FileIo,
    /// JSON (de)serialization failure.
    JsonParse,
    /// The token set is unusable and a reauthorization is needed.
    TokensInvalid,
    /// The operation was cancelled through its cookie.
    Cancelled,
    /// Catch-all for broken invariants.
    Internal,
}

pub type CoreResult<T> = Result<T, Error>;

impl ErrorKind {
    /// Translation key for external kinds, `None` for internal ones.
    pub fn translation_key(&self) -> Option<&'static str> {
        match self {
            Self::AutoconnectNeedsReauth => Some("autoconnect_needs_reauth"),
            Self::ServerUnreachable => Some("server_unreachable"),
            Self::AddServerFailed => Some("add_server_failed"),
            Self::ConfigFetchFailed => Some("config_fetch_failed"),
            Self::DiscoveryUnavailable => Some("discovery_unavailable"),
            Self::InvalidUrl => Some("invalid_url"),
            Self::Timeout => Some("timeout"),
            _ => None,
        }
    }
}

// ── Construction helpers ─────────────────────────────────────────────

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            args: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn wrap(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn autoconnect_needs_reauth(id: &str) -> Self {
        Self::new(
            ErrorKind::AutoconnectNeedsReauth,
            format!("server '{id}' needs reauthorization before autoconnect"),
        )
        .with_arg("id", id)
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerUnreachable, msg)
    }

    pub fn add_server_failed(id: &str, cause: Error) -> Self {
        Self::new(ErrorKind::AddServerFailed, format!("could not add '{id}'"))
            .with_arg("id", id)
            .wrap(cause)
    }

    pub fn config_fetch_failed(url: &str, cause: Error) -> Self {
        Self::new(
            ErrorKind::ConfigFetchFailed,
            format!("could not obtain a configuration from '{url}'"),
        )
        .with_arg("url", url)
        .wrap(cause)
    }

    pub fn discovery_unavailable(cause: Error) -> Self {
        Self::new(ErrorKind::DiscoveryUnavailable, "discovery refresh failed").wrap(cause)
    }

    pub fn invalid_url(input: &str, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUrl, msg).with_arg("input", input)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidFsmTransition,
            format!("transition {from} -> {to} is not allowed"),
        )
        .with_arg("from", from.to_string())
        .with_arg("to", to.to_string())
    }

    pub fn signature_invalid(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureInvalid, msg)
    }

    pub fn rollback(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureRollback, msg)
    }

    pub fn file_io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileIo, msg)
    }

    pub fn json(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::JsonParse, msg)
    }

    pub fn tokens_invalid(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TokensInvalid, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Translation key plus arguments, for external kinds.
    pub fn translation(&self) -> Option<(&'static str, &BTreeMap<String, String>)> {
        self.kind.translation_key().map(|key| (key, &self.args))
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// True if this error or any wrapped cause is of `kind`.
    pub fn chain_has(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        self.cause.as_ref().is_some_and(|c| c.chain_has(kind))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::file_io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::json(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else if e.is_connect() {
            Self::unreachable(e.to_string())
        } else {
            Self::new(ErrorKind::ServerUnreachable, e.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::new(ErrorKind::InvalidUrl, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_kinds_have_translation_keys() {
        let external = [
            ErrorKind::AutoconnectNeedsReauth,
            ErrorKind::ServerUnreachable,
            ErrorKind::AddServerFailed,
            ErrorKind::ConfigFetchFailed,
            ErrorKind::DiscoveryUnavailable,
            ErrorKind::InvalidUrl,
            ErrorKind::Timeout,
        ];
        for kind in external {
            assert!(kind.translation_key().is_some(), "{kind:?}");
        }
    }

    #[test]
    fn internal_kinds_have_no_translation_keys() {
        let internal = [
            ErrorKind::InvalidClientId,
            ErrorKind::InvalidFsmTransition,
            ErrorKind::SignatureRollback,
            ErrorKind::TokensInvalid,
            ErrorKind::Cancelled,
        ];
        for kind in internal {
            assert!(kind.translation_key().is_none(), "{kind:?}");
        }
    }

    #[test]
    fn translation_exposes_args() {
        let err = Error::config_fetch_failed("https://vpn.example.org/", Error::timeout("t"));
        let (key, args) = err.translation().unwrap();
        assert_eq!(key, "config_fetch_failed");
        assert_eq!(args.get("url").unwrap(), "https://vpn.example.org/");
    }

    #[test]
    fn display_includes_cause_chain() {
        let err = Error::add_server_failed("https://a.example/", Error::timeout("deadline hit"));
        let rendered = err.to_string();
        assert!(rendered.contains("AddServerFailed"));
        assert!(rendered.contains("deadline hit"));
    }

    #[test]
    fn chain_has_walks_causes() {
        let err = Error::config_fetch_failed(
            "https://a.example/",
            Error::tokens_invalid("refresh rejected"),
        );
        assert!(err.chain_has(ErrorKind::TokensInvalid));
        assert!(!err.chain_has(ErrorKind::Timeout));
    }

    #[test]
    fn serde_round_trip() {
        let err = Error::invalid_url("ftp:", "no host");
        let json = serde_json::to_string(&err).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::InvalidUrl);
        assert_eq!(back.args.get("input").unwrap(), "ftp:");
    }
}
