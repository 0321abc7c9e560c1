//! # fedvpn-client
//!
//! The host-facing orchestrator. A [`Client`] owns the discovery manager,
//! the OAuth token cache, the state store, and the interactive-flow FSM,
//! and drives a server from identifier to VPN configuration.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **registry** | Registered application ids and their capabilities |
//! | **service** | The orchestrator and its public operations |
//! | **proxyguard** | WireGuard-over-TCP helper process lifecycle |

pub mod proxyguard;
pub mod registry;
pub mod service;

pub use proxyguard::{Proxyguard, ProxyguardConfig};
pub use registry::ClientId;
pub use service::{Client, ConfigResult, ExpiryTimes, ServerInfo};
