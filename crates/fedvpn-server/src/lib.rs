//! # fedvpn-server
//!
//! The server side of a connect cycle: the three server variants and their
//! shared contract, `/.well-known` endpoint resolution, the authenticated
//! REST calls (`/info`, `/connect`, `/disconnect`), profile bookkeeping,
//! WireGuard key handling, and session-expiry arithmetic.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Server variants, keys, profiles, persisted records |
//! | **endpoints** | `/.well-known/vpn-user-portal` resolution + TTL |
//! | **api** | Bearer-authenticated calls with a single 401 retry |
//! | **wireguard** | Keypair generation and config rewriting |
//! | **expiry** | Renew-button / countdown / notification times |

pub mod api;
pub mod endpoints;
pub mod expiry;
pub mod types;
pub mod wireguard;

pub use api::{AccessTokens, ConnectRequest, VpnConfig};
pub use endpoints::Endpoints;
pub use expiry::Expiry;
pub use types::{Profile, ProfileInfo, Protocol, ServerKey, ServerRecord, ServerType};
