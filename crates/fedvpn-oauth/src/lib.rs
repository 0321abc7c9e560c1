//! # fedvpn-oauth
//!
//! OAuth 2.0 authorization-code grant with PKCE, as the federation's
//! portals implement it: a `config`-scoped code flow with either a loopback
//! redirect served by this crate or a custom-scheme redirect handed back to
//! mobile hosts, plus token caching with single-flight refresh.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Token sets, wire responses, pending authorization state |
//! | **pkce** | Verifier / S256 challenge / state generation |
//! | **flow** | Authorization URL, callback validation, exchange, refresh |
//! | **listener** | Loopback `127.0.0.1` redirect listener (handle-once) |
//! | **cache** | Token cache keyed by server, host getter/setter bridging |

pub mod cache;
pub mod flow;
pub mod listener;
pub mod pkce;
pub mod types;

pub use cache::{TokenCache, TokenStore};
pub use flow::{build_authorization_url, validate_callback};
pub use listener::CallbackListener;
pub use types::{AuthRequest, StoredTokens, TokenSet};
