//! # fedvpn
//!
//! Client core for the eduVPN / Let's Connect! / govVPN federation.
//!
//! Host applications construct a [`Client`], register a transition hook for
//! their UI, and drive servers from identifier to VPN configuration; the
//! tunnel data plane stays with the host. The umbrella crate re-exports the
//! public surface of the component crates.

pub use fedvpn_client::{Client, ClientId, ConfigResult, ExpiryTimes, ProxyguardConfig, ServerInfo};
pub use fedvpn_core::{Cookie, CoreResult, Error, ErrorKind, Fsm, FsmPayload, FsmState};
pub use fedvpn_server::{Profile, ProfileInfo, Protocol, ServerKey, ServerType};

pub mod client {
    //! The orchestrator crate, re-exported.
    pub use fedvpn_client::*;
}

pub mod core {
    //! Shared foundations: errors, HTTP, URLs, cookies, the FSM.
    pub use fedvpn_core::*;
}

pub mod discovery {
    //! The signed discovery pipeline.
    pub use fedvpn_discovery::*;
}

pub mod oauth {
    //! The OAuth 2.0 + PKCE client.
    pub use fedvpn_oauth::*;
}

pub mod server {
    //! The server model and portal API.
    pub use fedvpn_server::*;
}

pub mod state {
    //! The persisted state store.
    pub use fedvpn_state::*;
}

pub mod failover {
    //! The dead-tunnel probe.
    pub use fedvpn_failover::*;
}
