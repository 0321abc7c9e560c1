//! # fedvpn-core
//!
//! Shared foundations for the FedVPN workspace.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **error** | Error envelope: kind, translation key + arguments, wrapped cause |
//! | **http** | User-Agent-carrying HTTP wrapper with cancellation and body caps |
//! | **urls** | Canonical server-URL rules and origin comparison |
//! | **cookie** | Per-operation cancellable handle with a one-shot reply lane |
//! | **fsm** | Interactive-flow state machine driving host UI callbacks |

pub mod cookie;
pub mod error;
pub mod fsm;
pub mod http;
pub mod urls;

pub use cookie::Cookie;
pub use error::{CoreResult, Error, ErrorKind};
pub use fsm::{Fsm, FsmPayload, FsmState, TransitionHook};
pub use http::{HttpClient, HttpResponse};
