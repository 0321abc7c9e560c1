//! Interactive-flow state machine.
//!
//! The orchestrator walks a closed set of states; every transition is
//! reported to the host through a FIFO notifier task so callbacks never run
//! under the orchestrator lock and arrive totally ordered. Required
//! transitions (profile choice, location choice, browser authorization)
//! additionally carry the operation's cookie: the host answers on it, or
//! the notifier fails the cookie when the callback refuses the payload.

use crate::cookie::Cookie;
use crate::error::{CoreResult, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Closed set of client states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    /// Not registered; the only operation is `register`.
    Deregistered,
    /// Idle, registered.
    Main,
    /// A server is being added.
    AddingServer,
    /// Waiting for the browser authorization to come back.
    OAuthStarted,
    /// Waiting for the host to pick a secure-internet location.
    AskLocation,
    /// Waiting for the host to pick a profile.
    AskProfile,
    /// A configuration is being obtained.
    GettingConfig,
    /// A configuration was handed to the host.
    GotConfig,
    /// The host reported the tunnel as torn down.
    Disconnected,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deregistered => write!(f, "Deregistered"),
            Self::Main => write!(f, "Main"),
            Self::AddingServer => write!(f, "Adding Server"),
            Self::OAuthStarted => write!(f, "OAuth Started"),
            Self::AskLocation => write!(f, "Ask Location"),
            Self::AskProfile => write!(f, "Ask Profile"),
            Self::GettingConfig => write!(f, "Getting Config"),
            Self::GotConfig => write!(f, "Got Config"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Data handed to the host alongside a transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum FsmPayload {
    Empty,
    /// Browser URL the host must open for authorization.
    OpenUrl(String),
    /// Structured data: profile lists, location lists, the final config.
    Json(serde_json::Value),
}

/// Host callback. The return value reports whether a *required* payload was
/// consumed.
pub type TransitionHook = dyn Fn(FsmState, FsmState, &FsmPayload) -> bool + Send + Sync;

struct Notification {
    old: FsmState,
    new: FsmState,
    payload: FsmPayload,
    required: bool,
    cookie: Option<Arc<Cookie>>,
}

/// The state machine plus its notifier lane.
#[derive(Debug)]
pub struct Fsm {
    current: FsmState,
    notify_tx: Option<mpsc::UnboundedSender<Notification>>,
}

impl Fsm {
    /// A machine without a host hook (transitions are still checked).
    pub fn new() -> Self {
        Self {
            current: FsmState::Deregistered,
            notify_tx: None,
        }
    }

    /// A machine that reports transitions to `hook` in FIFO order.
    ///
    /// Must be called within a tokio runtime: the notifier runs as a task.
    pub fn with_hook(hook: Arc<TransitionHook>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                let handled = (hook)(n.old, n.new, &n.payload);
                if n.required && !handled {
                    if let Some(cookie) = n.cookie {
                        cookie.fail(Error::internal(format!(
                            "host did not handle the required {} payload",
                            n.new
                        )));
                    }
                }
            }
        });
        Self {
            current: FsmState::Deregistered,
            notify_tx: Some(tx),
        }
    }

    pub fn current(&self) -> FsmState {
        self.current
    }

    pub fn in_state(&self, state: FsmState) -> bool {
        self.current == state
    }

    /// The transition table.
    pub fn allowed(from: FsmState, to: FsmState) -> bool {
        use FsmState::*;
        matches!(
            (from, to),
            (Deregistered, Main)
                | (Main, AddingServer | OAuthStarted | GettingConfig | AskLocation | AskProfile)
                | (AddingServer, OAuthStarted | Main)
                | (OAuthStarted, Main | GettingConfig)
                | (AskLocation, Main | GettingConfig)
                | (AskProfile, GettingConfig | Main)
                | (GettingConfig, GotConfig | AskProfile | OAuthStarted | Main)
                | (GotConfig, Disconnected | Main)
                | (Disconnected, Main)
        )
    }

    /// Take a transition and notify the host.
    pub fn go(&mut self, to: FsmState, payload: FsmPayload) -> CoreResult<()> {
        self.transition(to, payload, false, None)
    }

    /// Take a transition whose payload the host must answer on `cookie`.
    pub fn go_required(
        &mut self,
        to: FsmState,
        payload: FsmPayload,
        cookie: &Arc<Cookie>,
    ) -> CoreResult<()> {
        self.transition(to, payload, true, Some(Arc::clone(cookie)))
    }

    fn transition(
        &mut self,
        to: FsmState,
        payload: FsmPayload,
        required: bool,
        cookie: Option<Arc<Cookie>>,
    ) -> CoreResult<()> {
        if !Self::allowed(self.current, to) {
            return Err(Error::invalid_transition(self.current, to));
        }
        let old = self.current;
        self.current = to;
        debug!(%old, %to, "fsm transition");
        if let Some(tx) = &self.notify_tx {
            let _ = tx.send(Notification {
                old,
                new: to,
                payload,
                required,
                cookie,
            });
        }
        Ok(())
    }

    /// Reset to a previously observed state, bypassing the table.
    ///
    /// Used on operation error paths (back-to-previous edges are always
    /// legal) and by deregistration.
    pub fn rollback_to(&mut self, state: FsmState) {
        if self.current != state {
            let old = self.current;
            debug!(%old, new = %state, "fsm rollback");
            self.current = state;
            if let Some(tx) = &self.notify_tx {
                let _ = tx.send(Notification {
                    old,
                    new: state,
                    payload: FsmPayload::Empty,
                    required: false,
                    cookie: None,
                });
            }
        }
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
