//! Per-operation cancellable handle.
//!
//! A cookie is created by the host for every interactive operation. It
//! carries a cancellation token, an optional deadline, a capacity-1 reply
//! lane the host answers required transitions on, and an internal error
//! lane the notifier uses when the host refuses a required payload.

use crate::error::{CoreResult, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct Cookie {
    token: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    reply_tx: mpsc::Sender<String>,
    reply_rx: Mutex<mpsc::Receiver<String>>,
    err_tx: mpsc::Sender<Error>,
    err_rx: Mutex<mpsc::Receiver<Error>>,
}

impl Cookie {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// A cookie whose operations give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Self::build(Some(tokio::time::Instant::now() + timeout))
    }

    fn build(deadline: Option<tokio::time::Instant>) -> Arc<Self> {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        Arc::new(Self {
            token: CancellationToken::new(),
            deadline,
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            err_tx,
            err_rx: Mutex::new(err_rx),
        })
    }

    /// Cancel the operation this cookie belongs to.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token handed to network calls so they observe the cancel promptly.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Answer a required transition. Fails when a previous reply is still
    /// unconsumed: each required transition takes exactly one reply.
    pub fn send(&self, reply: impl Into<String>) -> CoreResult<()> {
        self.reply_tx.try_send(reply.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::internal("cookie already holds an unconsumed reply")
            }
            mpsc::error::TrySendError::Closed(_) => Error::internal("cookie reply lane closed"),
        })
    }

    /// Push an internal error so a blocked `receive` resolves.
    pub fn fail(&self, err: Error) {
        let _ = self.err_tx.try_send(err);
    }

    /// Wait for the host's reply, the cancel signal, the deadline, or an
    /// internal error, whichever fires first.
    pub async fn receive(&self) -> CoreResult<String> {
        let mut reply_rx = self.reply_rx.lock().await;
        let mut err_rx = self.err_rx.lock().await;

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            reply = reply_rx.recv() => {
                reply.ok_or_else(|| Error::internal("cookie reply lane closed"))
            }
            err = err_rx.recv() => {
                Err(err.unwrap_or_else(|| Error::internal("cookie error lane closed")))
            }
            _ = self.token.cancelled() => Err(Error::cancelled()),
            _ = deadline => Err(Error::timeout("cookie deadline passed")),
        }
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cookie")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}
