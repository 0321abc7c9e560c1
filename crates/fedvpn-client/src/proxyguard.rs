//! Proxyguard sub-process lifecycle.
//!
//! When UDP is unavailable, WireGuard traffic is tunneled over TCP by the
//! external `proxyguard-client` binary. The core only launches and cancels
//! it; the data path is entirely the sub-process's business.

use fedvpn_core::error::{CoreResult, Error};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PROXYGUARD_BIN: &str = "proxyguard-client";

/// Launch parameters for the TCP proxy.
#[derive(Debug, Clone)]
pub struct ProxyguardConfig {
    /// Local UDP address WireGuard sends to, e.g. `127.0.0.1:1337`.
    pub listen: String,
    /// The peer's HTTPS proxy endpoint.
    pub peer: String,
}

/// A running proxyguard task.
#[derive(Debug)]
pub struct Proxyguard {
    child: Mutex<Option<Child>>,
}

impl Proxyguard {
    /// Spawn the sub-process, inheriting the orchestrator's User-Agent.
    pub fn launch(config: &ProxyguardConfig, user_agent: &str) -> CoreResult<Self> {
        let child = Command::new(PROXYGUARD_BIN)
            .arg("--listen")
            .arg(&config.listen)
            .arg("--to")
            .arg(&config.peer)
            .arg("--user-agent")
            .arg(user_agent)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::internal(format!("could not launch {PROXYGUARD_BIN}: {e}")))?;

        debug!(listen = %config.listen, peer = %config.peer, "proxyguard launched");
        Ok(Self {
            child: Mutex::new(Some(child)),
        })
    }

    /// Kill the sub-process. Idempotent.
    pub async fn cancel(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                warn!("could not kill proxyguard: {e}");
            }
        }
    }

    /// Whether the sub-process is still attached.
    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_of_a_missing_binary_errors() {
        // The binary is an external deliverable; its absence must surface
        // as a clean error rather than a panic.
        let result = Proxyguard::launch(
            &ProxyguardConfig {
                listen: "127.0.0.1:1337".into(),
                peer: "https://vpn.example.org/proxyguard".into(),
            },
            "test/1.0",
        );
        if let Ok(task) = result {
            task.cancel().await;
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_without_a_child() {
        let task = Proxyguard {
            child: Mutex::new(None),
        };
        task.cancel().await;
        task.cancel().await;
        assert!(!task.is_running().await);
    }
}
