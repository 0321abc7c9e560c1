//! The failover probe.
//!
//! One echo with a reply window, then a burst of fire-and-forget echoes at
//! the ping cadence, then the rx-byte verdict: no growth means dropped.

use crate::icmp;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cadence between echoes and the reply window for the first one.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);
/// Echoes sent per probe.
pub const PING_COUNT: u16 = 5;
/// Smallest MTU that fits an echo: IPv4 + ICMP headers.
pub const MIN_MTU: u32 = icmp::ECHO_OVERHEAD as u32;

/// How long a blocking receive may stall before the cancel flag is polled.
const RECV_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("mtu {0} does not fit an ICMP echo (minimum {MIN_MTU})")]
    InvalidMtu(u32),
    #[error("only IPv4 tunnel gateways are supported")]
    UnsupportedGateway,
    #[error("ICMP socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("reading rx bytes: {0}")]
    RxBytes(String),
    #[error("probe cancelled")]
    Cancelled,
}

/// Probe parameters. `interval` and `count` have production defaults; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub gateway: IpAddr,
    pub mtu: u32,
    pub interval: Duration,
    pub count: u16,
}

impl ProbeConfig {
    pub fn new(gateway: IpAddr, mtu: u32) -> Self {
        Self {
            gateway,
            mtu,
            interval: PING_INTERVAL,
            count: PING_COUNT,
        }
    }
}

/// Run the probe; `true` means the tunnel is considered dropped.
///
/// `read_rx_bytes` reads the tunnel interface's receive counter. The token
/// is polled throughout; cancellation yields [`FailoverError::Cancelled`],
/// never a verdict.
pub async fn probe_dropped<F>(
    config: ProbeConfig,
    read_rx_bytes: F,
    cancel: CancellationToken,
) -> Result<bool, FailoverError>
where
    F: Fn() -> Result<u64, String> + Send + 'static,
{
    if config.mtu < MIN_MTU {
        return Err(FailoverError::InvalidMtu(config.mtu));
    }
    let IpAddr::V4(gateway) = config.gateway else {
        return Err(FailoverError::UnsupportedGateway);
    };
    if cancel.is_cancelled() {
        return Err(FailoverError::Cancelled);
    }

    let rx0 = read_rx_bytes().map_err(FailoverError::RxBytes)?;
    debug!(rx0, %gateway, "starting failover probe");

    let blocking_cancel = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || {
        blocking_probe(gateway.into(), config, rx0, read_rx_bytes, blocking_cancel)
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(FailoverError::Cancelled),
        joined = handle => match joined {
            Ok(result) => result,
            Err(e) => Err(FailoverError::RxBytes(format!("probe task failed: {e}"))),
        },
    }
}

fn blocking_probe<F>(
    gateway: IpAddr,
    config: ProbeConfig,
    rx0: u64,
    read_rx_bytes: F,
    cancel: CancellationToken,
) -> Result<bool, FailoverError>
where
    F: Fn() -> Result<u64, String>,
{
    let payload_len = config.mtu as usize - icmp::ECHO_OVERHEAD;
    let ident = (std::process::id() & 0xffff) as u16;
    let dest: SocketAddr = SocketAddr::new(gateway, 0);

    let mut socket = open_icmp_socket()?;
    socket.set_read_timeout(Some(RECV_SLICE))?;

    // First echo gets a full reply window.
    socket.send_to(&icmp::echo_request(ident, 1, payload_len), &dest.into())?;
    let window_end = Instant::now() + config.interval;
    let mut buf = [0u8; 2048];
    while Instant::now() < window_end {
        if cancel.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }
        match socket.read(&mut buf) {
            Ok(n) if icmp::is_echo_reply(&buf[..n], 1) => {
                debug!("gateway replied, tunnel is alive");
                return Ok(false);
            }
            Ok(_) => continue,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(FailoverError::Socket(e)),
        }
    }

    // The rest are fire-and-forget at the cadence.
    for seq in 2..=config.count {
        if cancel.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }
        socket.send_to(&icmp::echo_request(ident, seq, payload_len), &dest.into())?;
        let pause_end = Instant::now() + config.interval;
        while Instant::now() < pause_end {
            if cancel.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }
            let remaining = pause_end.saturating_duration_since(Instant::now());
            std::thread::sleep(RECV_SLICE.min(remaining));
        }
    }

    let rx1 = read_rx_bytes().map_err(FailoverError::RxBytes)?;
    debug!(rx0, rx1, "probe window over");
    Ok(rx1 <= rx0)
}

/// Unprivileged datagram ICMP first, raw socket as the privileged fallback.
fn open_icmp_socket() -> Result<Socket, std::io::Error> {
    match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
        Ok(socket) => Ok(socket),
        Err(_) => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)),
    }
}
