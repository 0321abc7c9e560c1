//! # fedvpn-failover
//!
//! Detects a silently dead tunnel: ICMP echoes are sent to the tunnel
//! gateway while the interface's rx-byte counter is watched. No replies
//! and no rx growth over the probe window means the tunnel dropped.

pub mod icmp;
pub mod probe;

pub use probe::{probe_dropped, FailoverError, ProbeConfig};
