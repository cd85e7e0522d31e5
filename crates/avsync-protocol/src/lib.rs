pub mod config;
pub mod packets;

use std::net::Ipv4Addr;

/// Magic constant at the head of every cueing datagram
pub const SYNC_MAGIC: u32 = 0xDEAD_BEEF;

/// Default UDP port for cueing traffic (listen and send)
pub const DEFAULT_PORT: u16 = 9999;

/// Limited broadcast address used when no subnet broadcast is configured
pub const DEFAULT_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Heartbeat / liveness defaults
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Period of master sync cues
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5;

/// Git hash and build time baked in by build.rs, e.g. "a1b2c3d (2026-10-18 09:12 UTC)"
pub fn build_info() -> String {
    format!(
        "{} ({})",
        env!("AVSYNC_GIT_HASH"),
        env!("AVSYNC_BUILD_TIME")
    )
}
