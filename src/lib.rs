#![forbid(unsafe_code)]

// Screenrelay library - room-based screen sharing and remote control relay

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod outbound;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod storage;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch, as carried on the wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
