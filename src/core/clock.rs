// src/core/clock.rs

//! Microsecond wall-clock helpers. All replication timestamps and config
//! windows are expressed in microseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Ticks per second for config values given in whole seconds.
pub const TICKS_PER_SEC: u64 = 1_000_000;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
