// src/core/sync/throttler.rs

//! Per-worker accounting of time spent doing sync work per peer. Keeps one
//! peer from monopolizing a worker: when a peer's share of the elapsed wall
//! clock exceeds its allowance, the worker sleeps before serving it again.

use crate::core::clock::now_us;
use crate::core::distribution::ServerId;
use std::collections::HashMap;
use std::time::Duration;

/// Sleep returned by [`TimeThrottler::begin`] is capped here.
const MAX_WAIT_US: u64 = 2_000_000;

/// The accounting period resets once every peer fits its allowance and the
/// period has run at least this long.
const MIN_PERIOD_US: u64 = 30_000_000;

#[derive(Debug)]
pub struct TimeThrottler {
    max_time_pct: u64,
    period_start: u64,
    srv_time: HashMap<ServerId, u64>,
}

impl TimeThrottler {
    pub fn new(max_time_pct: u64) -> Self {
        Self {
            max_time_pct,
            period_start: 0,
            srv_time: HashMap::new(),
        }
    }

    /// Called before serving `server_id`. Returns how long the worker should
    /// sleep first; zero when the peer is within its allowance.
    pub fn begin(&mut self, server_id: ServerId) -> Duration {
        let now = now_us();
        self.srv_time.entry(server_id).or_insert(0);
        if self.period_start == 0 {
            self.period_start = now;
            return Duration::ZERO;
        }

        let diff = now - self.period_start;
        let allowed = diff * self.max_time_pct / 100;
        let cnt_srvs = self.srv_time.len() as u64;
        let per_srv_allowed = allowed / cnt_srvs;
        let spent_srv = self.srv_time[&server_id];

        if per_srv_allowed < spent_srv {
            let to_wait = (cnt_srvs * (spent_srv - per_srv_allowed)).min(MAX_WAIT_US);
            return Duration::from_micros(to_wait);
        }

        let max_srv_time = self.srv_time.values().copied().max().unwrap_or(0);
        if max_srv_time * cnt_srvs <= allowed && diff > MIN_PERIOD_US {
            self.period_start = now;
            for time in self.srv_time.values_mut() {
                *time = 0;
            }
        }
        Duration::ZERO
    }

    /// Called after serving `server_id` with the time the session took.
    pub fn end(&mut self, server_id: ServerId, spent: Duration) {
        *self.srv_time.entry(server_id).or_insert(0) += spent.as_micros() as u64;
    }
}
