// src/core/tasks/log_cleaner.rs

//! Periodic sync log cleaning. Each pass visits every self slot: idle slots
//! are cleaned immediately, busy slots over their cap get a forced clean
//! flagged, which blocks new sync starts until the cleaner runs.

use crate::core::metrics;
use crate::core::state::ServerState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub fn spawn_log_cleaner(state: &Arc<ServerState>) -> JoinHandle<()> {
    let state = state.clone();
    tokio::spawn(cleaner_main(state))
}

async fn cleaner_main(state: Arc<ServerState>) {
    let mut shutdown_rx = state.subscribe_shutdown();
    let interval = Duration::from_secs(state.config.mirror.clean_attempt_interval);
    // The tail window pads the forced-clean pacing so freshly appended
    // events are never forced out while a diff may still reference them.
    let forced_period = state.config.mirror.min_forced_clean_period
        + state.config.mirror.periodic_sync_tail_time;
    let mut last_force_time: HashMap<u16, u64> = HashMap::new();

    while !state.is_shutting_down() {
        for slot_data in state.sync.slots.values() {
            let slot = slot_data.slot;
            let idle = {
                let mut inner = slot_data.inner.lock();
                if inner.cnt_sync_started == 0 {
                    inner.cleaning = true;
                    true
                } else {
                    false
                }
            };
            if idle {
                let cleaned = state.sync_log.clean(slot);
                if cleaned > 0 {
                    debug!("Cleaned {cleaned} sync log records in slot {slot}");
                }
                let mut inner = slot_data.inner.lock();
                inner.cleaning = false;
                if inner.clean_required {
                    inner.clean_required = false;
                    last_force_time.insert(slot, crate::core::clock::now_us());
                }
            } else {
                let now = crate::core::clock::now_us();
                let last = last_force_time.get(&slot).copied().unwrap_or(0);
                let mut inner = slot_data.inner.lock();
                if !inner.clean_required
                    && !state.has_servers_for_init_sync()
                    && state.sync_log.is_over_limit(slot)
                    && now.saturating_sub(last) >= forced_period
                {
                    inner.clean_required = true;
                }
            }
        }
        metrics::SYNC_LOG_RECORDS.set(state.sync_log.log_size() as f64);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.sync.cleaner_notify.notified() => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}
