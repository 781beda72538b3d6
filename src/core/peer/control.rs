// src/core/peer/control.rs

//! Per-peer control object: owns the connection budget and socket pool, the
//! small/big mirror queues, the error throttle, and the initial-sync
//! accounting. All bookkeeping lives under one short-critical-section mutex;
//! socket I/O always happens outside it on spawned tasks.

use crate::core::clock::now_us;
use crate::core::distribution::ServerId;
use crate::core::errors::NetCacheError;
use crate::core::metrics;
use crate::core::peer::MirrorEvent;
use crate::core::peer::connection::{ActiveConnection, PeerSocket};
use crate::core::state::ServerState;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// The slice of configuration a peer control needs at runtime. Copied at
/// construction; the registry is static for the process lifetime.
#[derive(Debug, Clone)]
pub struct PeerTunables {
    pub max_total_conns: usize,
    pub max_bg_conns: usize,
    pub cnt_errors_to_throttle: u32,
    pub peer_throttle_period: u64,
    pub peer_timeout: u64,
    pub max_mirror_queue_size: usize,
    pub small_blob_boundary: u64,
    pub network_error_timeout: u64,
    pub max_syncs_one_server: usize,
    /// Background connections reserved for small-queue mirror traffic.
    pub mirror_small_exclusive: usize,
}

impl PeerTunables {
    pub fn from_config(mirror: &crate::config::MirrorConfig) -> Self {
        Self {
            max_total_conns: mirror.max_peer_total_conns,
            max_bg_conns: mirror.max_peer_bg_conns,
            cnt_errors_to_throttle: mirror.cnt_errors_to_throttle,
            peer_throttle_period: mirror.peer_throttle_period,
            peer_timeout: mirror.peer_timeout,
            max_mirror_queue_size: mirror.max_mirror_queue_size,
            small_blob_boundary: mirror.small_blob_boundary,
            network_error_timeout: mirror.network_error_timeout,
            max_syncs_one_server: mirror.max_syncs_one_server,
            mirror_small_exclusive: mirror.mirror_small_exclusive,
        }
    }
}

type ConnWaiter = oneshot::Sender<Result<ActiveConnection, NetCacheError>>;

#[derive(Default)]
struct PeerInner {
    pooled: Vec<PeerSocket>,
    active_conns: usize,
    bg_conns: usize,
    first_nw_err_time: u64,
    throttle_start: u64,
    next_sync_time: u64,
    cnt_nw_errors: u32,
    in_throttle: bool,
    slots_to_init_sync: u16,
    initially_synced: bool,
    cnt_active_syncs: usize,
    small_mirror: VecDeque<MirrorEvent>,
    big_mirror: VecDeque<MirrorEvent>,
    client_waiters: VecDeque<ConnWaiter>,
    sync_waiters: VecDeque<ConnWaiter>,
}

impl PeerInner {
    fn has_bg_tasks(&self) -> bool {
        !self.small_mirror.is_empty()
            || !self.big_mirror.is_empty()
            || !self.sync_waiters.is_empty()
    }
}

/// One instance per configured remote peer, alive for the process lifetime.
pub struct PeerControl {
    srv_id: ServerId,
    state: Weak<ServerState>,
    tun: PeerTunables,
    inner: Mutex<PeerInner>,
}

/// Applies jitter and keeps `var` monotonically non-decreasing.
fn set_next_time(var: &mut u64, mut value: u64, add_random: bool) {
    if add_random {
        value += rand::thread_rng().gen_range(0..1_000_000u64);
    }
    if *var < value {
        *var = value;
    }
}

impl PeerControl {
    pub fn new(srv_id: ServerId, state: Weak<ServerState>, tun: PeerTunables) -> Arc<Self> {
        Arc::new(Self {
            srv_id,
            state,
            tun,
            inner: Mutex::new(PeerInner::default()),
        })
    }

    pub fn srv_id(&self) -> ServerId {
        self.srv_id
    }

    pub fn tunables(&self) -> &PeerTunables {
        &self.tun
    }

    fn state(&self) -> Result<Arc<ServerState>, NetCacheError> {
        self.state
            .upgrade()
            .ok_or_else(|| NetCacheError::InvalidState("Server is shutting down".to_string()))
    }

    pub fn next_sync_time(&self) -> u64 {
        self.inner.lock().next_sync_time
    }

    pub fn is_initially_synced(&self) -> bool {
        self.inner.lock().initially_synced
    }

    pub fn is_in_throttle(&self) -> bool {
        self.inner.lock().in_throttle
    }

    // --- Error accounting and throttling ---

    pub fn register_conn_error(&self) {
        metrics::PEER_CONN_ERRORS_TOTAL.inc();
        let mut inner = self.inner.lock();
        if inner.first_nw_err_time == 0 {
            inner.first_nw_err_time = now_us();
        }
        inner.cnt_nw_errors += 1;
        if inner.cnt_nw_errors >= self.tun.cnt_errors_to_throttle {
            inner.in_throttle = true;
            inner.throttle_start = now_us();
        }
    }

    pub fn register_conn_success(&self) {
        let mut inner = self.inner.lock();
        inner.in_throttle = false;
        inner.first_nw_err_time = 0;
        inner.cnt_nw_errors = 0;
        inner.throttle_start = 0;
    }

    /// Opens and handshakes a fresh socket, honoring the throttle window.
    pub(crate) async fn create_socket(
        &self,
        state: &Arc<ServerState>,
    ) -> Result<PeerSocket, NetCacheError> {
        if state.is_shutting_down() {
            return Err(NetCacheError::InvalidState(
                "Server is shutting down".to_string(),
            ));
        }
        {
            let mut inner = self.inner.lock();
            if inner.in_throttle {
                let cur_time = now_us();
                if cur_time - inner.throttle_start <= self.tun.peer_throttle_period {
                    drop(inner);
                    warn!(
                        "Connection to {} is throttled",
                        state.distribution.peer_name(self.srv_id)
                    );
                    return Err(NetCacheError::Throttled);
                }
                inner.in_throttle = false;
                if inner.initially_synced {
                    inner.first_nw_err_time = 0;
                }
                inner.cnt_nw_errors = 0;
                inner.throttle_start = 0;
            }
        }

        let timeout = Duration::from_micros(self.tun.peer_timeout);
        match PeerSocket::connect(self.srv_id, state.distribution.self_id(), timeout).await {
            Ok(sock) => Ok(sock),
            Err(e) => {
                self.register_conn_error();
                Err(e)
            }
        }
    }

    // --- Connection budget ---

    fn reserve_bg_locked(inner: &mut PeerInner, tun: &PeerTunables) -> bool {
        if inner.active_conns >= tun.max_total_conns || inner.bg_conns >= tun.max_bg_conns {
            return false;
        }
        inner.active_conns += 1;
        inner.bg_conns += 1;
        true
    }

    fn unreserve_bg(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.bg_conns = inner.bg_conns.saturating_sub(1);
        self.do_release_locked(&mut inner, None);
    }

    /// Reserves a background connection immediately. Fails when the budget
    /// is exhausted; session starts do not wait for capacity.
    pub async fn get_bg_conn(self: &Arc<Self>) -> Result<ActiveConnection, NetCacheError> {
        let state = self.state()?;
        let pooled = {
            let mut inner = self.inner.lock();
            if !Self::reserve_bg_locked(&mut inner, &self.tun) {
                debug!(
                    "Too many active ({}) or background ({}) connections to {}",
                    inner.active_conns, inner.bg_conns, self.srv_id
                );
                return Err(NetCacheError::Network(
                    "Too many connections to peer".to_string(),
                ));
            }
            inner.pooled.pop()
        };
        let sock = match pooled {
            Some(sock) => sock,
            None => match self.create_socket(&state).await {
                Ok(sock) => sock,
                Err(e) => {
                    self.unreserve_bg();
                    return Err(e);
                }
            },
        };
        Ok(ActiveConnection::new(self.clone(), state, sock, true))
    }

    /// Reserves a background connection, parking the caller until the peer
    /// frees capacity. Used by sync task dispatch.
    pub async fn get_bg_conn_waiting(self: &Arc<Self>) -> Result<ActiveConnection, NetCacheError> {
        let state = self.state()?;
        let rx = {
            let mut inner = self.inner.lock();
            if Self::reserve_bg_locked(&mut inner, &self.tun) {
                let pooled = inner.pooled.pop();
                drop(inner);
                let sock = match pooled {
                    Some(sock) => sock,
                    None => match self.create_socket(&state).await {
                        Ok(sock) => sock,
                        Err(e) => {
                            self.unreserve_bg();
                            return Err(e);
                        }
                    },
                };
                return Ok(ActiveConnection::new(self.clone(), state, sock, true));
            }
            let (tx, rx) = oneshot::channel();
            inner.sync_waiters.push_back(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NetCacheError::InvalidState(
                "Server is shutting down".to_string(),
            )),
        }
    }

    /// Assigns a connection for a client-originated command, parking the
    /// caller when the total budget is exhausted.
    pub async fn get_client_conn(self: &Arc<Self>) -> Result<ActiveConnection, NetCacheError> {
        let state = self.state()?;
        let rx = {
            let mut inner = self.inner.lock();
            if inner.active_conns < self.tun.max_total_conns {
                inner.active_conns += 1;
                let pooled = inner.pooled.pop();
                drop(inner);
                let sock = match pooled {
                    Some(sock) => sock,
                    None => match self.create_socket(&state).await {
                        Ok(sock) => sock,
                        Err(e) => {
                            let err = match e {
                                NetCacheError::Throttled => NetCacheError::Throttled,
                                _ => NetCacheError::Network("Cannot connect to peer".to_string()),
                            };
                            let mut inner = self.inner.lock();
                            inner.active_conns = inner.active_conns.saturating_sub(1);
                            return Err(err);
                        }
                    },
                };
                return Ok(ActiveConnection::new(self.clone(), state, sock, false));
            }
            let (tx, rx) = oneshot::channel();
            inner.client_waiters.push_back(tx);
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(NetCacheError::InvalidState(
                "Server is shutting down".to_string(),
            )),
        }
    }

    /// Returns a finished connection's budget slot (and, when the command
    /// ended cleanly, its socket). Called from `ActiveConnection::drop`.
    pub(crate) fn release_connection(self: &Arc<Self>, sock: Option<PeerSocket>, was_bg: bool) {
        let mut inner = self.inner.lock();
        if was_bg {
            inner.bg_conns = inner.bg_conns.saturating_sub(1);
        }
        self.do_release_locked(&mut inner, sock);
    }

    /// The release priority order: a parked client first, then queued mirror
    /// work, then a parked sync controller, then back to the pool.
    fn do_release_locked(self: &Arc<Self>, inner: &mut PeerInner, mut sock: Option<PeerSocket>) {
        if let Some(tx) = inner.client_waiters.pop_front() {
            // The budget slot transfers to the client.
            self.spawn_handoff(tx, sock.take(), false);
            return;
        }

        if inner.bg_conns < self.tun.max_bg_conns {
            let big_cap = self
                .tun
                .max_bg_conns
                .saturating_sub(self.tun.mirror_small_exclusive);
            let event = if !inner.small_mirror.is_empty() {
                inner.small_mirror.pop_front()
            } else if !inner.big_mirror.is_empty() && inner.bg_conns < big_cap {
                inner.big_mirror.pop_front()
            } else {
                None
            };
            if let Some(event) = event {
                inner.bg_conns += 1;
                self.note_queue_size_change(-1);
                self.spawn_mirror(event, sock.take());
                return;
            }
            if let Some(tx) = inner.sync_waiters.pop_front() {
                inner.bg_conns += 1;
                self.spawn_handoff(tx, sock.take(), true);
                return;
            }
        }

        inner.active_conns = inner.active_conns.saturating_sub(1);
        if let Some(sock) = sock {
            inner.pooled.push(sock);
        }
    }

    /// Hands a connection to a parked waiter, connecting first when no
    /// pooled socket came back with the release.
    fn spawn_handoff(self: &Arc<Self>, tx: ConnWaiter, sock: Option<PeerSocket>, for_bg: bool) {
        let peer = self.clone();
        tokio::spawn(async move {
            let result = match peer.state() {
                Ok(state) => match sock {
                    Some(sock) => Ok(ActiveConnection::new(peer.clone(), state, sock, for_bg)),
                    None => match peer.create_socket(&state).await {
                        Ok(sock) => Ok(ActiveConnection::new(peer.clone(), state, sock, for_bg)),
                        Err(e) => Err(e),
                    },
                },
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            match tx.send(result) {
                Ok(()) if !failed => {}
                Ok(()) => {
                    // The waiter got an error: free the slot it never used.
                    let mut inner = peer.inner.lock();
                    if for_bg {
                        inner.bg_conns = inner.bg_conns.saturating_sub(1);
                    }
                    peer.do_release_locked(&mut inner, None);
                }
                Err(returned) => {
                    // The waiter is gone. A returned connection releases its
                    // slot through its own drop; an error needs manual help.
                    if returned.is_err() {
                        let mut inner = peer.inner.lock();
                        if for_bg {
                            inner.bg_conns = inner.bg_conns.saturating_sub(1);
                        }
                        peer.do_release_locked(&mut inner, None);
                    }
                }
            }
        });
    }

    // --- Mirror queue ---

    /// Queues (or immediately executes) one opportunistic replication event.
    /// Beyond the per-queue cap the event is dropped and counted.
    pub fn add_mirror_event(self: &Arc<Self>, event: MirrorEvent) {
        metrics::COPY_REQUESTS_TOTAL.inc();
        if let Ok(state) = self.state() {
            state.total_copy_requests.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();
        if Self::reserve_bg_locked(&mut inner, &self.tun) {
            let sock = inner.pooled.pop();
            drop(inner);
            self.spawn_mirror(event, sock);
            return;
        }

        let queue = if event.queue_size() <= self.tun.small_blob_boundary {
            &mut inner.small_mirror
        } else {
            &mut inner.big_mirror
        };
        if queue.len() < self.tun.max_mirror_queue_size {
            queue.push_back(event);
            self.note_queue_size_change(1);
        } else {
            drop(inner);
            self.count_rejected();
        }
    }

    fn note_queue_size_change(&self, delta: i64) {
        metrics::MIRROR_QUEUE_SIZE.add(delta as f64);
        if let Ok(state) = self.state() {
            let size = state.mirror_queue_size.fetch_add(delta, Ordering::Relaxed) + delta;
            state.mirror_log.append(&format!("{},{}", now_us(), size));
        }
    }

    fn count_rejected(&self) {
        metrics::COPY_REQUESTS_REJECTED.inc();
        if let Ok(state) = self.state() {
            state.copy_reqs_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn spawn_mirror(self: &Arc<Self>, event: MirrorEvent, sock: Option<PeerSocket>) {
        let peer = self.clone();
        tokio::spawn(async move {
            let state = match peer.state() {
                Ok(state) => state,
                Err(_) => return,
            };
            let sock = match sock {
                Some(sock) => Some(sock),
                None => match peer.create_socket(&state).await {
                    Ok(sock) => Some(sock),
                    Err(_) => {
                        peer.count_rejected();
                        peer.unreserve_bg();
                        None
                    }
                },
            };
            let Some(sock) = sock else { return };
            let self_id = state.distribution.self_id();
            let mut conn = ActiveConnection::new(peer.clone(), state, sock, true);
            let result = match &event {
                MirrorEvent::Write {
                    key,
                    slot,
                    orig_rec_no,
                    ..
                } => conn.copy_put(None, key, *slot, *orig_rec_no).await,
                MirrorEvent::Prolong {
                    key,
                    slot,
                    orig_rec_no,
                    orig_time,
                    summary,
                } => {
                    conn.copy_prolong(
                        None,
                        key,
                        *slot,
                        *orig_rec_no,
                        *orig_time,
                        self_id,
                        summary,
                    )
                    .await
                }
                MirrorEvent::Remove {
                    key,
                    slot,
                    orig_rec_no,
                    orig_time,
                } => conn.copy_remove(key, *slot, *orig_rec_no, *orig_time).await,
            };
            if let Err(e) = result {
                debug!("Mirror event to {} failed: {e}", peer.srv_id);
                peer.count_rejected();
            }
        });
    }

    pub fn mirror_queue_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.small_mirror.len() + inner.big_mirror.len()
    }

    // --- Active sync accounting ---

    /// Claims one of this peer's concurrent sync session slots.
    pub fn start_active_sync(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.cnt_active_syncs >= self.tun.max_syncs_one_server {
            return false;
        }
        inner.cnt_active_syncs += 1;
        true
    }

    /// Records the end of a sync session on this peer, advancing both the
    /// pair's and the peer's next-sync times. While network errors persist
    /// past the configured timeout, the peer's unfinished initial-sync slots
    /// are force-marked synced.
    pub fn register_sync_stop(&self, is_passive: bool, next_sync_time: &mut u64, next_delay: u64) {
        let mut inner = self.inner.lock();
        let now = now_us();
        let next_time = now + next_delay;
        set_next_time(next_sync_time, next_time, true);
        if inner.first_nw_err_time == 0 {
            set_next_time(&mut inner.next_sync_time, now, false);
        } else {
            set_next_time(&mut inner.next_sync_time, next_time, true);
            if now - inner.first_nw_err_time >= self.tun.network_error_timeout {
                let remaining = inner.slots_to_init_sync;
                let aborted = inner.first_nw_err_time == 1;
                self.slots_initially_synced_locked(&mut inner, remaining, aborted);
            }
        }

        if !is_passive {
            inner.cnt_active_syncs = inner.cnt_active_syncs.saturating_sub(1);
        }
    }

    pub fn set_slots_for_init_sync(&self, cnt_slots: u16) {
        let mut inner = self.inner.lock();
        inner.slots_to_init_sync = cnt_slots;
        inner.initially_synced = cnt_slots == 0;
    }

    pub fn add_initially_synced_slot(&self) {
        let mut inner = self.inner.lock();
        self.slots_initially_synced_locked(&mut inner, 1, false);
    }

    /// Marks this peer's initial sync aborted; the next sync stop sweeps its
    /// remaining slots.
    pub fn abort_initial_sync(&self) {
        self.inner.lock().first_nw_err_time = 1;
    }

    fn slots_initially_synced_locked(&self, inner: &mut PeerInner, cnt_slots: u16, aborted: bool) {
        if cnt_slots == 0 || inner.slots_to_init_sync == 0 {
            return;
        }
        let Ok(state) = self.state() else { return };
        let succeeded = cnt_slots == 1;
        if !succeeded {
            info!(
                "Initial sync: server {} is out of reach",
                state.distribution.peer_name(self.srv_id)
            );
        }
        inner.slots_to_init_sync = inner.slots_to_init_sync.saturating_sub(cnt_slots);
        if inner.slots_to_init_sync == 0 {
            if !inner.initially_synced {
                info!(
                    "Initial sync: for {} completed",
                    state.distribution.peer_name(self.srv_id)
                );
                inner.initially_synced = true;
                state.sync_on_init.fetch_sub(1, Ordering::SeqCst);
            }
            if aborted && state.aborted_sync_clients.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracing::error!("Initial sync: unable to synchronize with any server");
                state.request_shutdown();
            }
            if state.wait_to_open_to_clients.fetch_sub(1, Ordering::SeqCst) == 1 {
                state.initial_sync_complete();
            }
        }
    }

    // --- Shutdown ---

    /// Fails every parked waiter; called once the node enters shutdown.
    pub fn fail_waiters_for_shutdown(&self) {
        let (clients, syncs) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.client_waiters),
                std::mem::take(&mut inner.sync_waiters),
            )
        };
        for tx in clients.into_iter().chain(syncs) {
            let _ = tx.send(Err(NetCacheError::InvalidState(
                "Server is shutting down".to_string(),
            )));
        }
    }

    /// True when nothing is in flight towards this peer any more.
    pub fn ready_for_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.pooled.clear();
        inner.active_conns == 0 && !inner.has_bg_tasks() && inner.client_waiters.is_empty()
    }
}
