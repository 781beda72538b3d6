// src/core/sync_log/mod.rs

//! The per-slot append-only journal of blob mutation events and the decision
//! procedure that diffs two servers' views of a slot. The log is the source
//! of truth for event-based periodic sync; once a peer's synced position has
//! been cleaned out of the window, reconciliation falls back to full blob
//! lists.

pub mod persist;

use crate::config::MirrorConfig;
use crate::core::clock::now_us;
use crate::core::distribution::ServerId;
use crate::core::storage::BlobKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Blob mutation event types carried by the log and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Write = 0,
    Prolong = 1,
    Remove = 3,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EventType::Write),
            1 => Some(EventType::Prolong),
            3 => Some(EventType::Remove),
            _ => None,
        }
    }

    /// Write and Remove compete for the same reduced-map cell.
    pub fn is_write_class(&self) -> bool {
        !matches!(self, EventType::Prolong)
    }
}

/// Single event record.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// Local sequential number, assigned at append time.
    pub rec_no: u64,
    pub blob_size: u64,
    pub key: BlobKey,
    pub event_type: EventType,
    /// Timestamp of the event when it originated by a client, microseconds.
    pub orig_time: u64,
    /// The server where the event originated.
    pub orig_server: ServerId,
    /// Record number on the origin server.
    pub orig_rec_no: u64,
    /// Timestamp when the record was recorded locally.
    pub local_time: u64,
}

impl SyncEvent {
    /// Event ordering used by conflict resolution: origin time first, origin
    /// rec-no for same-server ties, Write beats non-Write across servers,
    /// server id as the last resort.
    pub fn is_older(&self, other: &SyncEvent) -> bool {
        if self.orig_time != other.orig_time {
            return self.orig_time < other.orig_time;
        }

        // Timestamps matched; same host can be ordered by record number.
        if self.orig_server == other.orig_server {
            return self.orig_rec_no < other.orig_rec_no;
        }

        if self.event_type == EventType::Write && other.event_type != EventType::Write {
            return false;
        }
        if other.event_type == EventType::Write && self.event_type != EventType::Write {
            return true;
        }

        self.orig_server < other.orig_server
    }

    /// Same origin: the very same event seen from two sides.
    pub fn same_origin(&self, other: &SyncEvent) -> bool {
        self.orig_server == other.orig_server && self.orig_rec_no == other.orig_rec_no
    }
}

/// Reduced per-key view: at most one Write/Remove and one Prolong survive.
#[derive(Debug, Clone, Default)]
pub struct BlobEvent {
    pub wr_or_rm: Option<Arc<SyncEvent>>,
    pub prolong: Option<Arc<SyncEvent>>,
}

impl BlobEvent {
    /// The highest rec-no of this cell whose local time is before `limit`;
    /// 0 when nothing qualifies.
    fn max_rec_no_within(&self, limit: u64) -> u64 {
        if let Some(pr) = &self.prolong {
            if pr.local_time < limit {
                return pr.rec_no;
            }
        }
        if let Some(wr) = &self.wr_or_rm {
            if wr.local_time < limit {
                return wr.rec_no;
            }
        }
        0
    }

    /// Folds one event into the cell during the tail-first log walk: the
    /// first Write/Remove seen wins and disables Prolong memorization.
    pub fn absorb(&mut self, evt: &Arc<SyncEvent>) {
        match evt.event_type {
            EventType::Write | EventType::Remove => {
                if self.wr_or_rm.is_none() {
                    self.wr_or_rm = Some(evt.clone());
                }
            }
            EventType::Prolong => {
                if self.wr_or_rm.is_none() && self.prolong.is_none() {
                    self.prolong = Some(evt.clone());
                }
            }
        }
    }
}

/// Key-sorted reduced event map for one side of a sync session.
pub type ReducedEvents = BTreeMap<String, BlobEvent>;

/// Ordered diff output of the decision procedure.
pub type SyncEventList = Vec<Arc<SyncEvent>>;

/// The result of diffing two reduced maps.
#[derive(Debug, Default)]
pub struct SyncOperations {
    pub to_get: SyncEventList,
    pub to_send: SyncEventList,
    pub local_synced: u64,
    pub remote_synced: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SrvSynced {
    local_rec_no: u64,
    remote_rec_no: u64,
}

#[derive(Debug, Default)]
struct GlobalState {
    synced: HashMap<ServerId, HashMap<u16, SrvSynced>>,
    last_written: u64,
}

#[derive(Debug, Default)]
struct SlotLog {
    events: Mutex<VecDeque<Arc<SyncEvent>>>,
}

/// The process-global sync log. The global lock guards the synced-position
/// table and the record counter; each slot's event deque has its own lock so
/// linear scans never block unrelated slots.
pub struct SyncLog {
    self_id: ServerId,
    head_time: u64,
    max_slot_records: u64,
    clean_reserve: u64,
    max_clean_batch: u64,
    global: Mutex<GlobalState>,
    slots: Mutex<HashMap<u16, Arc<SlotLog>>>,
    total_records: AtomicU64,
}

impl SyncLog {
    pub fn new(self_id: ServerId, mirror: &MirrorConfig) -> Self {
        Self {
            self_id,
            head_time: mirror.periodic_sync_head_time,
            max_slot_records: mirror.max_slot_log_records,
            clean_reserve: mirror.clean_slot_log_reserve,
            max_clean_batch: mirror.max_clean_log_batch,
            global: Mutex::new(GlobalState::default()),
            slots: Mutex::new(HashMap::new()),
            total_records: AtomicU64::new(0),
        }
    }

    fn slot_log(&self, slot: u16) -> Arc<SlotLog> {
        let mut slots = self.slots.lock();
        slots.entry(slot).or_default().clone()
    }

    /// Appends an event: stamps `local_time`, assigns the next global record
    /// number, and fixes `orig_rec_no` for locally-originated events before
    /// the record becomes visible.
    pub fn append(&self, slot: u16, mut event: SyncEvent) -> u64 {
        let slot_log = self.slot_log(slot);
        let mut events = slot_log.events.lock();

        event.local_time = now_us();
        {
            let mut global = self.global.lock();
            global.last_written += 1;
            event.rec_no = global.last_written;
        }
        // The record number must be settled before another thread can start a
        // sync that would carry this event's origin position.
        if event.orig_server == self.self_id {
            event.orig_rec_no = event.rec_no;
        }

        let rec_no = event.rec_no;
        events.push_back(Arc::new(event));
        self.total_records.fetch_add(1, Ordering::Relaxed);
        rec_no
    }

    /// Last synchronized record numbers for the pair; zeros for unknown pairs.
    pub fn get_last_synced(&self, server: ServerId, slot: u16) -> (u64, u64) {
        let mut global = self.global.lock();
        let data = global
            .synced
            .entry(server)
            .or_default()
            .entry(slot)
            .or_default();
        (data.local_rec_no, data.remote_rec_no)
    }

    /// Stores the pair's synced positions. Monotonic: a write never decreases
    /// either value.
    pub fn set_last_synced(&self, server: ServerId, slot: u16, local: u64, remote: u64) {
        let mut global = self.global.lock();
        let data = global
            .synced
            .entry(server)
            .or_default()
            .entry(slot)
            .or_default();
        data.local_rec_no = data.local_rec_no.max(local);
        data.remote_rec_no = data.remote_rec_no.max(remote);
    }

    /// The last record number in the given slot, or the global counter when
    /// the slot is empty.
    pub fn current_rec_no(&self, slot: u16) -> u64 {
        let slot_log = self.slot_log(slot);
        let events = slot_log.events.lock();
        match events.back() {
            Some(evt) => evt.rec_no,
            None => self.global.lock().last_written,
        }
    }

    pub fn last_rec_no(&self) -> u64 {
        self.global.lock().last_written
    }

    pub fn log_size(&self) -> u64 {
        self.total_records.load(Ordering::Relaxed)
    }

    pub fn slot_log_size(&self, slot: u16) -> u64 {
        let slot_log = self.slot_log(slot);
        let len = slot_log.events.lock().len();
        len as u64
    }

    pub fn is_over_limit(&self, slot: u16) -> bool {
        self.slot_log_size(slot) > self.max_slot_records
    }

    /// Builds the reduced event view of one slot for the pair, starting from
    /// the later of the caller's positions and the persisted ones (both get
    /// promoted). Returns `false` when `local_start` has been cleaned out of
    /// the log and a blob-list fallback is required.
    pub fn get_events_list(
        &self,
        server: ServerId,
        slot: u16,
        local_start: &mut u64,
        remote_start: &mut u64,
        events_out: &mut ReducedEvents,
    ) -> bool {
        {
            let mut global = self.global.lock();
            let data = global
                .synced
                .entry(server)
                .or_default()
                .entry(slot)
                .or_default();
            if data.local_rec_no > *local_start {
                *local_start = data.local_rec_no;
            } else {
                data.local_rec_no = *local_start;
            }
            if data.remote_rec_no > *remote_start {
                *remote_start = data.remote_rec_no;
            } else {
                data.remote_rec_no = *remote_start;
            }
        }

        let slot_log = self.slot_log(slot);
        let events = slot_log.events.lock();

        // Event sync is possible only when every record past the start
        // position is still present: the window must reach back to the
        // position itself (or to the very first record ever written, for a
        // peer that has never synced).
        let last_written = self.global.lock().last_written;
        if events.is_empty()
            || events.front().map(|e| e.rec_no).unwrap_or(0) > *local_start + 1
            || last_written < *local_start
        {
            // The required records are not available any more; all the blobs
            // will be exchanged.
            return false;
        }

        // Walk from the tail; records are ordered by local time, not origin
        // time, so the cut point is the first record below the start.
        for evt in events.iter().rev() {
            if evt.rec_no < *local_start {
                break;
            }
            events_out.entry(evt.key.raw()).or_default().absorb(evt);
        }
        true
    }

    /// Computes the operation lists for one sync session: the local reduced
    /// view is diffed against the remote one in both directions. `None` means
    /// the local start position is gone and the session must switch to blob
    /// lists.
    pub fn get_sync_operations(
        &self,
        server: ServerId,
        slot: u16,
        mut local_start: u64,
        mut remote_start: u64,
        remote_events: &ReducedEvents,
    ) -> Option<SyncOperations> {
        let mut local_events = ReducedEvents::new();
        if !self.get_events_list(server, slot, &mut local_start, &mut remote_start, &mut local_events)
        {
            return None;
        }

        let now = now_us();
        let mut to_send = SyncEventList::new();
        let mut to_get = SyncEventList::new();
        let local_synced = compare_events(
            &local_events,
            local_start,
            now,
            self.head_time,
            remote_events,
            &mut to_send,
        );
        let remote_synced = compare_events(
            remote_events,
            remote_start,
            now,
            self.head_time,
            &local_events,
            &mut to_get,
        );
        Some(SyncOperations {
            to_get,
            to_send,
            local_synced,
            remote_synced,
        })
    }

    /// The lowest local synced position that still falls inside the slot's
    /// current log window. Peers whose position is behind the window do not
    /// constrain cleaning: they cannot event-sync from there anyway.
    fn min_synced_within_window(&self, slot: u16, events: &VecDeque<Arc<SyncEvent>>) -> u64 {
        let global = self.global.lock();
        let min_rec_no = events
            .front()
            .map(|e| e.rec_no)
            .unwrap_or(global.last_written);
        let mut result = global.last_written;
        for per_slot in global.synced.values() {
            let local = per_slot.get(&slot).map(|d| d.local_rec_no).unwrap_or(0);
            if local >= min_rec_no && local < result {
                result = local;
            }
        }
        result
    }

    /// Cleans one slot: first the prefix every in-window peer has already
    /// seen, then (if the slot is still over its cap) down to the reserve
    /// mark. Both phases together remove at most `max_clean_log_batch`
    /// records per call.
    pub fn clean(&self, slot: u16) -> u64 {
        let slot_log = self.slot_log(slot);
        let mut events = slot_log.events.lock();

        let clean_to = self.max_slot_records - self.clean_reserve;
        let mut cleaned = 0u64;
        let limit = self.min_synced_within_window(slot, &events);

        while cleaned < self.max_clean_batch {
            match events.front() {
                Some(front) if front.rec_no < limit => {
                    events.pop_front();
                    self.total_records.fetch_sub(1, Ordering::Relaxed);
                    cleaned += 1;
                }
                _ => break,
            }
        }
        if events.len() as u64 > self.max_slot_records {
            while events.len() as u64 > clean_to && cleaned < self.max_clean_batch {
                events.pop_front();
                self.total_records.fetch_sub(1, Ordering::Relaxed);
                cleaned += 1;
            }
        }
        cleaned
    }

    pub(crate) fn snapshot_slots_for_clean(&self) -> Vec<u16> {
        self.slots.lock().keys().copied().collect()
    }

    /// Snapshot of every slot's events, oldest first, for persistence.
    pub(crate) fn snapshot(&self) -> Vec<(u16, Vec<Arc<SyncEvent>>)> {
        let slots: Vec<(u16, Arc<SlotLog>)> = {
            let map = self.slots.lock();
            let mut list: Vec<_> = map.iter().map(|(s, l)| (*s, l.clone())).collect();
            list.sort_unstable_by_key(|(s, _)| *s);
            list
        };
        slots
            .into_iter()
            .map(|(slot, log)| {
                let events: Vec<Arc<SyncEvent>> = log.events.lock().iter().cloned().collect();
                (slot, events)
            })
            .collect()
    }

    pub(crate) fn synced_pairs(&self) -> Vec<(ServerId, u16, u64, u64)> {
        let global = self.global.lock();
        let mut pairs: Vec<_> = global
            .synced
            .iter()
            .flat_map(|(srv, slots)| {
                slots
                    .iter()
                    .map(|(slot, d)| (*srv, *slot, d.local_rec_no, d.remote_rec_no))
            })
            .collect();
        pairs.sort_unstable_by_key(|(srv, slot, _, _)| (*srv, *slot));
        pairs
    }

    pub(crate) fn restore(
        &self,
        pairs: Vec<(ServerId, u16, u64, u64)>,
        events: Vec<(u16, SyncEvent)>,
        start_log_rec_no: u64,
    ) {
        let mut last_written = start_log_rec_no;
        {
            let mut global = self.global.lock();
            for (srv, slot, local, remote) in pairs {
                let data = global.synced.entry(srv).or_default().entry(slot).or_default();
                data.local_rec_no = local;
                data.remote_rec_no = remote;
            }
        }
        let mut count = 0u64;
        for (slot, event) in events {
            last_written = last_written.max(event.rec_no);
            let slot_log = self.slot_log(slot);
            slot_log.events.lock().push_back(Arc::new(event));
            count += 1;
        }
        self.total_records.store(count, Ordering::Relaxed);
        self.global.lock().last_written = last_written;
    }

    pub(crate) fn reset(&self, start_log_rec_no: u64) {
        self.slots.lock().clear();
        self.total_records.store(0, Ordering::Relaxed);
        let mut global = self.global.lock();
        global.synced.clear();
        global.last_written = start_log_rec_no;
    }
}

/// One direction of the decision procedure: walks `src`, consults `other`,
/// and appends the events `src`'s side must push into `diff`. Returns the
/// greatest safe record number on `src`'s side.
///
/// Events whose local time falls inside the quiet head window near `now` are
/// excluded so in-flight traffic is not raced.
fn compare_events(
    src: &ReducedEvents,
    start_rec_no: u64,
    now: u64,
    head_time: u64,
    other: &ReducedEvents,
    diff: &mut SyncEventList,
) -> u64 {
    let time_limit = now.saturating_sub(head_time);
    let mut max_rec_no = 0u64;
    let mut other_iter = other.iter().peekable();

    for (key, cell) in src {
        let op_rec_no = cell.max_rec_no_within(time_limit);
        if op_rec_no <= start_rec_no {
            continue;
        }
        if op_rec_no > max_rec_no {
            max_rec_no = op_rec_no;
        }

        // Both maps are key-sorted, so the other side is consumed in one
        // forward pass.
        let mut found = None;
        while let Some((other_key, other_cell)) = other_iter.peek() {
            if *other_key == key {
                found = Some((*other_cell).clone());
                break;
            }
            if other_key.as_str() > key.as_str() {
                break;
            }
            other_iter.next();
        }

        let Some(other_cell) = found else {
            // No operations with this blob on the other side; take ours.
            if let Some(wr) = &cell.wr_or_rm {
                if wr.rec_no > start_rec_no {
                    diff.push(wr.clone());
                }
            } else if let Some(pr) = &cell.prolong {
                if pr.local_time < time_limit {
                    diff.push(pr.clone());
                }
            }
            continue;
        };

        if let Some(wr) = &cell.wr_or_rm {
            if wr.rec_no > start_rec_no {
                process_write(wr, &other_cell, diff);
            }
        }
        if let Some(pr) = &cell.prolong {
            if pr.local_time < time_limit {
                process_prolong(cell, pr, &other_cell, diff);
            }
        }
    }

    if max_rec_no != 0 { max_rec_no } else { start_rec_no }
}

/// A Write/Remove was found in the source interval.
fn process_write(src: &Arc<SyncEvent>, other: &BlobEvent, diff: &mut SyncEventList) {
    if let Some(other_wr) = &other.wr_or_rm {
        // A write or remove on the other side decides regardless of prolongs.
        if !other_wr.same_origin(src) && other_wr.is_older(src) {
            diff.push(src.clone());
        }
    } else {
        // The other side only saw a lone prolong.
        diff.push(src.clone());
    }
}

/// A Prolong was found in the source interval; `src_cell` may also carry a
/// Write/Remove for the same key.
fn process_prolong(
    src_cell: &BlobEvent,
    src_prolong: &Arc<SyncEvent>,
    other: &BlobEvent,
    diff: &mut SyncEventList,
) {
    if let Some(other_pr) = &other.prolong {
        if other_pr.same_origin(src_prolong) {
            return;
        }
        let writes_agree = match (&src_cell.wr_or_rm, &other.wr_or_rm) {
            (None, _) => true,
            (Some(src_wr), Some(other_wr)) => {
                other_wr.same_origin(src_wr) || src_wr.is_older(other_wr)
            }
            (Some(_), None) => false,
        };
        if other_pr.is_older(src_prolong) && writes_agree {
            diff.push(src_prolong.clone());
        }
    } else if let Some(other_wr) = &other.wr_or_rm {
        if other_wr.event_type == EventType::Write {
            let writes_agree = match &src_cell.wr_or_rm {
                None => true,
                Some(src_wr) => other_wr.same_origin(src_wr) || src_wr.is_older(other_wr),
            };
            if other_wr.is_older(src_prolong) && writes_agree {
                diff.push(src_prolong.clone());
            }
        }
    }
}
