//! Write-optimized leaf: a log-structured record array.
//!
//! Records land in an append region guarded by a single append lock. Each
//! time a piece of `P` freshly appended records completes, it is sorted and
//! the read-only watermark advances, so the leaf is a bulk-loaded sorted
//! prefix followed by sorted pieces and a small unsorted tail. Lookups
//! binary-search the sorted runs and linear-scan the tail; scans and dumps
//! k-way merge all runs.
//!
//! Locking rules: appends take the append lock; payload mutation anywhere in
//! the leaf takes the sort lock; a piece sort takes the sort lock; dumps take
//! both. Optimistic readers of the tail validate against the sort lock
//! version.

use super::node::{LeafRead, LeafScan, LeafStore, LeafWrite, Node};
use super::split::{k_way_merge, k_way_scan, search_cells};
use super::Ctx;
use crate::record::{empty_cells, Key, Record, SlotCell, Value, NO_VALUE};
use crate::sync::{EpochGuard, VersionLock};
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) struct WoBody {
    cap: u32,
    piece: u32,
    /// Sorted prefix laid down at construction.
    initial: u32,
    /// End of the last fully sorted piece.
    readonly: AtomicU32,
    /// Total populated records.
    readable: AtomicU32,
    recs: Box<[SlotCell]>,
    /// Serializes appends.
    append_lock: VersionLock,
    /// Serializes piece sorts and payload writes; tail readers validate it.
    sort_lock: VersionLock,
}

pub(crate) enum UpsertRaw {
    Inserted,
    Updated,
    /// No free slot; only possible on a morph shadow under extreme churn.
    Full,
}

impl WoBody {
    pub(crate) fn empty(cap: usize, piece: usize) -> Self {
        WoBody::from_sorted(&[], cap, piece)
    }

    pub(crate) fn from_sorted(recs: &[Record], cap: usize, piece: usize) -> Self {
        // Splitting an over-full morph shadow can hand us more records than
        // the configured capacity; keep append headroom regardless.
        let cap = cap.max((recs.len() / piece + 2) * piece);
        let cells = empty_cells(cap);
        for (cell, rec) in cells.iter().zip(recs) {
            cell.store(*rec);
        }
        let n = recs.len() as u32;
        WoBody {
            cap: cap as u32,
            piece: piece as u32,
            initial: n,
            readonly: AtomicU32::new(n),
            readable: AtomicU32::new(n),
            recs: cells,
            append_lock: VersionLock::new(),
            sort_lock: VersionLock::new(),
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        let rd = self.readable.load(Ordering::Acquire) as usize;
        self.recs[..rd].iter().filter(|c| c.val() != NO_VALUE).count()
    }

    /// Binary-search the stable sorted runs: the initial prefix plus every
    /// piece below `readonly_snapshot`.
    fn search_frozen(&self, k: Key, readonly_snapshot: u32) -> Option<usize> {
        let initial = self.initial as usize;
        if let Some(idx) = search_cells(&self.recs, initial, k) {
            return Some(idx);
        }
        let piece = self.piece as usize;
        let mut start = initial;
        while start < readonly_snapshot as usize {
            if let Some(idx) = search_cells(&self.recs[start..start + piece], piece, k) {
                return Some(start + idx);
            }
            start += piece;
        }
        None
    }

    /// Search the regions that may have changed since `readonly_snapshot`
    /// was taken. The sort lock must be held.
    fn search_moving(&self, k: Key, readonly_snapshot: u32, limit: u32) -> Option<usize> {
        debug_assert!(self.sort_lock.is_locked());
        let piece = self.piece as usize;
        let ro_now = self.readonly.load(Ordering::Acquire).min(limit);
        let mut start = readonly_snapshot as usize;
        while start + piece <= ro_now as usize {
            if let Some(idx) = search_cells(&self.recs[start..start + piece], piece, k) {
                return Some(start + idx);
            }
            start += piece;
        }
        (start..limit as usize).find(|&i| self.recs[i].key() == k)
    }
}

fn header_snapshot(node: &Node, body: &WoBody) -> Option<(Key, *mut Node, bool)> {
    let hv = node.header_lock.read_begin();
    let body_ptr = node.body_ptr();
    let skey = node.skey.load(Ordering::Acquire);
    let sibling = node.sibling.load(Ordering::Acquire);
    if !node.header_lock.read_validate(hv) {
        return None;
    }
    let current = match unsafe { &*body_ptr } {
        super::node::Body::Wo(b) => std::ptr::eq(b, body),
        _ => false,
    };
    Some((skey, sibling, current))
}

pub(crate) fn store(
    node: &Node,
    body: &WoBody,
    k: Key,
    v: Value,
    ctx: &Ctx,
    guard: &EpochGuard,
) -> LeafStore {
    node.header_lock.lock_shared();
    if node_body_ptr(node, body).is_null() {
        node.header_lock.unlock_shared();
        return LeafStore::Retry;
    }
    if k >= node.skey.load(Ordering::Acquire) {
        let sibling = node.sibling.load(Ordering::Acquire);
        node.header_lock.unlock_shared();
        return LeafStore::Redirect(sibling);
    }

    let r_init = body.readonly.load(Ordering::Acquire);

    // Upsert path: overwrite in place when the key already exists.
    if let Some(idx) = body.search_frozen(k, r_init) {
        body.sort_lock.lock();
        let was_live = body.recs[idx].val() != NO_VALUE;
        body.recs[idx].set_val(v);
        body.sort_lock.unlock();
        return finish_write(node, k, v, !was_live, guard);
    }

    // Append path. The tail recheck under both locks also catches a racing
    // appender of the same key.
    body.append_lock.lock();
    let cur = body.readable.load(Ordering::Relaxed);
    body.sort_lock.lock();
    if let Some(idx) = body.search_moving(k, r_init, cur) {
        let was_live = body.recs[idx].val() != NO_VALUE;
        body.recs[idx].set_val(v);
        body.sort_lock.unlock();
        body.append_lock.unlock();
        return finish_write(node, k, v, !was_live, guard);
    }
    body.sort_lock.unlock();

    if cur == body.cap {
        body.append_lock.unlock();
        node.header_lock.unlock_shared();
        if let Some(shadow) = node.shadow_body(guard) {
            // The node is morphing and its log is exhausted; the write goes
            // to the shadow alone and survives the header swap.
            return match super::node::upsert_body_raw(shadow, k, v, true, guard) {
                UpsertRaw::Full => LeafStore::Retry,
                UpsertRaw::Inserted => LeafStore::Done { inserted: true },
                UpsertRaw::Updated => LeafStore::Done { inserted: false },
            };
        }
        // Wait for the in-flight split to install fresh bodies.
        return LeafStore::Retry;
    }

    body.recs[cur as usize].store(Record::new(k, v));
    body.readable.store(cur + 1, Ordering::Release);
    if node.node_lock.is_locked() {
        // A split or morph swap started underneath us and its dump may not
        // contain this record: undo and retry on the new body.
        body.readable.store(cur, Ordering::Relaxed);
        body.append_lock.unlock();
        node.header_lock.unlock_shared();
        return LeafStore::Retry;
    }
    body.append_lock.unlock();

    let next = cur + 1;
    if (next - body.initial) % body.piece == 0 {
        sort_completed_piece(body, next);
    }

    if next == body.cap {
        mirror(node, k, v, guard);
        node.header_lock.unlock_shared();
        return node.do_split(true, ctx, guard);
    }
    finish_write(node, k, v, true, guard)
}

/// Identity of `body` within `node`; used to detect body swaps. Returns a
/// pointer that only compares equal to the current body pointer when `body`
/// is still installed.
fn node_body_ptr(node: &Node, body: &WoBody) -> *mut super::node::Body {
    let cur = node.body_ptr();
    match unsafe { &*cur } {
        super::node::Body::Wo(b) if std::ptr::eq(b, body) => cur,
        _ => std::ptr::null_mut(),
    }
}

/// Commit an in-place write: if a structure change is dumping concurrently
/// it may have missed the write, so redo against the post-swap body;
/// otherwise mirror into the shadow and report. Releases the shared header
/// hold.
fn finish_write(node: &Node, k: Key, v: Value, inserted: bool, guard: &EpochGuard) -> LeafStore {
    if node.node_lock.is_locked() {
        node.header_lock.unlock_shared();
        return LeafStore::Retry;
    }
    mirror(node, k, v, guard);
    node.header_lock.unlock_shared();
    LeafStore::Done { inserted }
}

/// Mirror a committed write into the morph shadow, if one is present.
fn mirror(node: &Node, k: Key, v: Value, guard: &EpochGuard) {
    if let Some(shadow) = node.shadow_body(guard) {
        // The shadow is sized with headroom; Full here means the morph swap
        // is imminent and the slow retry path of the caller would handle it.
        // Spin briefly to let migration settle instead.
        let mut attempt = 0;
        while matches!(
            super::node::upsert_body_raw(shadow, k, v, true, guard),
            UpsertRaw::Full
        ) {
            crate::sync::backoff(attempt);
            attempt += 1;
            if node.shadow_body(guard).is_none() {
                break;
            }
        }
    }
}

fn sort_completed_piece(body: &WoBody, next: u32) {
    body.sort_lock.lock();
    let ro = body.readonly.load(Ordering::Relaxed);
    if ro < next {
        let mut run: Vec<Record> = (ro..next)
            .map(|i| body.recs[i as usize].load())
            .collect();
        run.sort_unstable_by_key(|r| r.key);
        for (offset, rec) in run.into_iter().enumerate() {
            body.recs[ro as usize + offset].store(rec);
        }
        body.readonly.store(next, Ordering::Release);
    }
    body.sort_lock.unlock();
}

pub(crate) fn lookup(node: &Node, body: &WoBody, k: Key, guard: &EpochGuard) -> LeafRead {
    let (skey, sibling, current) = match header_snapshot(node, body) {
        Some(s) => s,
        None => return LeafRead::Retry,
    };
    if !current {
        return LeafRead::Retry;
    }
    if k >= skey {
        return LeafRead::Redirect(sibling);
    }

    let r_init = body.readonly.load(Ordering::Acquire);
    if let Some(idx) = body.search_frozen(k, r_init) {
        let val = body.recs[idx].val();
        return LeafRead::Done((val != NO_VALUE).then_some(val));
    }

    // Tail scan, validated against the sort lock.
    loop {
        let sv = body.sort_lock.read_begin();
        let rd = body.readable.load(Ordering::Acquire);
        let mut hit = None;
        for i in r_init as usize..rd as usize {
            let rec = body.recs[i].load();
            if rec.key == k {
                hit = Some(rec);
                break;
            }
        }
        if !body.sort_lock.read_validate(sv) {
            continue;
        }
        if let Some(rec) = hit {
            return LeafRead::Done(rec.is_live().then_some(rec.val));
        }
        break;
    }

    if let Some(shadow) = node.shadow_body(guard) {
        return LeafRead::Done(super::node::probe_body_raw(shadow, k));
    }
    LeafRead::Done(None)
}

pub(crate) fn write_payload(
    node: &Node,
    body: &WoBody,
    k: Key,
    v: Value,
    guard: &EpochGuard,
) -> LeafWrite {
    loop {
        node.header_lock.lock_shared();
        if node_body_ptr(node, body).is_null() {
            node.header_lock.unlock_shared();
            return LeafWrite::Retry;
        }
        if k >= node.skey.load(Ordering::Acquire) {
            let sibling = node.sibling.load(Ordering::Acquire);
            node.header_lock.unlock_shared();
            return LeafWrite::Redirect(sibling);
        }

        let r_init = body.readonly.load(Ordering::Acquire);
        body.sort_lock.lock();
        let idx = body
            .search_frozen(k, r_init)
            .or_else(|| body.search_moving(k, r_init, body.readable.load(Ordering::Acquire)));
        let found = match idx {
            Some(idx) if body.recs[idx].val() != NO_VALUE => {
                body.recs[idx].set_val(v);
                true
            }
            _ => false,
        };
        body.sort_lock.unlock();

        if node.node_lock.is_locked() {
            // The record may have been dumped before our write; redo against
            // the post-swap body.
            node.header_lock.unlock_shared();
            return LeafWrite::Retry;
        }
        if found {
            mirror(node, k, v, guard);
        }
        node.header_lock.unlock_shared();
        return LeafWrite::Done(found);
    }
}

/// Snapshot the sorted runs of this leaf: the bulk-loaded prefix, each
/// sorted piece, and the tail (sorted on the way out). Takes both leaf
/// locks for the copy, which also serializes the snapshot against every
/// in-flight write (the morph protocol relies on that ordering).
fn collect_runs(body: &WoBody) -> Vec<Vec<Record>> {
    body.append_lock.lock();
    let rd = body.readable.load(Ordering::Acquire);
    body.sort_lock.lock();
    let ro = body.readonly.load(Ordering::Acquire);

    let mut runs: Vec<Vec<Record>> = Vec::new();
    let initial = body.initial;
    if initial > 0 {
        runs.push((0..initial).map(|i| body.recs[i as usize].load()).collect());
    }
    let piece = body.piece;
    let mut start = initial;
    while start < ro {
        runs.push(
            (start..start + piece)
                .map(|i| body.recs[i as usize].load())
                .collect(),
        );
        start += piece;
    }
    if ro < rd {
        let mut tail: Vec<Record> = (ro..rd).map(|i| body.recs[i as usize].load()).collect();
        tail.sort_unstable_by_key(|r| r.key);
        runs.push(tail);
    }

    body.sort_lock.unlock();
    body.append_lock.unlock();
    runs
}

/// Sorted live records of the whole leaf.
pub(crate) fn dump_sorted(body: &WoBody) -> Vec<Record> {
    k_way_merge(&collect_runs(body))
}

pub(crate) fn scan(
    node: &Node,
    body: &WoBody,
    from: Key,
    n: usize,
    out: &mut Vec<Record>,
    guard: &EpochGuard,
) -> LeafScan {
    let (skey, sibling, current) = match header_snapshot(node, body) {
        Some(s) => s,
        None => return LeafScan::Retry,
    };
    if !current {
        return LeafScan::Retry;
    }
    if from >= skey {
        return LeafScan::Redirect(sibling);
    }
    if node.shadow_body(guard).is_some() {
        // Morph in flight; its swap is imminent.
        return LeafScan::Retry;
    }

    let hv = node.header_lock.read_begin();
    let runs = collect_runs(body);
    let sibling = node.sibling.load(Ordering::Acquire);
    if !node.header_lock.read_validate(hv) {
        return LeafScan::Retry;
    }

    out.extend(k_way_scan(&runs, from, n - out.len()));
    LeafScan::Done(sibling)
}

/// Upsert directly into this body, bypassing routing and stats. Used for
/// shadow mirroring and morph migration.
pub(crate) fn upsert_raw(body: &WoBody, k: Key, v: Value, clobber: bool, _guard: &EpochGuard) -> UpsertRaw {
    let r_init = body.readonly.load(Ordering::Acquire);
    if let Some(idx) = body.search_frozen(k, r_init) {
        body.sort_lock.lock();
        if clobber {
            body.recs[idx].set_val(v);
        }
        body.sort_lock.unlock();
        return UpsertRaw::Updated;
    }
    body.append_lock.lock();
    let cur = body.readable.load(Ordering::Relaxed);
    body.sort_lock.lock();
    if let Some(idx) = body.search_moving(k, r_init, cur) {
        if clobber {
            body.recs[idx].set_val(v);
        }
        body.sort_lock.unlock();
        body.append_lock.unlock();
        return UpsertRaw::Updated;
    }
    body.sort_lock.unlock();
    if cur == body.cap {
        body.append_lock.unlock();
        return UpsertRaw::Full;
    }
    body.recs[cur as usize].store(Record::new(k, v));
    body.readable.store(cur + 1, Ordering::Release);
    body.append_lock.unlock();
    let next = cur + 1;
    if (next - body.initial) % body.piece == 0 {
        sort_completed_piece(body, next);
    }
    UpsertRaw::Inserted
}

/// Lock-free probe used when this body is consulted as a shadow.
pub(crate) fn probe_raw(body: &WoBody, k: Key) -> Option<Value> {
    let r_init = body.readonly.load(Ordering::Acquire);
    if let Some(idx) = body.search_frozen(k, r_init) {
        let val = body.recs[idx].val();
        return (val != NO_VALUE).then_some(val);
    }
    loop {
        let sv = body.sort_lock.read_begin();
        let rd = body.readable.load(Ordering::Acquire);
        let mut hit = None;
        for i in r_init as usize..rd as usize {
            let rec = body.recs[i].load();
            if rec.key == k {
                hit = Some(rec);
                break;
            }
        }
        if body.sort_lock.read_validate(sv) {
            return hit.and_then(|r| r.is_live().then_some(r.val));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_sort_as_they_complete() {
        let body = WoBody::empty(64, 8);
        let guard_keys: Vec<Key> = vec![9, 3, 7, 1, 8, 2, 6, 4];
        for (i, &k) in guard_keys.iter().enumerate() {
            body.recs[i].store(Record::new(k, k));
        }
        body.readable.store(8, Ordering::Release);
        sort_completed_piece(&body, 8);
        assert_eq!(body.readonly.load(Ordering::Relaxed), 8);
        let keys: Vec<Key> = (0..8).map(|i| body.recs[i].key()).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 6, 7, 8, 9]);
    }

    #[test]
    fn from_sorted_prefix_is_searchable() {
        let recs: Vec<Record> = (1..=40).map(|k| Record::new(k, k * 2)).collect();
        let body = WoBody::from_sorted(&recs, 64, 8);
        assert_eq!(body.initial, 40);
        assert_eq!(body.search_frozen(17, 40), Some(16));
        assert_eq!(body.search_frozen(41, 40), None);
    }

    #[test]
    fn capacity_grows_for_oversized_input() {
        let recs: Vec<Record> = (1..=100).map(|k| Record::new(k, k)).collect();
        let body = WoBody::from_sorted(&recs, 64, 8);
        assert!(body.cap as usize >= 100 + 8);
        assert_eq!(body.cap % body.piece, 0);
    }

    #[test]
    fn dump_merges_all_runs_and_drops_tombstones() {
        let recs: Vec<Record> = (1..=8).map(|k| Record::new(k * 10, k)).collect();
        let body = WoBody::from_sorted(&recs, 64, 8);
        let guard_ebr = crate::sync::Ebr::new();
        let guard = guard_ebr.pin();
        // interleave new keys and a tombstone through the raw path
        assert!(matches!(
            upsert_raw(&body, 15, 150, true, &guard),
            UpsertRaw::Inserted
        ));
        assert!(matches!(
            upsert_raw(&body, 20, NO_VALUE, true, &guard),
            UpsertRaw::Updated
        ));
        let dumped = dump_sorted(&body);
        let keys: Vec<Key> = dumped.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![10, 15, 30, 40, 50, 60, 70, 80]);
    }

    #[test]
    fn raw_upsert_reports_full() {
        let body = WoBody::empty(8, 8);
        let guard_ebr = crate::sync::Ebr::new();
        let guard = guard_ebr.pin();
        for k in 1..=body.cap as u64 {
            assert!(matches!(
                upsert_raw(&body, k, k, true, &guard),
                UpsertRaw::Inserted
            ));
        }
        assert!(matches!(
            upsert_raw(&body, 100_000, 1, true, &guard),
            UpsertRaw::Full
        ));
        // existing keys still update in place
        assert!(matches!(
            upsert_raw(&body, 3, 33, true, &guard),
            UpsertRaw::Updated
        ));
        assert_eq!(probe_raw(&body, 3), Some(33));
    }

    #[test]
    fn no_clobber_preserves_newer_value() {
        let body = WoBody::empty(16, 8);
        let guard_ebr = crate::sync::Ebr::new();
        let guard = guard_ebr.pin();
        upsert_raw(&body, 5, 50, true, &guard);
        assert!(matches!(
            upsert_raw(&body, 5, 1, false, &guard),
            UpsertRaw::Updated
        ));
        assert_eq!(probe_raw(&body, 5), Some(50));
    }
}
