//! Read-optimized leaf: model-indexed buckets.
//!
//! A record's bucket is the truncated model prediction divided by the probe
//! size. Buckets hold a small sorted vector behind a versioned lock; lookups
//! are optimistic and never write shared state, writers lock one bucket.
//! A bucket past its probe size counts as overflowed; the model was simply
//! wrong about that region.

use super::node::{Body, LeafRead, LeafScan, LeafStore, LeafWrite, Node};
use super::woleaf::UpsertRaw;
use super::Ctx;
use crate::config::TreeOptions;
use crate::model::{LinearModel, LinearModelBuilder};
use crate::record::{empty_cells, Key, Record, SlotCell, Value, KEY_MAX, NO_VALUE};
use crate::sync::{EpochGuard, VersionLock};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

struct Chunk {
    cells: Box<[SlotCell]>,
}

pub(crate) struct Bucket {
    lock: VersionLock,
    probe: u32,
    len: AtomicU32,
    chunk: AtomicPtr<Chunk>,
}

enum BucketWrite {
    Inserted,
    /// Key existed; `was_live` distinguishes an overwrite from a revival.
    Updated { was_live: bool },
    Skipped,
}

impl Bucket {
    fn new(probe: usize) -> Self {
        Bucket {
            lock: VersionLock::new(),
            probe: probe as u32,
            len: AtomicU32::new(0),
            chunk: AtomicPtr::new(Box::into_raw(Box::new(Chunk {
                cells: empty_cells(probe),
            }))),
        }
    }

    #[inline]
    fn chunk(&self) -> &Chunk {
        unsafe { &*self.chunk.load(Ordering::Acquire) }
    }

    /// Insert sorted or overwrite under the bucket lock. With `clobber`
    /// false an existing key is left untouched (morph migration must not
    /// overwrite a mirrored, newer write).
    fn store(&self, k: Key, v: Value, clobber: bool, guard: &EpochGuard) -> (BucketWrite, bool) {
        self.lock.lock();
        let len = self.len.load(Ordering::Relaxed) as usize;
        let chunk = self.chunk();
        let pos = chunk.cells[..len].partition_point(|c| c.key() < k);
        if pos < len && chunk.cells[pos].key() == k {
            let was_live = chunk.cells[pos].val() != NO_VALUE;
            let write = if clobber {
                chunk.cells[pos].set_val(v);
                BucketWrite::Updated { was_live }
            } else {
                BucketWrite::Skipped
            };
            self.lock.unlock();
            return (write, false);
        }

        if len == chunk.cells.len() {
            self.grow(len, guard);
        }
        let chunk = self.chunk();
        for i in (pos..len).rev() {
            chunk.cells[i + 1].store(chunk.cells[i].load());
        }
        chunk.cells[pos].store(Record::new(k, v));
        self.len.store(len as u32 + 1, Ordering::Release);
        let overflowed = len as u32 + 1 > self.probe;
        self.lock.unlock();
        (BucketWrite::Inserted, overflowed)
    }

    /// Replace the cell array with one half again as large. Readers may
    /// still walk the displaced chunk; it is epoch-retired.
    fn grow(&self, len: usize, guard: &EpochGuard) {
        debug_assert!(self.lock.is_locked());
        let old = self.chunk.load(Ordering::Relaxed);
        let old_cells = unsafe { &(*old).cells };
        let new_cap = (old_cells.len() * 3 / 2).max(old_cells.len() + 1);
        let cells = empty_cells(new_cap);
        for i in 0..len {
            cells[i].store(old_cells[i].load());
        }
        self.chunk
            .store(Box::into_raw(Box::new(Chunk { cells })), Ordering::Release);
        guard.defer_drop(old);
    }

    /// Optimistic point read; `hint` is the model's within-bucket offset.
    fn lookup(&self, k: Key, hint: usize) -> Option<Record> {
        loop {
            let v1 = self.lock.read_begin();
            let len = self.len.load(Ordering::Acquire) as usize;
            let chunk = self.chunk();
            let found = if len > 64 {
                super::split::exp_search_cells(&chunk.cells, len, hint.min(len - 1), k)
            } else {
                super::split::search_cells(&chunk.cells, len, k)
            };
            let rec = found.map(|i| chunk.cells[i].load());
            if self.lock.read_validate(v1) {
                return rec;
            }
        }
    }

    /// Tombstone (`v == 0`) or overwrite the payload if the key is live.
    fn write_payload(&self, k: Key, v: Value) -> bool {
        self.lock.lock();
        let len = self.len.load(Ordering::Relaxed) as usize;
        let chunk = self.chunk();
        let found = match super::split::search_cells(&chunk.cells, len, k) {
            Some(i) if chunk.cells[i].val() != NO_VALUE => {
                chunk.cells[i].set_val(v);
                true
            }
            _ => false,
        };
        self.lock.unlock();
        found
    }

    /// Copy out the bucket contents under its lock.
    fn dump_into(&self, out: &mut Vec<Record>) {
        self.lock.lock();
        let len = self.len.load(Ordering::Relaxed) as usize;
        let chunk = self.chunk();
        out.extend((0..len).map(|i| chunk.cells[i].load()));
        self.lock.unlock();
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        let chunk = self.chunk.load(Ordering::Relaxed);
        if !chunk.is_null() {
            unsafe { drop(Box::from_raw(chunk)) };
        }
    }
}

pub(crate) struct RoBody {
    model: LinearModel,
    probe: u32,
    slots: u32,
    buckets: Box<[Bucket]>,
    count: AtomicU32,
    of_count: AtomicU32,
    split_threshold: u32,
    overflow_max_ratio: f64,
}

impl RoBody {
    /// Empty leaf whose model spreads the whole key domain, for nodes that
    /// have no data to train on yet.
    pub(crate) fn empty(opts: &TreeOptions) -> Self {
        let slots = opts.leaf_capacity;
        let model = LinearModel {
            slope: (slots - 1) as f64 / KEY_MAX as f64,
            intercept: 0.0,
        };
        RoBody::with_model(model, opts)
    }

    pub(crate) fn with_model(model: LinearModel, opts: &TreeOptions) -> Self {
        let slots = opts.leaf_capacity;
        let probe = opts.probe_size;
        RoBody {
            model,
            probe: probe as u32,
            slots: slots as u32,
            buckets: (0..slots / probe).map(|_| Bucket::new(probe)).collect(),
            count: AtomicU32::new(0),
            of_count: AtomicU32::new(0),
            split_threshold: opts.split_threshold() as u32,
            overflow_max_ratio: opts.overflow_max_ratio,
        }
    }

    /// Train on the central three quarters of the sorted records to avoid
    /// tail distortion, rescale into `[margin, slots - margin)`, then place
    /// every record.
    pub(crate) fn from_sorted(recs: &[Record], opts: &TreeOptions, guard: &EpochGuard) -> Self {
        let body = RoBody::with_model(train_leaf_model(recs, opts), opts);
        for rec in recs {
            if rec.is_live() {
                let bucket = body.bucket_of(rec.key);
                let (_, overflow) = body.buckets[bucket].store(rec.key, rec.val, true, guard);
                body.count.fetch_add(1, Ordering::Relaxed);
                if overflow {
                    body.of_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        body
    }

    #[inline]
    fn bucket_of(&self, k: Key) -> usize {
        self.model.predict_slot(k, self.slots as usize) / self.probe as usize
    }

    #[inline]
    fn hint_of(&self, k: Key, bucket: usize) -> usize {
        let slot = self.model.predict_slot(k, self.slots as usize);
        slot.saturating_sub(bucket * self.probe as usize)
    }

    pub(crate) fn live_count(&self) -> usize {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            bucket.dump_into(&mut out);
        }
        out.iter().filter(|r| r.is_live()).count()
    }

    /// A leaf splits when full, or early when the model misplaces too large
    /// a share of its records into overflowing buckets: the split halves
    /// retrain their models. The floor keeps a sparsely filled leaf from
    /// thrashing through compactions.
    fn should_split(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        if count >= self.split_threshold {
            return true;
        }
        let of = self.of_count.load(Ordering::Relaxed);
        count >= self.split_threshold / 4 && of as f64 > count as f64 * self.overflow_max_ratio
    }
}

pub(crate) fn train_leaf_model(recs: &[Record], opts: &TreeOptions) -> LinearModel {
    let n = recs.len();
    if n < 8 {
        return LinearModel {
            slope: (opts.leaf_capacity - 1) as f64 / KEY_MAX as f64,
            intercept: 0.0,
        };
    }
    let mut builder = LinearModelBuilder::new();
    for (rank, rec) in recs.iter().enumerate().take(n * 7 / 8).skip(n / 8) {
        builder.add(rec.key, rank);
    }
    builder
        .build()
        .rescale(n, opts.leaf_capacity, opts.probe_size)
}

fn header_snapshot(node: &Node, body: &RoBody) -> Option<(Key, *mut Node, bool)> {
    let hv = node.header_lock.read_begin();
    let body_ptr = node.body_ptr();
    let skey = node.skey.load(Ordering::Acquire);
    let sibling = node.sibling.load(Ordering::Acquire);
    if !node.header_lock.read_validate(hv) {
        return None;
    }
    let current = match unsafe { &*body_ptr } {
        Body::Ro(b) => std::ptr::eq(b, body),
        _ => false,
    };
    Some((skey, sibling, current))
}

pub(crate) fn store(
    node: &Node,
    body: &RoBody,
    k: Key,
    v: Value,
    ctx: &Ctx,
    guard: &EpochGuard,
) -> LeafStore {
    let nv = node.node_lock.read_begin();
    let (skey, sibling, current) = match header_snapshot(node, body) {
        Some(s) => s,
        None => return LeafStore::Retry,
    };
    if !current {
        return LeafStore::Retry;
    }
    if k >= skey {
        return LeafStore::Redirect(sibling);
    }

    let bucket = body.bucket_of(k);
    let (write, overflow) = body.buckets[bucket].store(k, v, true, guard);
    if !node.node_lock.read_validate(nv) {
        // A concurrent dump-and-swap may have missed this write.
        return LeafStore::Retry;
    }

    let inserted = match write {
        BucketWrite::Inserted => true,
        BucketWrite::Updated { was_live } => !was_live,
        BucketWrite::Skipped => unreachable!("clobbering store skipped"),
    };
    if let Some(shadow) = node.shadow_body(guard) {
        super::node::upsert_body_raw(shadow, k, v, true, guard);
    }

    if matches!(write, BucketWrite::Inserted) {
        body.count.fetch_add(1, Ordering::Relaxed);
        if overflow {
            body.of_count.fetch_add(1, Ordering::Relaxed);
        }
        if body.should_split() {
            return node.do_split(inserted, ctx, guard);
        }
    }
    LeafStore::Done { inserted }
}

pub(crate) fn lookup(node: &Node, body: &RoBody, k: Key, guard: &EpochGuard) -> LeafRead {
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

    let bucket = body.bucket_of(k);
    match body.buckets[bucket].lookup(k, body.hint_of(k, bucket)) {
        Some(rec) => LeafRead::Done(rec.is_live().then_some(rec.val)),
        None => {
            if let Some(shadow) = node.shadow_body(guard) {
                return LeafRead::Done(super::node::probe_body_raw(shadow, k));
            }
            LeafRead::Done(None)
        }
    }
}

pub(crate) fn write_payload(
    node: &Node,
    body: &RoBody,
    k: Key,
    v: Value,
    guard: &EpochGuard,
) -> LeafWrite {
    let nv = node.node_lock.read_begin();
    let (skey, sibling, current) = match header_snapshot(node, body) {
        Some(s) => s,
        None => return LeafWrite::Retry,
    };
    if !current {
        return LeafWrite::Retry;
    }
    if k >= skey {
        return LeafWrite::Redirect(sibling);
    }

    let bucket = body.bucket_of(k);
    let found = body.buckets[bucket].write_payload(k, v);
    if !node.node_lock.read_validate(nv) {
        return LeafWrite::Retry;
    }
    if found {
        if let Some(shadow) = node.shadow_body(guard) {
            super::node::upsert_body_raw(shadow, k, v, true, guard);
        }
    }
    LeafWrite::Done(found)
}

/// Sorted live records. Buckets are locked one at a time; bucket ranges are
/// ordered by the monotone model, so concatenation is sorted.
pub(crate) fn dump_sorted(body: &RoBody) -> Vec<Record> {
    let mut out = Vec::with_capacity(body.count.load(Ordering::Relaxed) as usize);
    for bucket in body.buckets.iter() {
        bucket.dump_into(&mut out);
    }
    out.retain(|r| r.is_live());
    debug_assert!(out.windows(2).all(|w| w[0].key < w[1].key));
    out
}

pub(crate) fn scan(
    node: &Node,
    body: &RoBody,
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
        return LeafScan::Retry;
    }

    let hv = node.header_lock.read_begin();
    // Keys >= from predict at or after from's bucket.
    let start_bucket = body.bucket_of(from);
    let mut collected = Vec::new();
    for bucket in body.buckets[start_bucket..].iter() {
        bucket.dump_into(&mut collected);
        if collected.iter().filter(|r| r.key >= from && r.is_live()).count() >= n {
            break;
        }
    }
    let sibling = node.sibling.load(Ordering::Acquire);
    if !node.header_lock.read_validate(hv) {
        return LeafScan::Retry;
    }

    for rec in collected {
        if out.len() >= n {
            break;
        }
        if rec.key >= from && rec.is_live() {
            out.push(rec);
        }
    }
    LeafScan::Done(sibling)
}

/// Raw upsert used for shadow mirroring and morph migration.
pub(crate) fn upsert_raw(
    body: &RoBody,
    k: Key,
    v: Value,
    clobber: bool,
    guard: &EpochGuard,
) -> UpsertRaw {
    let bucket = body.bucket_of(k);
    let (write, overflow) = body.buckets[bucket].store(k, v, clobber, guard);
    match write {
        BucketWrite::Inserted => {
            body.count.fetch_add(1, Ordering::Relaxed);
            if overflow {
                body.of_count.fetch_add(1, Ordering::Relaxed);
            }
            UpsertRaw::Inserted
        }
        BucketWrite::Updated { .. } | BucketWrite::Skipped => UpsertRaw::Updated,
    }
}

/// Lock-free probe used when this body is consulted as a shadow.
pub(crate) fn probe_raw(body: &RoBody, k: Key) -> Option<Value> {
    let bucket = body.bucket_of(k);
    body.buckets[bucket]
        .lookup(k, body.hint_of(k, bucket))
        .and_then(|rec| rec.is_live().then_some(rec.val))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> TreeOptions {
        TreeOptions {
            leaf_capacity: 256,
            piece_size: 32,
            probe_size: 16,
            ..TreeOptions::default()
        }
    }

    fn sorted_records(n: u64) -> Vec<Record> {
        (1..=n).map(|k| Record::new(k * 7, k)).collect()
    }

    #[test]
    fn bulk_built_leaf_finds_every_record() {
        let recs = sorted_records(150);
        let ebr = crate::sync::Ebr::new();
        let guard = ebr.pin();
        let body = RoBody::from_sorted(&recs, &opts(), &guard);
        for rec in &recs {
            assert_eq!(probe_raw(&body, rec.key), Some(rec.val), "key {}", rec.key);
        }
        assert_eq!(probe_raw(&body, 3), None);
        assert_eq!(dump_sorted(&body), recs);
    }

    #[test]
    fn bucket_grows_past_probe_size() {
        let ebr = crate::sync::Ebr::new();
        let guard = ebr.pin();
        let bucket = Bucket::new(4);
        for k in (1..=20u64).rev() {
            bucket.store(k, k, true, &guard);
        }
        assert_eq!(bucket.len.load(Ordering::Relaxed), 20);
        for k in 1..=20u64 {
            assert_eq!(bucket.lookup(k, 0).map(|r| r.val), Some(k));
        }
        let mut out = Vec::new();
        bucket.dump_into(&mut out);
        let keys: Vec<Key> = out.iter().map(|r| r.key).collect();
        assert_eq!(keys, (1..=20u64).collect::<Vec<_>>());
    }

    #[test]
    fn tombstone_then_revive() {
        let recs = sorted_records(64);
        let ebr = crate::sync::Ebr::new();
        let guard = ebr.pin();
        let body = RoBody::from_sorted(&recs, &opts(), &guard);
        assert!(body.buckets[body.bucket_of(7)].write_payload(7, NO_VALUE));
        assert_eq!(probe_raw(&body, 7), None);
        // no-clobber migration must not resurrect the key
        upsert_raw(&body, 7, 999, false, &guard);
        assert_eq!(probe_raw(&body, 7), None);
        // a real store does
        upsert_raw(&body, 7, 42, true, &guard);
        assert_eq!(probe_raw(&body, 7), Some(42));
    }

    #[test]
    fn overflow_pressure_requests_an_early_split() {
        let ebr = crate::sync::Ebr::new();
        let guard = ebr.pin();

        // A healthy bulk-built leaf is nowhere near splitting.
        let body = RoBody::from_sorted(&sorted_records(150), &opts(), &guard);
        assert!(!body.should_split());

        // A constant model crams every record into bucket zero; once the
        // overflow share passes the configured ratio the leaf must ask to
        // split even though it is far from full.
        let skewed = RoBody::with_model(
            LinearModel {
                slope: 0.0,
                intercept: 0.0,
            },
            &opts(),
        );
        for k in 1..=100u64 {
            upsert_raw(&skewed, k, k, true, &guard);
        }
        assert_eq!(skewed.count.load(Ordering::Relaxed), 100);
        assert!(
            skewed.of_count.load(Ordering::Relaxed) > 30,
            "colliding inserts must be accounted as overflow"
        );
        assert!(skewed.should_split());
    }

    #[test]
    fn dump_skips_tombstones() {
        let recs = sorted_records(40);
        let ebr = crate::sync::Ebr::new();
        let guard = ebr.pin();
        let body = RoBody::from_sorted(&recs, &opts(), &guard);
        body.buckets[body.bucket_of(14)].write_payload(14, NO_VALUE);
        let dumped = dump_sorted(&body);
        assert_eq!(dumped.len(), 39);
        assert!(dumped.iter().all(|r| r.key != 14));
    }
}
