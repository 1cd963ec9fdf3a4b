//! Node header and tagged node body.
//!
//! A node's header allocation is stable for the life of the index: siblings,
//! parent slots and the root all point at it. Layout changes (morph, split,
//! rebuild) atomically swap the *body* pointer and rewrite the scalar header
//! words under the header lock; the displaced body is epoch-retired. This
//! preserves the observable "header swap" of a morph without ever moving the
//! node itself.

use super::inner::InnerBody;
use super::roleaf::RoBody;
use super::split::suboptimal_split;
use super::woleaf::WoBody;
use super::Ctx;
use crate::config::TreeOptions;
use crate::morph;
use crate::record::{Key, Record, Value, KEY_MAX};
use crate::sync::{backoff, EpochGuard, HeaderLock, VersionLock};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Stats word of a node that has only seen writes.
pub(crate) const WO_STATS: u64 = u64::MAX;
/// Stats word of a node that has only seen reads.
pub(crate) const RO_STATS: u64 = 0;

/// Physical layout of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Log-structured, append-mostly.
    Wo,
    /// Model-indexed buckets.
    Ro,
}

pub(crate) const PENDING_NONE: u8 = 0;
pub(crate) const PENDING_WO: u8 = 1;
pub(crate) const PENDING_RO: u8 = 2;

pub(crate) fn pending_code(layout: Layout) -> u8 {
    match layout {
        Layout::Wo => PENDING_WO,
        Layout::Ro => PENDING_RO,
    }
}

pub(crate) enum Body {
    Wo(WoBody),
    Ro(RoBody),
    Inner(InnerBody),
}

impl Body {
    pub(crate) fn layout(&self) -> Option<Layout> {
        match self {
            Body::Wo(_) => Some(Layout::Wo),
            Body::Ro(_) => Some(Layout::Ro),
            Body::Inner(_) => None,
        }
    }

}

pub(crate) fn default_stats(layout: Layout) -> u64 {
    match layout {
        Layout::Wo => WO_STATS,
        Layout::Ro => RO_STATS,
    }
}

pub(crate) struct Node {
    /// Rolling access history; bit 0 is the latest access, 1 = write.
    pub(crate) stats: AtomicU64,
    /// Generation counter, bumped when a morph is scheduled. A morph request
    /// carrying a stale value is a no-op.
    pub(crate) lsn: AtomicU32,
    /// Layout a scheduled-but-unfinished morph will install.
    pub(crate) pending: AtomicU8,
    /// Excludes structure changes against each other and lets in-place
    /// writers detect a concurrent dump-and-swap.
    pub(crate) node_lock: VersionLock,
    /// Serializes morphs against splits. Never blocks readers.
    pub(crate) morph_lock: VersionLock,
    pub(crate) header_lock: HeaderLock,
    /// Exclusive upper bound of this node's key range.
    pub(crate) skey: AtomicU64,
    pub(crate) sibling: AtomicPtr<Node>,
    /// Non-null only while a morph migrates this node; mirrors every write.
    pub(crate) shadow: AtomicPtr<Body>,
    pub(crate) body: AtomicPtr<Body>,
}

// Raw pointers are reachable only through epoch-protected loads.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

pub(crate) enum LeafStore {
    Done {
        inserted: bool,
    },
    Split {
        inserted: bool,
        split_key: Key,
        right: *mut Node,
    },
    /// The body was swapped while the caller held a reference; re-dispatch.
    Retry,
    Redirect(*mut Node),
}

pub(crate) enum LeafRead {
    Done(Option<Value>),
    Retry,
    Redirect(*mut Node),
}

pub(crate) enum LeafWrite {
    Done(bool),
    Retry,
    Redirect(*mut Node),
}

pub(crate) enum LeafScan {
    /// Records appended to the output; continue at the sibling if more are
    /// needed (null terminates the chain).
    Done(*mut Node),
    Retry,
    Redirect(*mut Node),
}

/// Outcome of a store against the whole leaf level, after redirects and
/// splits have been resolved.
pub(crate) struct StoreOutcome {
    pub inserted: bool,
    /// `(split_key, right)` to register in the routing parent.
    pub split: Option<(Key, *mut Node)>,
}

impl Node {
    pub(crate) fn new_leaf(body: Body, skey: Key, sibling: *mut Node) -> *mut Node {
        let layout = body.layout().expect("leaf body");
        Box::into_raw(Box::new(Node {
            stats: AtomicU64::new(default_stats(layout)),
            lsn: AtomicU32::new(0),
            pending: AtomicU8::new(PENDING_NONE),
            node_lock: VersionLock::new(),
            morph_lock: VersionLock::new(),
            header_lock: HeaderLock::new(),
            skey: AtomicU64::new(skey),
            sibling: AtomicPtr::new(sibling),
            shadow: AtomicPtr::new(std::ptr::null_mut()),
            body: AtomicPtr::new(Box::into_raw(Box::new(body))),
        }))
    }

    pub(crate) fn new_inner(body: InnerBody) -> *mut Node {
        Box::into_raw(Box::new(Node {
            stats: AtomicU64::new(RO_STATS),
            lsn: AtomicU32::new(0),
            pending: AtomicU8::new(PENDING_NONE),
            node_lock: VersionLock::new(),
            morph_lock: VersionLock::new(),
            header_lock: HeaderLock::new(),
            skey: AtomicU64::new(KEY_MAX),
            sibling: AtomicPtr::new(std::ptr::null_mut()),
            shadow: AtomicPtr::new(std::ptr::null_mut()),
            body: AtomicPtr::new(Box::into_raw(Box::new(Body::Inner(body)))),
        }))
    }

    /// Current body. The reference stays valid for the guard's critical
    /// section even if the body is concurrently swapped out, because retired
    /// bodies are epoch-freed.
    #[inline]
    pub(crate) fn body<'g>(&self, _guard: &'g EpochGuard) -> &'g Body {
        unsafe { &*self.body.load(Ordering::Acquire) }
    }

    #[inline]
    pub(crate) fn body_ptr(&self) -> *mut Body {
        self.body.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn shadow_body<'g>(&self, _guard: &'g EpochGuard) -> Option<&'g Body> {
        let ptr = self.shadow.load(Ordering::SeqCst);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Swap in a new body under the header lock; the caller must hold the
    /// node lock. Returns after retiring the old body.
    pub(crate) fn install_body(&self, body: Box<Body>, stats: u64, guard: &EpochGuard) {
        debug_assert!(self.node_lock.is_locked());
        self.header_lock.lock_exclusive();
        let old = self.body.swap(Box::into_raw(body), Ordering::AcqRel);
        self.stats.store(stats, Ordering::Relaxed);
        self.header_lock.unlock_exclusive();
        guard.defer_drop(old);
    }

    /// Apply `(k, v)` to this leaf level: resolves sibling redirects, body
    /// swaps and splits. `v == 0` tombstones on an upsert path and is only
    /// produced internally.
    pub(crate) fn store(&self, k: Key, v: Value, ctx: &Ctx, guard: &EpochGuard) -> StoreOutcome {
        let mut cur: &Node = self;
        let mut attempt = 0;
        loop {
            morph::judge(cur, true, ctx, guard);
            let res = match cur.body(guard) {
                Body::Wo(body) => super::woleaf::store(cur, body, k, v, ctx, guard),
                Body::Ro(body) => super::roleaf::store(cur, body, k, v, ctx, guard),
                Body::Inner(_) => unreachable!("store dispatched to an inner node"),
            };
            match res {
                LeafStore::Done { inserted } => {
                    return StoreOutcome {
                        inserted,
                        split: None,
                    }
                }
                LeafStore::Split {
                    inserted,
                    split_key,
                    right,
                } => {
                    return StoreOutcome {
                        inserted,
                        split: Some((split_key, right)),
                    }
                }
                LeafStore::Retry => {
                    backoff(attempt);
                    attempt += 1;
                }
                LeafStore::Redirect(next) => {
                    cur = unsafe { &*next };
                    attempt = 0;
                }
            }
        }
    }

    pub(crate) fn lookup(&self, k: Key, ctx: &Ctx, guard: &EpochGuard) -> Option<Value> {
        let mut cur: &Node = self;
        let mut attempt = 0;
        loop {
            morph::judge(cur, false, ctx, guard);
            let res = match cur.body(guard) {
                Body::Wo(body) => super::woleaf::lookup(cur, body, k, guard),
                Body::Ro(body) => super::roleaf::lookup(cur, body, k, guard),
                Body::Inner(_) => unreachable!("lookup dispatched to an inner node"),
            };
            match res {
                LeafRead::Done(v) => return v,
                LeafRead::Retry => {
                    backoff(attempt);
                    attempt += 1;
                }
                LeafRead::Redirect(next) => {
                    cur = unsafe { &*next };
                    attempt = 0;
                }
            }
        }
    }

    /// Overwrite the payload of `k` if live (`update`) or tombstone it
    /// (`remove`, with `v == 0`). Returns whether a live record was hit.
    pub(crate) fn write_payload(&self, k: Key, v: Value, ctx: &Ctx, guard: &EpochGuard) -> bool {
        let mut cur: &Node = self;
        let mut attempt = 0;
        loop {
            morph::judge(cur, true, ctx, guard);
            let res = match cur.body(guard) {
                Body::Wo(body) => super::woleaf::write_payload(cur, body, k, v, guard),
                Body::Ro(body) => super::roleaf::write_payload(cur, body, k, v, guard),
                Body::Inner(_) => unreachable!("write dispatched to an inner node"),
            };
            match res {
                LeafWrite::Done(found) => return found,
                LeafWrite::Retry => {
                    backoff(attempt);
                    attempt += 1;
                }
                LeafWrite::Redirect(next) => {
                    cur = unsafe { &*next };
                    attempt = 0;
                }
            }
        }
    }

    /// Collect up to `n` live records with keys >= `from` into `out`,
    /// following the sibling chain.
    pub(crate) fn scan(&self, from: Key, n: usize, out: &mut Vec<Record>, guard: &EpochGuard) {
        let mut cur: *mut Node = self as *const Node as *mut Node;
        let mut attempt = 0;
        while !cur.is_null() && out.len() < n {
            let node = unsafe { &*cur };
            let res = match node.body(guard) {
                Body::Wo(body) => super::woleaf::scan(node, body, from, n, out, guard),
                Body::Ro(body) => super::roleaf::scan(node, body, from, n, out, guard),
                Body::Inner(_) => unreachable!("scan dispatched to an inner node"),
            };
            match res {
                LeafScan::Done(next) => {
                    cur = next;
                    attempt = 0;
                }
                LeafScan::Retry => {
                    backoff(attempt);
                    attempt += 1;
                }
                LeafScan::Redirect(next) => {
                    cur = next;
                    attempt = 0;
                }
            }
        }
    }

    /// Sorted live records of this leaf. Locks out appends and payload
    /// writes for the duration of the copy.
    pub(crate) fn dump_leaf(&self, guard: &EpochGuard) -> Vec<Record> {
        match self.body(guard) {
            Body::Wo(body) => super::woleaf::dump_sorted(body),
            Body::Ro(body) => super::roleaf::dump_sorted(body),
            Body::Inner(_) => unreachable!("dump dispatched to an inner node"),
        }
    }

    /// Split this leaf. Called by a store that filled the node, after every
    /// shared hold on the header has been released.
    pub(crate) fn do_split(
        &self,
        inserted: bool,
        ctx: &Ctx,
        guard: &EpochGuard,
    ) -> LeafStore {
        self.morph_lock.lock();
        self.node_lock.lock();

        // A morph may have finished while we waited for the locks; split
        // whatever layout is current.
        let layout = self
            .body(guard)
            .layout()
            .expect("split target must be a leaf");
        let recs = self.dump_leaf(guard);

        if recs.len() < ctx.opts.split_threshold() / 2 {
            // Too few live records for a meaningful split: either another
            // thread split first, or tombstones ate the leaf. Compacting in
            // place reclaims the dead slots and resets the fill accounting.
            let body = build_leaf_body(layout, &recs, &ctx.opts, guard);
            self.install_body(Box::new(body), default_stats(layout), guard);
            self.node_lock.unlock();
            self.morph_lock.unlock();
            return LeafStore::Done { inserted };
        }

        let pid = suboptimal_split(&recs);
        let split_key = recs[pid].key;
        let old_skey = self.skey.load(Ordering::Acquire);
        let old_sibling = self.sibling.load(Ordering::Acquire);

        let right_body = build_leaf_body(layout, &recs[pid..], &ctx.opts, guard);
        let right = Node::new_leaf(right_body, old_skey, old_sibling);
        let left_body = build_leaf_body(layout, &recs[..pid], &ctx.opts, guard);

        self.header_lock.lock_exclusive();
        let old = self
            .body
            .swap(Box::into_raw(Box::new(left_body)), Ordering::AcqRel);
        self.skey.store(split_key, Ordering::Release);
        self.sibling.store(right, Ordering::Release);
        self.stats.store(default_stats(layout), Ordering::Relaxed);
        self.header_lock.unlock_exclusive();

        self.node_lock.unlock();
        self.morph_lock.unlock();
        guard.defer_drop(old);

        log::debug!(
            "split leaf at key {} ({} + {} records)",
            split_key,
            pid,
            recs.len() - pid
        );
        LeafStore::Split {
            inserted,
            split_key,
            right,
        }
    }
}

/// Build a leaf body of the given layout from sorted live records.
pub(crate) fn build_leaf_body(
    layout: Layout,
    recs: &[Record],
    opts: &TreeOptions,
    guard: &EpochGuard,
) -> Body {
    match layout {
        Layout::Wo => Body::Wo(WoBody::from_sorted(recs, opts.leaf_capacity, opts.piece_size)),
        Layout::Ro => Body::Ro(RoBody::from_sorted(recs, opts, guard)),
    }
}

/// Raw upsert dispatch for shadow mirroring and morph migration.
pub(crate) fn upsert_body_raw(
    body: &Body,
    k: Key,
    v: Value,
    clobber: bool,
    guard: &EpochGuard,
) -> super::woleaf::UpsertRaw {
    match body {
        Body::Wo(b) => super::woleaf::upsert_raw(b, k, v, clobber, guard),
        Body::Ro(b) => super::roleaf::upsert_raw(b, k, v, clobber, guard),
        Body::Inner(_) => unreachable!("raw upsert into an inner node"),
    }
}

/// Raw probe dispatch for shadow consultation.
pub(crate) fn probe_body_raw(body: &Body, k: Key) -> Option<Value> {
    match body {
        Body::Wo(b) => super::woleaf::probe_raw(b, k),
        Body::Ro(b) => super::roleaf::probe_raw(b, k),
        Body::Inner(_) => unreachable!("raw probe into an inner node"),
    }
}
