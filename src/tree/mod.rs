//! Public index type and the abstract ordered-index interface.

pub(crate) mod imp;

use self::imp::node::{Body, Node};
use self::imp::{inner, Ctx, TreeImp};
use crate::config::{ConfigError, TreeOptions};
use crate::record::{Key, Record, Value, KEY_MAX, KEY_MIN};
use crate::sync::Ebr;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

#[cfg(feature = "internal-api")]
pub use self::imp::node::Layout;

/// Errors reported while (re)building an index from records.
#[derive(Error, Debug, PartialEq)]
pub enum BuildError {
    #[error("records must be strictly ascending by key")]
    Unsorted,
    #[error("key {0} lies outside the valid key domain")]
    KeyOutOfDomain(Key),
    #[error("payload 0 is reserved for tombstones")]
    ReservedPayload,
    #[error("bulk load requires an empty index")]
    NotEmpty,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The ordered-index interface. Alternative index structures wrap their own
/// engines behind this same seam.
pub trait Index {
    /// Load a strictly ascending record sequence into an empty index. Must
    /// complete before any concurrent operation.
    fn bulk_load(&mut self, records: &[Record]) -> Result<(), BuildError>;
    /// Insert or overwrite; true iff the key was not live before.
    fn insert(&self, key: Key, val: Value) -> bool;
    fn lookup(&self, key: Key) -> Option<Value>;
    /// Overwrite the payload of a live key; false if absent.
    fn update(&self, key: Key, val: Value) -> bool;
    /// Tombstone a live key; false if absent.
    fn remove(&self, key: Key) -> bool;
    /// Up to `n` live records with keys >= `from`, in ascending key order.
    fn scan(&self, from: Key, n: usize) -> Vec<Record>;
}

/// Concurrent learned index with morphing leaves.
pub struct Adaptree {
    imp: TreeImp,
    worker: Option<JoinHandle<()>>,
}

impl Default for Adaptree {
    fn default() -> Self {
        Adaptree::new()
    }
}

impl Adaptree {
    /// Empty index with default options.
    pub fn new() -> Self {
        Adaptree::with_options(TreeOptions::default()).expect("default options are valid")
    }

    pub fn with_options(opts: TreeOptions) -> Result<Self, ConfigError> {
        opts.validate()?;
        #[cfg(feature = "init_env_logger")]
        {
            let _ = env_logger::try_init();
        }
        let ebr = Ebr::new();
        let (tx, worker_seed) = if opts.background_morph && opts.morphing_enabled {
            let (tx, rx) = crossbeam_channel::unbounded();
            (Some(tx), Some((rx, ebr.clone(), opts.clone())))
        } else {
            (None, None)
        };
        let ctx = Arc::new(Ctx {
            opts,
            ebr,
            morph_tx: Mutex::new(tx),
        });
        let worker = worker_seed.map(|(rx, ebr, opts)| {
            std::thread::Builder::new()
                .name("adaptree-morph".into())
                .spawn(move || crate::morph::worker_loop(rx, ebr, opts))
                .expect("spawning the morph worker")
        });
        Ok(Adaptree {
            imp: TreeImp::new(ctx),
            worker,
        })
    }

    /// Build an index directly from a sorted record sequence.
    pub fn with_records(records: &[Record], opts: TreeOptions) -> Result<Self, BuildError> {
        let mut tree = Adaptree::with_options(opts)?;
        Index::bulk_load(&mut tree, records)?;
        Ok(tree)
    }

    /// Number of live records. Walks the whole leaf chain.
    pub fn len(&self) -> usize {
        let guard = self.imp.ctx.ebr.pin();
        let mut total = 0;
        let mut cur = self.imp.first_leaf.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            total += match node.body(&guard) {
                Body::Wo(b) => b.live_count(),
                Body::Ro(b) => b.live_count(),
                Body::Inner(_) => unreachable!("inner node on the leaf chain"),
            };
            cur = node.sibling.load(Ordering::Acquire);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while nothing was ever stored; bulk load requires this.
    fn is_unused(&self) -> bool {
        self.imp.root.child_count() == 1 && self.is_empty()
    }

    fn bulk_load_records(&mut self, records: &[Record]) -> Result<(), BuildError> {
        if !self.is_unused() {
            return Err(BuildError::NotEmpty);
        }
        for pair in records.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(BuildError::Unsorted);
            }
        }
        for rec in records {
            if rec.key == KEY_MIN || rec.key == KEY_MAX {
                return Err(BuildError::KeyOutOfDomain(rec.key));
            }
            if !rec.is_live() {
                return Err(BuildError::ReservedPayload);
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let opts = self.imp.ctx.opts.clone();
        let guard = self.imp.ctx.ebr.pin();

        // Cut the key space into model-friendly chunks: segmentation first,
        // then an even sub-split of every segment that exceeds the target
        // leaf fill.
        let segments = crate::model::segment_keys(records.iter().map(|r| r.key), opts.epsilon_leaf)
            .expect("non-empty input");
        let fill = opts.initial_fill().min(opts.leaf_capacity);
        let mut chunks: Vec<(usize, usize)> = Vec::new();
        let mut offset = 0;
        for seg in &segments {
            debug_assert_eq!(records[offset].key, seg.first_key);
            let parts = (seg.len + fill - 1) / fill;
            for p in 0..parts {
                let lo = offset + p * seg.len / parts;
                let hi = offset + (p + 1) * seg.len / parts;
                debug_assert!(hi > lo && hi - lo <= fill);
                chunks.push((lo, hi));
            }
            offset += seg.len;
        }

        // Leaves, linked right-to-left so every sibling exists when needed.
        // The placeholder leaf the empty index started with becomes the
        // first leaf: its node stays alive (a queued background morph may
        // still name it) and only its body is swapped.
        let mut leaves: Vec<*mut Node> = vec![std::ptr::null_mut(); chunks.len()];
        for (i, &(lo, hi)) in chunks.iter().enumerate().rev() {
            let skey = chunks
                .get(i + 1)
                .map(|&(next_lo, _)| records[next_lo].key)
                .unwrap_or(KEY_MAX);
            let sibling = leaves.get(i + 1).copied().unwrap_or(std::ptr::null_mut());
            let body = Body::Ro(imp::roleaf::RoBody::from_sorted(
                &records[lo..hi],
                &opts,
                &guard,
            ));
            if i == 0 {
                let first = self.imp.first_leaf.load(Ordering::Relaxed);
                let node = unsafe { &*first };
                node.node_lock.lock();
                node.skey.store(skey, Ordering::Release);
                node.sibling.store(sibling, Ordering::Release);
                node.install_body(
                    Box::new(body),
                    imp::node::default_stats(imp::node::Layout::Ro),
                    &guard,
                );
                node.node_lock.unlock();
                leaves[0] = first;
            } else {
                leaves[i] = Node::new_leaf(body, skey, sibling);
            }
        }

        let mut pairs: Vec<(Key, *mut Node)> = chunks
            .iter()
            .zip(&leaves)
            .map(|(&(lo, _), &leaf)| (records[lo].key, leaf))
            .collect();
        pairs[0].0 = KEY_MIN;

        // Stack learned inner layers until the directory can hold the top.
        let mut height = 0;
        while pairs.len() > imp::root::L3 {
            let mut next: Vec<(Key, *mut Node)> = Vec::new();
            let segments =
                crate::model::segment_keys(pairs.iter().map(|p| p.0), opts.epsilon_inner)
                    .expect("non-empty input");
            let mut offset = 0;
            for seg in &segments {
                let parts = (seg.len + INNER_BUILD_CAP - 1) / INNER_BUILD_CAP;
                for p in 0..parts {
                    let lo = offset + p * seg.len / parts;
                    let hi = offset + (p + 1) * seg.len / parts;
                    let body = inner::InnerBody::from_pairs(&pairs[lo..hi], &opts);
                    next.push((pairs[lo].0, Node::new_inner(body)));
                }
                offset += seg.len;
            }
            pairs = next;
            height += 1;
        }

        self.imp.root.install_spread(&pairs, height);

        log::info!(
            "bulk loaded {} records into {} leaves ({} segments, height {})",
            records.len(),
            leaves.len(),
            segments.len(),
            height
        );
        Ok(())
    }
}

/// Children per inner node when stacking bulk-load layers.
const INNER_BUILD_CAP: usize = 1024;

impl Index for Adaptree {
    fn bulk_load(&mut self, records: &[Record]) -> Result<(), BuildError> {
        self.bulk_load_records(records)
    }

    fn insert(&self, key: Key, val: Value) -> bool {
        assert!(key > KEY_MIN && key < KEY_MAX, "key outside the domain");
        assert_ne!(val, 0, "payload 0 is reserved for tombstones");
        self.imp.insert(key, val)
    }

    fn lookup(&self, key: Key) -> Option<Value> {
        self.imp.lookup(key)
    }

    fn update(&self, key: Key, val: Value) -> bool {
        assert_ne!(val, 0, "payload 0 is reserved for tombstones");
        self.imp.update(key, val)
    }

    fn remove(&self, key: Key) -> bool {
        self.imp.remove(key)
    }

    fn scan(&self, from: Key, n: usize) -> Vec<Record> {
        self.imp.scan(from, n)
    }
}

impl Drop for Adaptree {
    fn drop(&mut self) {
        // Hang up on the worker before touching any node.
        self.imp.ctx.morph_tx.lock().take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        unsafe {
            for (_, child) in self.imp.root.collect_children() {
                free_inner_graph(child);
            }
            let mut cur = self.imp.first_leaf.load(Ordering::Relaxed);
            while !cur.is_null() {
                let node = Box::from_raw(cur);
                debug_assert!(node.shadow.load(Ordering::Relaxed).is_null());
                cur = node.sibling.load(Ordering::Relaxed);
                drop(Box::from_raw(node.body.load(Ordering::Relaxed)));
            }
        }
    }
}

/// Free the inner-node graph below `node`; leaves are freed by walking the
/// sibling chain instead.
unsafe fn free_inner_graph(node: *mut Node) {
    let body_ptr = (*node).body.load(Ordering::Relaxed);
    if let Body::Inner(body) = &*body_ptr {
        for (_, child) in inner::dump_pairs(body) {
            free_inner_graph(child);
        }
        drop(Box::from_raw(node));
        drop(Box::from_raw(body_ptr));
    }
}

#[cfg(feature = "internal-api")]
mod introspect {
    use super::*;

    /// A point-in-time structural snapshot, for tests and benchmark
    /// drivers. Taken without global synchronization.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TreeInfo {
        pub leaves: usize,
        pub wo_leaves: usize,
        pub ro_leaves: usize,
        pub inner_nodes: usize,
        pub root_tier: u16,
        pub root_children: usize,
        pub height: u16,
    }

    impl Adaptree {
        pub fn info(&self) -> TreeInfo {
            let guard = self.imp.ctx.ebr.pin();
            let mut info = TreeInfo {
                leaves: 0,
                wo_leaves: 0,
                ro_leaves: 0,
                inner_nodes: 0,
                root_tier: self.imp.root.depth(),
                root_children: self.imp.root.child_count() as usize,
                height: self.imp.root.height(),
            };
            let mut cur = self.imp.first_leaf.load(Ordering::Acquire);
            while !cur.is_null() {
                let node = unsafe { &*cur };
                info.leaves += 1;
                match node.body(&guard) {
                    Body::Wo(_) => info.wo_leaves += 1,
                    Body::Ro(_) => info.ro_leaves += 1,
                    Body::Inner(_) => unreachable!("inner node on the leaf chain"),
                }
                cur = node.sibling.load(Ordering::Acquire);
            }
            for (_, child) in self.imp.root.collect_children() {
                info.inner_nodes += count_inner(child, &guard);
            }
            info
        }

        /// Current layout of every leaf in chain order.
        pub fn leaf_layouts(&self) -> Vec<Layout> {
            let guard = self.imp.ctx.ebr.pin();
            let mut out = Vec::new();
            let mut cur = self.imp.first_leaf.load(Ordering::Acquire);
            while !cur.is_null() {
                let node = unsafe { &*cur };
                if let Some(layout) = node.body(&guard).layout() {
                    out.push(layout);
                }
                cur = node.sibling.load(Ordering::Acquire);
            }
            out
        }

        /// Walk the sibling chain, asserting strictly ascending split keys
        /// and a `KEY_MAX` terminator. Returns the leaf count.
        pub fn check_chain(&self) -> usize {
            let mut count = 0;
            let mut last_skey = None;
            let mut cur = self.imp.first_leaf.load(Ordering::Acquire);
            while !cur.is_null() {
                let node = unsafe { &*cur };
                let skey = node.skey.load(Ordering::Acquire);
                if let Some(last) = last_skey {
                    assert!(last < skey, "sibling chain out of order: {} >= {}", last, skey);
                }
                last_skey = Some(skey);
                count += 1;
                cur = node.sibling.load(Ordering::Acquire);
            }
            assert_eq!(last_skey, Some(KEY_MAX), "chain must end at the key maximum");
            count
        }
    }

    fn count_inner(node: *mut Node, guard: &crate::sync::EpochGuard) -> usize {
        let node = unsafe { &*node };
        match node.body(guard) {
            Body::Inner(body) => {
                1 + inner::dump_pairs(body)
                    .into_iter()
                    .map(|(_, child)| count_inner(child, guard))
                    .sum::<usize>()
            }
            _ => 0,
        }
    }
}

#[cfg(feature = "internal-api")]
pub use introspect::TreeInfo;
