//! Adaptive layout selection and live leaf migration.
//!
//! Every leaf access shifts its access kind into the node's 64-bit stats
//! word. When the write share of that window crosses a threshold, the first
//! observer try-locks the node's morph lock and either migrates the leaf
//! inline or hands it to the background worker, keyed by the node's
//! generation counter so stale requests fizzle.
//!
//! Migration publishes the target body as the node's shadow first: from that
//! point every committed write is mirrored into the shadow, lookups that
//! miss consult it, and the dump that feeds migration is ordered after the
//! publication by the leaf's own locks. Migrated records never clobber a
//! mirrored (newer) write. The final body swap happens under the node and
//! header locks; readers never block.

use crate::config::TreeOptions;
use crate::record::Record;
use crate::sync::{Ebr, EpochGuard};
use crate::tree::imp::node::{
    default_stats, pending_code, upsert_body_raw, Body, Layout, Node, PENDING_NONE,
};
use crate::tree::imp::roleaf::{train_leaf_model, RoBody};
use crate::tree::imp::woleaf::WoBody;
use crate::tree::imp::Ctx;
use crossbeam_channel::Receiver;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Raw node pointer that may cross the channel to the worker. The worker is
/// always joined before any node is freed.
pub(crate) struct SendPtr(pub(crate) *mut Node);
unsafe impl Send for SendPtr {}

pub(crate) struct MorphMsg {
    pub(crate) node: SendPtr,
    pub(crate) lsn: u32,
    pub(crate) target: Layout,
}

/// Account one access and schedule a layout change if the rolling window
/// asks for one.
pub(crate) fn judge(node: &Node, is_write: bool, ctx: &Ctx, guard: &EpochGuard) {
    if !ctx.opts.morphing_enabled {
        return;
    }
    let prev = node
        .stats
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
            Some((s << 1) | is_write as u64)
        })
        .unwrap();
    let ones = ((prev << 1) | is_write as u64).count_ones();

    let current = match node.body(guard).layout() {
        Some(layout) => layout,
        None => return,
    };
    let (low, high) = ctx.opts.morph_thresholds;
    let target = match current {
        Layout::Wo if ones <= low => Layout::Ro,
        Layout::Ro if ones >= high => Layout::Wo,
        _ => return,
    };

    if node.pending.load(Ordering::Relaxed) == pending_code(target) {
        // already on its way
        return;
    }
    if !node.morph_lock.try_lock() {
        return;
    }
    if node.body(guard).layout() != Some(current) {
        node.morph_lock.unlock();
        return;
    }
    node.pending.store(pending_code(target), Ordering::Relaxed);
    let lsn = node.lsn.fetch_add(1, Ordering::Relaxed) + 1;

    let tx = ctx.morph_tx.lock().as_ref().cloned();
    match tx {
        Some(tx) => {
            let _ = tx.send(MorphMsg {
                node: SendPtr(node as *const Node as *mut Node),
                lsn,
                target,
            });
            node.morph_lock.unlock();
        }
        None => morph_one_locked(node, lsn, target, &ctx.opts, guard),
    }
}

/// Migrate one leaf to `target`. The morph lock must be held on entry and is
/// released on every path.
pub(crate) fn morph_one_locked(
    node: &Node,
    lsn: u32,
    target: Layout,
    opts: &TreeOptions,
    guard: &EpochGuard,
) {
    debug_assert!(node.morph_lock.is_locked());
    if node.lsn.load(Ordering::Relaxed) != lsn || node.body(guard).layout() == Some(target) {
        // stale request, or a split already replaced the layout
        node.pending.store(PENDING_NONE, Ordering::Relaxed);
        node.morph_lock.unlock();
        return;
    }

    let shadow: Box<Body> = match target {
        Layout::Ro => {
            // The model only needs the key distribution; values migrate
            // later.
            let sample = node.dump_leaf(guard);
            Box::new(Body::Ro(RoBody::with_model(
                train_leaf_model(&sample, opts),
                opts,
            )))
        }
        // Headroom beyond the configured capacity: the shadow absorbs
        // mirrored writes on top of the migrated records, and the first
        // split after the swap restores regular sizing.
        Layout::Wo => Box::new(Body::Wo(WoBody::empty(
            opts.leaf_capacity * 2,
            opts.piece_size,
        ))),
    };
    let shadow_ptr = Box::into_raw(shadow);
    node.shadow.store(shadow_ptr, Ordering::SeqCst);

    // Ordered after the publication above via the leaf's dump locks: any
    // write not in this dump observes the shadow and mirrors itself.
    let records: Vec<Record> = node.dump_leaf(guard);
    let migrated = records.len();
    for rec in records {
        upsert_body_raw(unsafe { &*shadow_ptr }, rec.key, rec.val, false, guard);
    }

    node.node_lock.lock();
    node.header_lock.lock_exclusive();
    let old = node.body.swap(shadow_ptr, Ordering::AcqRel);
    node.shadow.store(std::ptr::null_mut(), Ordering::Release);
    node.stats.store(default_stats(target), Ordering::Relaxed);
    node.pending.store(PENDING_NONE, Ordering::Relaxed);
    node.header_lock.unlock_exclusive();
    node.node_lock.unlock();
    node.morph_lock.unlock();
    guard.defer_drop(old);

    log::debug!("morphed leaf to {:?} ({} records migrated)", target, migrated);
}

/// Background worker: drains the morph queue until the index hangs up.
pub(crate) fn worker_loop(rx: Receiver<MorphMsg>, ebr: Arc<Ebr>, opts: TreeOptions) {
    while let Ok(msg) = rx.recv() {
        let guard = ebr.pin();
        let node = unsafe { &*msg.node.0 };
        node.morph_lock.lock();
        morph_one_locked(node, msg.lsn, msg.target, &opts, &guard);
    }
    log::trace!("morph worker shutting down");
}
