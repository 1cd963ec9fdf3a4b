//! Tree implementation: descent, split registration, root maintenance.

pub(crate) mod inner;
pub(crate) mod node;
pub(crate) mod roleaf;
pub(crate) mod root;
pub(crate) mod split;
pub(crate) mod woleaf;

use self::inner::{InnerBody, InnerInsert};
use self::node::{Body, Node};
use self::root::{RootDir, RootInsert, L3};
use crate::config::TreeOptions;
use crate::morph::MorphMsg;
use crate::record::{Key, Record, Value, KEY_MIN};
use crate::sync::{Ebr, EpochGuard};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

/// Index-scoped services handed down through every operation.
pub(crate) struct Ctx {
    pub(crate) opts: TreeOptions,
    pub(crate) ebr: Arc<Ebr>,
    /// Present when morph work is queued to the background worker.
    pub(crate) morph_tx: Mutex<Option<Sender<MorphMsg>>>,
}

pub(crate) struct TreeImp {
    pub(crate) root: RootDir,
    pub(crate) first_leaf: AtomicPtr<Node>,
    pub(crate) ctx: Arc<Ctx>,
}

unsafe impl Send for TreeImp {}
unsafe impl Sync for TreeImp {}

enum ParentRef<'g> {
    Root,
    Inner(&'g Node),
}

impl TreeImp {
    pub(crate) fn new(ctx: Arc<Ctx>) -> Self {
        let first = Node::new_leaf(
            Body::Wo(woleaf::WoBody::empty(
                ctx.opts.leaf_capacity,
                ctx.opts.piece_size,
            )),
            crate::record::KEY_MAX,
            std::ptr::null_mut(),
        );
        TreeImp {
            root: RootDir::new(first),
            first_leaf: AtomicPtr::new(first),
            ctx,
        }
    }

    /// Walk from the root to the leaf responsible for `k`, remembering the
    /// node that routed us there.
    fn descend<'g>(&self, k: Key, guard: &'g EpochGuard) -> (&'g Node, ParentRef<'g>) {
        'restart: loop {
            let mut parent = ParentRef::Root;
            let mut cur = self.root.route(k);
            loop {
                let node = unsafe { &*cur };
                match node.body(guard) {
                    Body::Inner(body) => match inner::lookup_child(node, body, k) {
                        Ok(child) => {
                            parent = ParentRef::Inner(node);
                            cur = child;
                        }
                        Err(()) => continue 'restart,
                    },
                    _ => return (node, parent),
                }
            }
        }
    }

    pub(crate) fn insert(&self, k: Key, v: Value) -> bool {
        let guard = self.ctx.ebr.pin();
        let (leaf, _) = self.descend(k, &guard);
        let outcome = leaf.store(k, v, &self.ctx, &guard);
        if let Some((split_key, right)) = outcome.split {
            // The store may have been redirected along the sibling chain, so
            // resolve the routing parent for the boundary itself.
            let (_, parent) = self.descend(split_key, &guard);
            self.register_child(parent, split_key, right, &guard);
        }
        outcome.inserted
    }

    pub(crate) fn lookup(&self, k: Key) -> Option<Value> {
        let guard = self.ctx.ebr.pin();
        let (leaf, _) = self.descend(k, &guard);
        leaf.lookup(k, &self.ctx, &guard)
    }

    pub(crate) fn update(&self, k: Key, v: Value) -> bool {
        debug_assert_ne!(v, 0, "payload 0 is reserved");
        let guard = self.ctx.ebr.pin();
        let (leaf, _) = self.descend(k, &guard);
        leaf.write_payload(k, v, &self.ctx, &guard)
    }

    pub(crate) fn remove(&self, k: Key) -> bool {
        let guard = self.ctx.ebr.pin();
        let (leaf, _) = self.descend(k, &guard);
        leaf.write_payload(k, 0, &self.ctx, &guard)
    }

    pub(crate) fn scan(&self, from: Key, n: usize) -> Vec<Record> {
        let mut out = Vec::with_capacity(n.min(1024));
        if n == 0 {
            return out;
        }
        let guard = self.ctx.ebr.pin();
        let (leaf, _) = self.descend(from, &guard);
        leaf.scan(from, n, &mut out, &guard);
        out
    }

    /// Register the right half of a split with the node that routes its key
    /// range.
    fn register_child(
        &self,
        parent: ParentRef<'_>,
        boundary: Key,
        child: *mut Node,
        guard: &EpochGuard,
    ) {
        match parent {
            ParentRef::Root => loop {
                match self.root.insert(boundary, child) {
                    RootInsert::Done => return,
                    RootInsert::NeedsNeaten => self.neaten_root(guard),
                }
            },
            ParentRef::Inner(node) => loop {
                let body = match node.body(guard) {
                    Body::Inner(b) => b,
                    // An inner node never becomes a leaf; reroute through the
                    // root to keep the boundary reachable regardless.
                    _ => return self.register_child(ParentRef::Root, boundary, child, guard),
                };
                match inner::insert_child(node, body, boundary, child, guard) {
                    InnerInsert::Done => return,
                    InnerInsert::Retry => continue,
                    InnerInsert::NeedsRebuild => {
                        inner::rebuild(node, &self.ctx, guard);
                        return;
                    }
                }
            },
        }
    }

    /// Rebuild the full root directory into a single learned inner node.
    fn neaten_root(&self, _guard: &EpochGuard) {
        self.root.lock.lock();
        if (self.root.child_count() as usize) < L3 {
            // someone else already neatened
            self.root.lock.unlock();
            return;
        }
        let pairs = self.root.collect_children();
        debug_assert_eq!(pairs[0].0, KEY_MIN);
        let body = InnerBody::from_pairs(&pairs, &self.ctx.opts);
        let inner_node = Node::new_inner(body);
        let height = self.root.height() + 1;
        self.root.install_single(inner_node, height);
        self.root.lock.unlock();
        log::info!(
            "root rebuilt into a learned inner node over {} children (height {})",
            pairs.len(),
            height
        );
    }
}
