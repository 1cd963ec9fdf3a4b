//! Learned inner node of the leaf directory.
//!
//! The slot array is cut into 8-slot lines. Every slot is populated: gaps
//! left by the model are padded with copies of the nearest entry to the
//! left, so a routing probe never has to special-case emptiness. A line that
//! cannot hold all boundaries predicted into it spills its smallest entries
//! into a side structure (a sorted vector of `(boundary, child)` pairs);
//! slot 0 then doubles as the side structure's lower fence.
//!
//! Writers lock one line; routing reads are optimistic against the line
//! version. A rebuild dumps all pairs and swaps in a freshly modelled body.

use super::node::{Body, Node, RO_STATS};
use super::Ctx;
use crate::config::TreeOptions;
use crate::model::{LinearModel, LinearModelBuilder};
use crate::record::{Key, KEY_MIN};
use crate::sync::{EpochGuard, VersionLock};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Slots per line.
const LINE: usize = 8;
/// Slot-array size is `count / RHO_INNER` rounded up to a full line.
const RHO_INNER_INV: usize = 3;
/// Absolute bound on boundaries per node; a rebuild is forced way before.
const HARD_CAP: u32 = 4096;

pub(crate) struct ChildCell {
    key: AtomicU64,
    child: AtomicPtr<Node>,
}

impl ChildCell {
    fn new(key: Key, child: *mut Node) -> Self {
        ChildCell {
            key: AtomicU64::new(key),
            child: AtomicPtr::new(child),
        }
    }

    #[inline]
    fn key(&self) -> Key {
        self.key.load(Ordering::Relaxed)
    }

    #[inline]
    fn child(&self) -> *mut Node {
        self.child.load(Ordering::Relaxed)
    }

    #[inline]
    fn load(&self) -> (Key, *mut Node) {
        (self.key(), self.child())
    }

    #[inline]
    fn store(&self, key: Key, child: *mut Node) {
        self.key.store(key, Ordering::Relaxed);
        self.child.store(child, Ordering::Relaxed);
    }
}

struct SiChunk {
    cells: Box<[ChildCell]>,
}

fn si_cells(n: usize) -> Box<[ChildCell]> {
    std::iter::repeat_with(|| ChildCell::new(KEY_MIN, std::ptr::null_mut()))
        .take(n)
        .collect()
}

/// Sorted overflow container attached to one line.
pub(crate) struct SimpleInner {
    len: AtomicU32,
    chunk: AtomicPtr<SiChunk>,
}

impl SimpleInner {
    fn from_pairs(pairs: &[(Key, *mut Node)]) -> Self {
        let cells = si_cells(pairs.len().next_power_of_two().max(4));
        for (cell, &(k, c)) in cells.iter().zip(pairs) {
            cell.store(k, c);
        }
        SimpleInner {
            len: AtomicU32::new(pairs.len() as u32),
            chunk: AtomicPtr::new(Box::into_raw(Box::new(SiChunk { cells }))),
        }
    }

    #[inline]
    fn chunk(&self) -> &SiChunk {
        unsafe { &*self.chunk.load(Ordering::Acquire) }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    /// Insert keeping order; the owning line lock must be held.
    fn insert(&self, k: Key, child: *mut Node, guard: &EpochGuard) {
        let len = self.len();
        let chunk = self.chunk();
        if len == chunk.cells.len() {
            let old = self.chunk.load(Ordering::Relaxed);
            let cells = si_cells(len * 3 / 2 + 1);
            for i in 0..len {
                cells[i].store(chunk.cells[i].key(), chunk.cells[i].child());
            }
            self.chunk
                .store(Box::into_raw(Box::new(SiChunk { cells })), Ordering::Release);
            guard.defer_drop(old);
        }
        let chunk = self.chunk();
        let pos = chunk.cells[..len].partition_point(|c| c.key() < k);
        for i in (pos..len).rev() {
            let (mk, mc) = chunk.cells[i].load();
            chunk.cells[i + 1].store(mk, mc);
        }
        chunk.cells[pos].store(k, child);
        self.len.store(len as u32 + 1, Ordering::Release);
    }

    fn update_equal(&self, k: Key, child: *mut Node) -> bool {
        let len = self.len();
        let chunk = self.chunk();
        let pos = chunk.cells[..len].partition_point(|c| c.key() < k);
        if pos < len && chunk.cells[pos].key() == k {
            chunk.cells[pos].store(k, child);
            true
        } else {
            false
        }
    }

    /// Child of the largest boundary <= k.
    fn find_le(&self, k: Key) -> *mut Node {
        let len = self.len();
        let chunk = self.chunk();
        let pos = chunk.cells[..len].partition_point(|c| c.key() <= k);
        debug_assert!(pos > 0, "side structure consulted below its fence");
        chunk.cells[pos - 1].child()
    }

    fn entries(&self) -> Vec<(Key, *mut Node)> {
        let len = self.len();
        let chunk = self.chunk();
        (0..len).map(|i| chunk.cells[i].load()).collect()
    }
}

impl Drop for SimpleInner {
    fn drop(&mut self) {
        let chunk = self.chunk.load(Ordering::Relaxed);
        if !chunk.is_null() {
            unsafe { drop(Box::from_raw(chunk)) };
        }
    }
}

struct LineState {
    lock: VersionLock,
    overflow: AtomicPtr<SimpleInner>,
}

impl LineState {
    fn new() -> Self {
        LineState {
            lock: VersionLock::new(),
            overflow: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    fn side(&self) -> Option<&SimpleInner> {
        let ptr = self.overflow.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

impl Drop for LineState {
    fn drop(&mut self) {
        let side = self.overflow.load(Ordering::Relaxed);
        if !side.is_null() {
            unsafe { drop(Box::from_raw(side)) };
        }
    }
}

pub(crate) enum InnerInsert {
    Done,
    NeedsRebuild,
    /// The body was swapped while the caller held a reference; re-dispatch.
    Retry,
}

pub(crate) struct InnerBody {
    model: LinearModel,
    capacity: u32,
    slots: Box<[ChildCell]>,
    lines: Box<[LineState]>,
    count: AtomicU32,
    of_count: AtomicU32,
    overflow_max_ratio: f64,
}

impl InnerBody {
    pub(crate) fn from_pairs(pairs: &[(Key, *mut Node)], opts: &TreeOptions) -> Self {
        debug_assert!(!pairs.is_empty());
        debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
        let n = pairs.len();
        let capacity = ((n * RHO_INNER_INV + LINE - 1) / LINE * LINE).max(LINE);
        let margin = (capacity / 4).min(LINE);

        let mut builder = LinearModelBuilder::new();
        let (lo, hi) = if n >= 8 { (n / 8, n * 7 / 8) } else { (0, n) };
        for (rank, (key, _)) in pairs.iter().enumerate().take(hi).skip(lo) {
            builder.add(*key, rank);
        }
        let model = builder.build().rescale(n, capacity, margin);

        let n_lines = capacity / LINE;
        let slots: Box<[ChildCell]> =
            std::iter::repeat_with(|| ChildCell::new(KEY_MIN, std::ptr::null_mut()))
                .take(capacity)
                .collect();
        let lines: Box<[LineState]> = std::iter::repeat_with(LineState::new)
            .take(n_lines)
            .collect();

        let body = InnerBody {
            model,
            capacity: capacity as u32,
            slots,
            lines,
            count: AtomicU32::new(n as u32),
            of_count: AtomicU32::new(0),
            overflow_max_ratio: opts.overflow_max_ratio,
        };

        let mut pad = pairs[0];
        let mut it = 0usize;
        for li in 0..n_lines {
            let base = li * LINE;
            let mut group_end = it;
            while group_end < n && body.line_of(pairs[group_end].0) <= li {
                group_end += 1;
            }
            let group = &pairs[it..group_end];
            if group.len() <= LINE {
                for (offset, &(k, c)) in group.iter().enumerate() {
                    body.slots[base + offset].store(k, c);
                }
                if let Some(&last) = group.last() {
                    pad = last;
                }
                for offset in group.len()..LINE {
                    body.slots[base + offset].store(pad.0, pad.1);
                }
            } else {
                // Spill the smallest entries; the line keeps its head as the
                // side fence plus the seven largest boundaries.
                let spill = group.len() - (LINE - 1);
                let side = SimpleInner::from_pairs(&group[..spill]);
                body.lines[li]
                    .overflow
                    .store(Box::into_raw(Box::new(side)), Ordering::Relaxed);
                body.slots[base].store(group[0].0, group[0].1);
                for (offset, &(k, c)) in group[spill..].iter().enumerate() {
                    body.slots[base + 1 + offset].store(k, c);
                }
                body.of_count.fetch_add(spill as u32, Ordering::Relaxed);
                pad = *group.last().unwrap();
            }
            it = group_end;
        }
        debug_assert_eq!(it, n, "model predictions must be monotone");
        body
    }

    #[inline]
    fn line_of(&self, k: Key) -> usize {
        self.model.predict_slot(k, self.capacity as usize) / LINE
    }

    #[inline]
    fn head(&self, li: usize) -> Key {
        self.slots[li * LINE].key()
    }

    fn n_lines(&self) -> usize {
        self.capacity as usize / LINE
    }

    /// Line whose range contains `k`. Line heads are immutable for the life
    /// of a body, so no lock is needed.
    fn locate_line(&self, k: Key) -> usize {
        let mut li = self.line_of(k).min(self.n_lines() - 1);
        while li > 0 && self.head(li) > k {
            li -= 1;
        }
        while li + 1 < self.n_lines() && self.head(li + 1) <= k {
            li += 1;
        }
        li
    }

    pub(crate) fn child_count(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    fn should_rebuild(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        let of = self.of_count.load(Ordering::Relaxed);
        count >= self.capacity
            || count >= HARD_CAP
            || of as f64 > count as f64 * self.overflow_max_ratio
    }
}

fn body_current(node: &Node, body: &InnerBody) -> bool {
    match unsafe { &*node.body_ptr() } {
        Body::Inner(b) => std::ptr::eq(b, body),
        _ => false,
    }
}

/// Route `k` to a child. `Err(())` means the body was swapped and the
/// descent must restart.
pub(crate) fn lookup_child(node: &Node, body: &InnerBody, k: Key) -> Result<*mut Node, ()> {
    loop {
        let hv = node.header_lock.read_begin();
        if !body_current(node, body) {
            return Err(());
        }
        if !node.header_lock.read_validate(hv) {
            continue;
        }

        let li = body.locate_line(k);
        let base = li * LINE;
        let lv = body.lines[li].lock.read_begin();
        let mut idx = 0;
        for i in 1..LINE {
            if body.slots[base + i].key() <= k {
                idx = i;
            } else {
                break;
            }
        }
        let child = match body.lines[li].side() {
            Some(side) if idx == 0 => side.find_le(k),
            _ => body.slots[base + idx].child(),
        };
        if !body.lines[li].lock.read_validate(lv) {
            continue;
        }
        debug_assert!(!child.is_null());
        return Ok(child);
    }
}

/// Distinct `(boundary, child)` entries of a locked line, padding removed.
fn line_reals(body: &InnerBody, li: usize) -> Vec<(Key, *mut Node)> {
    let base = li * LINE;
    let mut reals: Vec<(Key, *mut Node)> = Vec::with_capacity(LINE);
    for i in 0..LINE {
        let (k, c) = body.slots[base + i].load();
        if reals.last().map(|&(lk, _)| lk) != Some(k) {
            reals.push((k, c));
        }
    }
    reals
}

fn write_line(body: &InnerBody, li: usize, reals: &[(Key, *mut Node)]) {
    debug_assert!(reals.len() <= LINE && !reals.is_empty());
    let base = li * LINE;
    for (i, &(k, c)) in reals.iter().enumerate() {
        body.slots[base + i].store(k, c);
    }
    let &(pk, pc) = reals.last().unwrap();
    for i in reals.len()..LINE {
        body.slots[base + i].store(pk, pc);
    }
}

/// Rewrite the child of every slot holding `boundary` (padding copies
/// included, which may span whole lines in both directions from the located
/// one) and in the side structures if present. Caller locks nothing; lines
/// are locked one at a time.
fn update_equal_runs(body: &InnerBody, mut li: usize, boundary: Key, child: *mut Node) -> bool {
    // The real slot lives in the first line of the run; lines whose head
    // equals the boundary are padding continuations.
    while li > 0 && body.head(li) == boundary {
        li -= 1;
    }
    let mut found = false;
    loop {
        let line = &body.lines[li];
        line.lock.lock();
        let base = li * LINE;
        for i in 0..LINE {
            if body.slots[base + i].key() == boundary {
                body.slots[base + i].store(boundary, child);
                found = true;
            }
        }
        if let Some(side) = line.side() {
            found |= side.update_equal(boundary, child);
        }
        line.lock.unlock();
        li += 1;
        if li >= body.n_lines() || body.head(li) != boundary {
            return found;
        }
    }
}

pub(crate) fn insert_child(
    node: &Node,
    body: &InnerBody,
    boundary: Key,
    child: *mut Node,
    guard: &EpochGuard,
) -> InnerInsert {
    node.header_lock.lock_shared();
    if !body_current(node, body) {
        node.header_lock.unlock_shared();
        return InnerInsert::Retry;
    }

    let li = body.locate_line(boundary);
    let line = &body.lines[li];
    let base = li * LINE;
    line.lock.lock();

    // Existing boundary: overwrite its child everywhere it appears.
    let exists = (0..LINE).any(|i| body.slots[base + i].key() == boundary)
        || line
            .side()
            .map(|s| s.entries().iter().any(|&(k, _)| k == boundary))
            .unwrap_or(false);
    if exists {
        line.lock.unlock();
        update_equal_runs(body, li, boundary, child);
        if node.node_lock.is_locked() {
            node.header_lock.unlock_shared();
            return InnerInsert::Retry;
        }
        node.header_lock.unlock_shared();
        return InnerInsert::Done;
    }

    match line.side() {
        None => {
            let mut reals = line_reals(body, li);
            let pos = reals.partition_point(|&(k, _)| k < boundary);
            reals.insert(pos, (boundary, child));
            if reals.len() <= LINE {
                write_line(body, li, &reals);
            } else {
                // Line over-full: spill the two smallest behind a side
                // structure fenced by the line head.
                let side = SimpleInner::from_pairs(&reals[..2]);
                line.overflow
                    .store(Box::into_raw(Box::new(side)), Ordering::Release);
                let head = reals[0];
                let mut tail: Vec<(Key, *mut Node)> = Vec::with_capacity(LINE);
                tail.push(head);
                tail.extend_from_slice(&reals[2..]);
                write_line(body, li, &tail);
                body.of_count.fetch_add(2, Ordering::Relaxed);
            }
        }
        Some(side) => {
            if boundary < body.slots[base + 1].key() {
                side.insert(boundary, child, guard);
            } else {
                // Kick the smallest tail slot into the side structure and
                // slide the rest down to make room.
                let mut reals: Vec<(Key, *mut Node)> =
                    (1..LINE).map(|i| body.slots[base + i].load()).collect();
                side.insert(reals[0].0, reals[0].1, guard);
                reals.remove(0);
                let pos = reals.partition_point(|&(k, _)| k < boundary);
                reals.insert(pos, (boundary, child));
                for (i, &(k, c)) in reals.iter().enumerate() {
                    body.slots[base + 1 + i].store(k, c);
                }
            }
            body.of_count.fetch_add(1, Ordering::Relaxed);
        }
    }
    body.count.fetch_add(1, Ordering::Relaxed);
    line.lock.unlock();

    if node.node_lock.is_locked() {
        // Racing rebuild: its dump may predate this insert; reapply against
        // the new body (the equal-boundary path makes that idempotent).
        node.header_lock.unlock_shared();
        return InnerInsert::Retry;
    }
    let needs_rebuild = body.should_rebuild();
    node.header_lock.unlock_shared();
    if needs_rebuild {
        InnerInsert::NeedsRebuild
    } else {
        InnerInsert::Done
    }
}

/// All `(boundary, child)` pairs in ascending order, padding removed.
pub(crate) fn dump_pairs(body: &InnerBody) -> Vec<(Key, *mut Node)> {
    let mut out: Vec<(Key, *mut Node)> = Vec::with_capacity(body.child_count());
    for li in 0..body.n_lines() {
        let line = &body.lines[li];
        line.lock.lock();
        let base = li * LINE;
        // A side fence can itself be a padding copy of an earlier entry, so
        // side entries dedup against the output as well.
        let has_side = if let Some(side) = line.side() {
            for (k, c) in side.entries() {
                if out.last().map(|&(lk, _)| lk) != Some(k) {
                    out.push((k, c));
                }
            }
            true
        } else {
            false
        };
        for i in 0..LINE {
            let (k, c) = body.slots[base + i].load();
            // skip the head fence when the side already carries it
            if has_side && i == 0 {
                continue;
            }
            if out.last().map(|&(lk, _)| lk) != Some(k) {
                out.push((k, c));
            }
        }
        line.lock.unlock();
    }
    debug_assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
    out
}

/// Dump, re-model and swap this inner node's body in place.
pub(crate) fn rebuild(node: &Node, ctx: &Ctx, guard: &EpochGuard) {
    node.morph_lock.lock();
    node.node_lock.lock();
    let body = match node.body(guard) {
        Body::Inner(b) => b,
        _ => {
            node.node_lock.unlock();
            node.morph_lock.unlock();
            return;
        }
    };
    let pairs = dump_pairs(body);
    let fresh = InnerBody::from_pairs(&pairs, &ctx.opts);
    node.install_body(Box::new(Body::Inner(fresh)), RO_STATS, guard);
    node.node_lock.unlock();
    node.morph_lock.unlock();
    log::debug!("rebuilt inner node over {} children", pairs.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Ebr;

    fn fake_child(i: usize) -> *mut Node {
        (0x1000 + i * 16) as *mut Node
    }

    fn pairs(n: usize) -> Vec<(Key, *mut Node)> {
        (0..n).map(|i| (10 + 10 * i as Key, fake_child(i))).collect()
    }

    fn free_node(node: *mut Node) {
        unsafe {
            let node = Box::from_raw(node);
            drop(Box::from_raw(node.body.load(Ordering::Relaxed)));
        }
    }

    #[test]
    fn routes_every_boundary_range() {
        let ps = pairs(100);
        let node = Node::new_inner(InnerBody::from_pairs(&ps, &TreeOptions::default()));
        let node_ref = unsafe { &*node };
        let ebr = Ebr::new();
        let guard = ebr.pin();
        let body = match node_ref.body(&guard) {
            Body::Inner(b) => b,
            _ => unreachable!(),
        };
        for (i, &(k, c)) in ps.iter().enumerate() {
            assert_eq!(lookup_child(node_ref, body, k), Ok(c));
            assert_eq!(lookup_child(node_ref, body, k + 5), Ok(c), "range of {}", k);
            if i + 1 < ps.len() {
                assert_eq!(lookup_child(node_ref, body, k + 9), Ok(c));
            }
        }
        // below-first routes to the first child
        assert_eq!(lookup_child(node_ref, body, 10), Ok(ps[0].1));
        drop(guard);
        free_node(node);
    }

    #[test]
    fn insert_then_route_and_dump() {
        let ps = pairs(20);
        let node = Node::new_inner(InnerBody::from_pairs(&ps, &TreeOptions::default()));
        let node_ref = unsafe { &*node };
        let ebr = Ebr::new();
        let guard = ebr.pin();
        let body = match node_ref.body(&guard) {
            Body::Inner(b) => b,
            _ => unreachable!(),
        };
        // boundaries between existing ones
        for i in 0..20usize {
            let k = 15 + 10 * i as Key;
            assert!(!matches!(
                insert_child(node_ref, body, k, fake_child(100 + i), &guard),
                InnerInsert::Retry
            ));
        }
        for i in 0..20usize {
            let k = 15 + 10 * i as Key;
            assert_eq!(lookup_child(node_ref, body, k), Ok(fake_child(100 + i)));
            assert_eq!(lookup_child(node_ref, body, k + 2), Ok(fake_child(100 + i)));
        }
        let dumped = dump_pairs(body);
        assert_eq!(dumped.len(), 40);
        assert!(dumped.windows(2).all(|w| w[0].0 < w[1].0));
        drop(guard);
        free_node(node);
    }

    #[test]
    fn skewed_inserts_overflow_into_side_structures() {
        let ps = pairs(8);
        let node = Node::new_inner(InnerBody::from_pairs(&ps, &TreeOptions::default()));
        let node_ref = unsafe { &*node };
        let ebr = Ebr::new();
        let guard = ebr.pin();
        let body = match node_ref.body(&guard) {
            Body::Inner(b) => b,
            _ => unreachable!(),
        };
        // Cram many boundaries into one model range.
        let mut asked_rebuild = false;
        for i in 1..=40u64 {
            let k = 20 + i; // all between the second and third original pair
            match insert_child(node_ref, body, k, fake_child(200 + i as usize), &guard) {
                InnerInsert::NeedsRebuild => asked_rebuild = true,
                InnerInsert::Done => {}
                InnerInsert::Retry => unreachable!(),
            }
        }
        assert!(asked_rebuild, "overflow pressure must request a rebuild");
        for i in 1..=40u64 {
            let k = 20 + i;
            assert_eq!(
                lookup_child(node_ref, body, k),
                Ok(fake_child(200 + i as usize)),
                "key {}",
                k
            );
        }
        assert_eq!(dump_pairs(body).len(), 48);
        drop(guard);
        free_node(node);
    }

    #[test]
    fn existing_boundary_repoints_equal_runs() {
        let ps = pairs(4);
        let node = Node::new_inner(InnerBody::from_pairs(&ps, &TreeOptions::default()));
        let node_ref = unsafe { &*node };
        let ebr = Ebr::new();
        let guard = ebr.pin();
        let body = match node_ref.body(&guard) {
            Body::Inner(b) => b,
            _ => unreachable!(),
        };
        // Registering an already-known boundary repoints its child instead
        // of adding an entry.
        let replacement = fake_child(999);
        assert!(matches!(
            insert_child(node_ref, body, ps[3].0, replacement, &guard),
            InnerInsert::Done
        ));
        assert_eq!(body.child_count(), ps.len());
        assert_eq!(lookup_child(node_ref, body, ps[3].0 + 1), Ok(replacement));
        // padding copies to the right of the last pair must follow
        assert_eq!(lookup_child(node_ref, body, ps[3].0 + 1000), Ok(replacement));
        drop(guard);
        free_node(node);
    }
}
