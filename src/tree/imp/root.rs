//! Three-tier sparse root directory.
//!
//! Anchor keys in tier 1 select an 8-wide line of tier 2, whose anchors in
//! turn select an 8-wide line of tier 3. Only the deepest active tier holds
//! real `(boundary, child)` entries; the tiers above are derived anchors.
//! Entries sit at the front of each 8-slot line with `KEY_MIN` padding
//! behind them. An insert into a full line borrows a free slot from the
//! nearest line before or after it by shifting the run of entries between,
//! then re-derives the anchors. Filling a tier scatters its entries to the
//! line heads of the next tier.
//!
//! All mutation happens under the root's version lock; routing reads are
//! optimistic against it.

use super::node::Node;
use crate::record::{Key, KEY_MIN};
use crate::sync::VersionLock;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

pub(crate) const L1: usize = 8;
pub(crate) const L2: usize = 64;
pub(crate) const L3: usize = 512;
const LINE: usize = 8;

pub(crate) enum RootInsert {
    Done,
    /// Tier 3 is full: the caller must rebuild the root into a fresh
    /// learned inner node before registering more children.
    NeedsNeaten,
}

fn key_cells(n: usize) -> Box<[AtomicU64]> {
    std::iter::repeat_with(|| AtomicU64::new(KEY_MIN)).take(n).collect()
}

pub(crate) struct RootDir {
    pub(crate) lock: VersionLock,
    /// Packs `[count:32][height:16][depth:16]`; `height` is the height of
    /// the child sub-forest (0 = children are leaves).
    meta: AtomicU64,
    keys_l1: Box<[AtomicU64]>,
    keys_l2: Box<[AtomicU64]>,
    keys_l3: Box<[AtomicU64]>,
    children: Box<[AtomicPtr<Node>]>,
}

fn pack(depth: u16, height: u16, count: u32) -> u64 {
    ((count as u64) << 32) | ((height as u64) << 16) | depth as u64
}

fn unpack(meta: u64) -> (u16, u16, u32) {
    (meta as u16, (meta >> 16) as u16, (meta >> 32) as u32)
}

impl RootDir {
    pub(crate) fn new(first_child: *mut Node) -> Self {
        let root = RootDir {
            lock: VersionLock::new(),
            meta: AtomicU64::new(pack(1, 0, 1)),
            keys_l1: key_cells(L1),
            keys_l2: key_cells(L2),
            keys_l3: key_cells(L3),
            children: std::iter::repeat_with(|| AtomicPtr::new(std::ptr::null_mut()))
                .take(L3)
                .collect(),
        };
        root.children[0].store(first_child, Ordering::Relaxed);
        root
    }

    pub(crate) fn depth(&self) -> u16 {
        unpack(self.meta.load(Ordering::Acquire)).0
    }

    pub(crate) fn height(&self) -> u16 {
        unpack(self.meta.load(Ordering::Acquire)).1
    }

    pub(crate) fn child_count(&self) -> u32 {
        unpack(self.meta.load(Ordering::Acquire)).2
    }

    #[inline]
    fn active_keys(&self, depth: u16) -> &[AtomicU64] {
        match depth {
            1 => &self.keys_l1,
            2 => &self.keys_l2,
            _ => &self.keys_l3,
        }
    }

    /// Largest anchor index <= k within an 8-slot window, skipping padding.
    /// Slot 0 of the window is always taken as the floor.
    fn window_floor(keys: &[AtomicU64], base: usize, k: Key) -> usize {
        let mut idx = base;
        for j in 1..LINE {
            let key = keys[base + j].load(Ordering::Acquire);
            if j + base > 0 && key == KEY_MIN {
                break;
            }
            if key <= k {
                idx = base + j;
            } else {
                break;
            }
        }
        idx
    }

    /// Route a key to the child covering it.
    pub(crate) fn route(&self, k: Key) -> *mut Node {
        loop {
            let v = self.lock.read_begin();
            let (depth, _, count) = unpack(self.meta.load(Ordering::Acquire));
            let idx = match depth {
                1 => {
                    let mut idx = 0;
                    for j in 1..count as usize {
                        if self.keys_l1[j].load(Ordering::Acquire) <= k {
                            idx = j;
                        } else {
                            break;
                        }
                    }
                    idx
                }
                2 => {
                    let li = Self::window_floor(&self.keys_l1, 0, k);
                    Self::window_floor(&self.keys_l2, li * LINE, k)
                }
                _ => {
                    let li1 = Self::window_floor(&self.keys_l1, 0, k);
                    let li2 = Self::window_floor(&self.keys_l2, li1 * LINE, k);
                    Self::window_floor(&self.keys_l3, li2 * LINE, k)
                }
            };
            let child = self.children[idx].load(Ordering::Acquire);
            if self.lock.read_validate(v) {
                debug_assert!(!child.is_null());
                return child;
            }
        }
    }

    /// Register a new child under `boundary`. An existing equal boundary is
    /// repointed instead.
    pub(crate) fn insert(&self, boundary: Key, child: *mut Node) -> RootInsert {
        self.lock.lock();
        let (depth, height, count) = unpack(self.meta.load(Ordering::Relaxed));
        if count as usize == L3 {
            self.lock.unlock();
            return RootInsert::NeedsNeaten;
        }

        if depth == 1 {
            let n = count as usize;
            let mut pos = n;
            for j in 0..n {
                let key = self.keys_l1[j].load(Ordering::Relaxed);
                if key == boundary {
                    self.children[j].store(child, Ordering::Relaxed);
                    self.lock.unlock();
                    return RootInsert::Done;
                }
                if key > boundary {
                    pos = j;
                    break;
                }
            }
            for p in (pos..n).rev() {
                self.shift_entry(depth, p, p + 1);
            }
            self.keys_l1[pos].store(boundary, Ordering::Relaxed);
            self.children[pos].store(child, Ordering::Relaxed);
            let count = count + 1;
            if count as usize == L1 {
                self.expand(1);
                self.meta.store(pack(2, height, count), Ordering::Release);
            } else {
                self.meta.store(pack(1, height, count), Ordering::Release);
            }
            self.lock.unlock();
            return RootInsert::Done;
        }

        let n_lines = self.active_keys(depth).len() / LINE;
        let li = self.locate_line(depth, boundary);
        if self.upsert_equal(depth, li, boundary, child) {
            self.lock.unlock();
            return RootInsert::Done;
        }

        let keys = self.active_keys(depth);
        let base = li * LINE;
        let mut target = base + LINE;
        let mut free = None;
        for j in 0..LINE {
            let key = keys[base + j].load(Ordering::Relaxed);
            if base + j > 0 && key == KEY_MIN {
                free = Some(base + j);
                target = target.min(base + j);
                break;
            }
            if key > boundary && target == base + LINE {
                target = base + j;
            }
        }
        if free.is_none() {
            // look for padding behind the insertion point
            for j in target.saturating_sub(base).max(1)..LINE {
                if keys[base + j].load(Ordering::Relaxed) == KEY_MIN {
                    free = Some(base + j);
                    break;
                }
            }
        }

        match free {
            Some(free) => {
                for p in (target..free).rev() {
                    self.shift_entry(depth, p, p + 1);
                }
                self.set_entry(depth, target, boundary, child);
            }
            None => self.borrow_and_place(depth, li, n_lines, target, boundary, child),
        }

        let count = count + 1;
        self.rederive_anchors(depth);
        if depth == 2 && count as usize == L2 {
            self.expand(2);
            self.meta.store(pack(3, height, count), Ordering::Release);
        } else {
            self.meta.store(pack(depth, height, count), Ordering::Release);
        }
        self.lock.unlock();
        RootInsert::Done
    }

    /// Line of the deepest tier whose range contains `boundary`.
    fn locate_line(&self, depth: u16, boundary: Key) -> usize {
        let keys = self.active_keys(depth);
        let mut li = 0;
        for j in 1..keys.len() / LINE {
            let head = keys[j * LINE].load(Ordering::Relaxed);
            if head == KEY_MIN || head > boundary {
                break;
            }
            li = j;
        }
        li
    }

    fn upsert_equal(&self, depth: u16, li: usize, boundary: Key, child: *mut Node) -> bool {
        let keys = self.active_keys(depth);
        let base = li * LINE;
        for j in 0..LINE {
            let key = keys[base + j].load(Ordering::Relaxed);
            if base + j > 0 && key == KEY_MIN {
                break;
            }
            if key == boundary {
                self.children[base + j].store(child, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    fn set_entry(&self, depth: u16, at: usize, key: Key, child: *mut Node) {
        self.active_keys(depth)[at].store(key, Ordering::Relaxed);
        self.children[at].store(child, Ordering::Relaxed);
    }

    fn shift_entry(&self, depth: u16, from: usize, to: usize) {
        let keys = self.active_keys(depth);
        let key = keys[from].load(Ordering::Relaxed);
        let child = self.children[from].load(Ordering::Relaxed);
        keys[to].store(key, Ordering::Relaxed);
        self.children[to].store(child, Ordering::Relaxed);
    }

    fn clear_entry(&self, depth: u16, at: usize) {
        self.active_keys(depth)[at].store(KEY_MIN, Ordering::Relaxed);
        self.children[at].store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    /// The target line is full: borrow a slot from the nearest line with
    /// padding, shifting the contiguous run of entries between.
    fn borrow_and_place(
        &self,
        depth: u16,
        li: usize,
        n_lines: usize,
        target: usize,
        boundary: Key,
        child: *mut Node,
    ) {
        let keys = self.active_keys(depth);
        for d in 1..n_lines {
            // Donor before: its line gains the head of the following line,
            // the occupied run in between shifts left, and the boundary
            // lands just below the target slot. The lines between donor and
            // target are full, so the run is contiguous.
            if li >= d && keys[(li - d) * LINE + LINE - 1].load(Ordering::Relaxed) == KEY_MIN {
                let donor_base = (li - d) * LINE;
                let mut gap = donor_base + 1;
                for j in 1..LINE {
                    if keys[donor_base + j].load(Ordering::Relaxed) != KEY_MIN {
                        gap = donor_base + j + 1;
                    } else {
                        break;
                    }
                }
                let run_start = (li - d + 1) * LINE;
                self.shift_entry(depth, run_start, gap);
                for p in run_start + 1..target {
                    self.shift_entry(depth, p, p - 1);
                }
                self.set_entry(depth, target - 1, boundary, child);
                return;
            }
            // donor after: shift the run right, insert at target
            if li + d < n_lines
                && keys[(li + d) * LINE + LINE - 1].load(Ordering::Relaxed) == KEY_MIN
            {
                let donor_base = (li + d) * LINE;
                let mut free = donor_base;
                for j in 0..LINE {
                    if keys[donor_base + j].load(Ordering::Relaxed) == KEY_MIN && donor_base + j > 0
                    {
                        free = donor_base + j;
                        break;
                    }
                }
                for p in (target..free).rev() {
                    self.shift_entry(depth, p, p + 1);
                }
                self.set_entry(depth, target, boundary, child);
                return;
            }
        }
        unreachable!("tier below capacity must contain a free slot");
    }

    /// Scatter the entries of the active tier onto the line heads of the
    /// next one (position `i` moves to `8 i`).
    fn expand(&self, from_depth: u16) {
        let size = self.active_keys(from_depth).len();
        for i in (0..size).rev() {
            let key = self.active_keys(from_depth)[i].load(Ordering::Relaxed);
            let child = self.children[i].load(Ordering::Relaxed);
            self.set_entry(from_depth + 1, i * LINE, key, child);
        }
        for j in 0..size * LINE {
            if j % LINE != 0 {
                self.clear_entry(from_depth + 1, j);
            }
        }
        self.rederive_anchors(from_depth + 1);
        log::debug!("root expanded to tier {}", from_depth + 1);
    }

    /// Re-derive the anchor tiers from the deepest tier's line heads.
    fn rederive_anchors(&self, depth: u16) {
        if depth >= 3 {
            for j in 0..L2 {
                let head = self.keys_l3[j * LINE].load(Ordering::Relaxed);
                self.keys_l2[j].store(head, Ordering::Relaxed);
            }
        }
        if depth >= 2 {
            for i in 0..L1 {
                let head = self.keys_l2[i * LINE].load(Ordering::Relaxed);
                self.keys_l1[i].store(head, Ordering::Relaxed);
            }
        }
    }

    /// All `(boundary, child)` entries in order. Caller must hold the lock
    /// or otherwise exclude writers.
    pub(crate) fn collect_children(&self) -> Vec<(Key, *mut Node)> {
        let (depth, _, count) = unpack(self.meta.load(Ordering::Acquire));
        let mut out = Vec::with_capacity(count as usize);
        if depth == 1 {
            for j in 0..count as usize {
                out.push((
                    self.keys_l1[j].load(Ordering::Relaxed),
                    self.children[j].load(Ordering::Relaxed),
                ));
            }
            return out;
        }
        let keys = self.active_keys(depth);
        for j in 0..keys.len() {
            let key = keys[j].load(Ordering::Relaxed);
            if j > 0 && key == KEY_MIN {
                continue;
            }
            let child = self.children[j].load(Ordering::Relaxed);
            if !child.is_null() {
                out.push((key, child));
            }
        }
        out
    }

    /// Reset to a single child (after a root rebuild). Caller holds the
    /// lock.
    pub(crate) fn install_single(&self, child: *mut Node, height: u16) {
        debug_assert!(self.lock.is_locked());
        for j in 0..L3 {
            self.keys_l3[j].store(KEY_MIN, Ordering::Relaxed);
            self.children[j].store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        for j in 0..L2 {
            self.keys_l2[j].store(KEY_MIN, Ordering::Relaxed);
        }
        for j in 0..L1 {
            self.keys_l1[j].store(KEY_MIN, Ordering::Relaxed);
        }
        self.children[0].store(child, Ordering::Relaxed);
        self.meta.store(pack(1, height, 1), Ordering::Release);
    }

    /// Spread up to `L3` children across the directory, leaving insertion
    /// headroom in every line. Used by bulk load.
    pub(crate) fn install_spread(&self, pairs: &[(Key, *mut Node)], height: u16) {
        let n = pairs.len();
        debug_assert!(n >= 1 && n <= L3);
        debug_assert_eq!(pairs[0].0, KEY_MIN);
        self.lock.lock();
        self.install_single(pairs[0].1, height);
        if n == 1 {
            self.lock.unlock();
            return;
        }

        let (depth, lines) = if n < L1 {
            (1u16, 1usize)
        } else if n < L2 {
            (2, L1)
        } else {
            (3, L2)
        };
        if depth == 1 {
            for (j, &(key, child)) in pairs.iter().enumerate() {
                self.keys_l1[j].store(key, Ordering::Relaxed);
                self.children[j].store(child, Ordering::Relaxed);
            }
        } else {
            for li in 0..lines {
                let start = li * n / lines;
                let end = (li + 1) * n / lines;
                debug_assert!(end - start <= LINE);
                for (offset, &(key, child)) in pairs[start..end].iter().enumerate() {
                    self.set_entry(depth, li * LINE + offset, key, child);
                }
            }
            self.rederive_anchors(depth);
        }
        self.meta.store(pack(depth, height, n as u32), Ordering::Release);
        self.lock.unlock();
    }
}
