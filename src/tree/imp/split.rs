//! Search helpers, k-way merging of sorted runs, and split-key selection.

use crate::record::{Key, Record, SlotCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// First index in `recs` whose key is >= `k`.
pub(crate) fn lower_bound(recs: &[Record], k: Key) -> usize {
    recs.partition_point(|r| r.key < k)
}

/// Binary search over the first `len` cells; index of the exact match.
pub(crate) fn search_cells(cells: &[SlotCell], len: usize, k: Key) -> Option<usize> {
    let mut low = 0usize;
    let mut high = len;
    while low < high {
        let mid = low + (high - low) / 2;
        let key = cells[mid].key();
        if key < k {
            low = mid + 1;
        } else if key == k {
            return Some(mid);
        } else {
            high = mid;
        }
    }
    None
}

/// Exponential search outward from a predicted position, falling back to a
/// binary search of the bracketed range. `hint` must be below `len`.
pub(crate) fn exp_search_cells(
    cells: &[SlotCell],
    len: usize,
    hint: usize,
    k: Key,
) -> Option<usize> {
    debug_assert!(hint < len && len <= cells.len());
    let at_hint = cells[hint].key();
    if at_hint == k {
        return Some(hint);
    }
    let mut step = 8usize;
    if at_hint > k {
        let mut high = hint;
        let mut low = hint.saturating_sub(step);
        while low > 0 && cells[low].key() > k {
            high = low;
            step = (step * 2).min(128);
            low = low.saturating_sub(step);
        }
        search_cells(&cells[low..high + 1], high + 1 - low, k).map(|i| low + i)
    } else {
        let mut low = hint;
        let mut high = (hint + step).min(len - 1);
        while high < len - 1 && cells[high].key() < k {
            low = high;
            step = (step * 2).min(128);
            high = (high + step).min(len - 1);
        }
        search_cells(&cells[low..high + 1], high + 1 - low, k).map(|i| low + i)
    }
}

/// Merge sorted runs into one sorted vector. Runs are given in precedence
/// order: when the same key appears in several runs, the earliest run wins.
/// Tombstoned records are dropped after deduplication.
pub(crate) fn k_way_merge(runs: &[Vec<Record>]) -> Vec<Record> {
    merge_from(runs, Key::MIN, usize::MAX)
}

/// Like [`k_way_merge`] but starting at `from` and yielding at most `n` live
/// records.
pub(crate) fn k_way_scan(runs: &[Vec<Record>], from: Key, n: usize) -> Vec<Record> {
    merge_from(runs, from, n)
}

fn merge_from(runs: &[Vec<Record>], from: Key, n: usize) -> Vec<Record> {
    let mut heap: BinaryHeap<Reverse<(Key, usize, usize)>> = BinaryHeap::new();
    let mut cursors = vec![0usize; runs.len()];
    for (id, run) in runs.iter().enumerate() {
        let start = lower_bound(run, from);
        cursors[id] = start;
        if start < run.len() {
            heap.push(Reverse((run[start].key, id, start)));
            cursors[id] = start + 1;
        }
    }

    let mut out = Vec::new();
    let mut last_key = None;
    while let Some(Reverse((key, id, pos))) = heap.pop() {
        if out.len() >= n {
            break;
        }
        let rec = runs[id][pos];
        // Lower run ids sort first for equal keys, so `last_key` keeps the
        // highest-precedence copy.
        if last_key != Some(key) && rec.is_live() {
            out.push(rec);
        }
        if last_key != Some(key) {
            last_key = Some(key);
        }
        let cur = &mut cursors[id];
        if *cur < runs[id].len() {
            heap.push(Reverse((runs[id][*cur].key, id, *cur)));
            *cur += 1;
        }
    }
    out
}

const PIVOT_NUM: usize = 32;

/// Split index near the median, biased toward the key-space location the
/// fitted models will handle worst: sample pivots, interpolate a line between
/// the extremes, and cut between the two pivots farthest from it.
pub(crate) fn suboptimal_split(recs: &[Record]) -> usize {
    let num = recs.len();
    debug_assert!(num >= 2);
    if num < PIVOT_NUM * 2 {
        return num / 2;
    }

    let min_pivot = recs[0].key as f64;
    let max_pivot = recs[num * (PIVOT_NUM - 1) / PIVOT_NUM].key as f64;
    if max_pivot <= min_pivot {
        return num / 2;
    }
    let slope = (PIVOT_NUM - 1) as f64 / (max_pivot - min_pivot);
    let intercept = -slope * min_pivot;

    let mut max_dist = -1.0;
    let mut max_i = PIVOT_NUM / 2;
    let mut submax_dist = -1.0;
    let mut submax_i = PIVOT_NUM / 2;
    for i in PIVOT_NUM / 4..=PIVOT_NUM * 3 / 4 {
        let pivot = recs[num * i / PIVOT_NUM].key as f64;
        let dist = (slope * pivot + intercept - i as f64).abs();
        if dist > max_dist {
            submax_dist = max_dist;
            submax_i = max_i;
            max_dist = dist;
            max_i = i;
        } else if dist > submax_dist {
            submax_dist = dist;
            submax_i = i;
        }
    }

    ((max_i + submax_i + 1) / 2 * num / PIVOT_NUM).clamp(1, num - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::empty_cells;

    fn run(keys: &[Key]) -> Vec<Record> {
        keys.iter().map(|&k| Record::new(k, k * 10)).collect()
    }

    #[test]
    fn merge_preserves_order_and_drops_tombstones() {
        let runs = vec![
            vec![Record::new(2, 0), Record::new(5, 50)],
            run(&[1, 3, 9]),
            run(&[4]),
        ];
        let merged = k_way_merge(&runs);
        let keys: Vec<Key> = merged.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 3, 4, 5, 9]);
    }

    #[test]
    fn merge_dedup_prefers_earlier_run() {
        let runs = vec![
            vec![Record::new(7, 700)],
            vec![Record::new(7, 1), Record::new(8, 80)],
        ];
        let merged = k_way_merge(&runs);
        assert_eq!(merged, vec![Record::new(7, 700), Record::new(8, 80)]);
    }

    #[test]
    fn tombstone_suppresses_later_copies() {
        let runs = vec![vec![Record::new(7, 0)], vec![Record::new(7, 1)]];
        assert!(k_way_merge(&runs).is_empty());
    }

    #[test]
    fn scan_bounds() {
        let runs = vec![run(&[1, 4, 7]), run(&[2, 5, 8])];
        let out = k_way_scan(&runs, 3, 3);
        let keys: Vec<Key> = out.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![4, 5, 7]);
        assert!(k_way_scan(&runs, 1, 0).is_empty());
        assert_eq!(k_way_scan(&runs, 0, 100).len(), 6);
    }

    #[test]
    fn cell_search_variants_agree() {
        let cells = empty_cells(256);
        for i in 0..200usize {
            cells[i].store(Record::new(3 * i as Key + 5, 1));
        }
        for probe in [0u64, 5, 6, 304, 602, 603, 1000] {
            let bin = search_cells(&cells, 200, probe);
            for hint in [0usize, 50, 199] {
                assert_eq!(exp_search_cells(&cells, 200, hint, probe), bin);
            }
        }
    }

    #[test]
    fn split_lands_strictly_inside() {
        let recs: Vec<Record> = (0..1280u64).map(|i| Record::new(i * i + 1, 1)).collect();
        let pid = suboptimal_split(&recs);
        assert!(pid >= 1 && pid < recs.len());

        let tiny = run(&[1, 2, 3]);
        assert_eq!(suboptimal_split(&tiny), 1);
    }
}
