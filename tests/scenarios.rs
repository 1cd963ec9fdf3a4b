//! End-to-end scenarios and boundary behaviors, single-threaded.

use adaptree::{Adaptree, Index, Record, TreeOptions};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use std::collections::BTreeMap;

/// Small leaves so structural changes happen at test scale.
fn small_opts() -> TreeOptions {
    TreeOptions {
        leaf_capacity: 256,
        piece_size: 32,
        probe_size: 16,
        ..TreeOptions::default()
    }
}

fn keys_of(records: &[Record]) -> Vec<u64> {
    records.iter().map(|r| r.key).collect()
}

#[test]
fn bulk_load_then_point_and_range_queries() {
    let records: Vec<Record> = [10u64, 20, 30, 40, 50]
        .iter()
        .map(|&k| Record::new(k, k * 10))
        .collect();
    let tree = Adaptree::with_records(&records, TreeOptions::default()).unwrap();

    assert_eq!(tree.lookup(30), Some(300));
    assert_eq!(tree.lookup(25), None);
    assert_eq!(
        tree.scan(15, 3),
        vec![
            Record::new(20, 200),
            Record::new(30, 300),
            Record::new(40, 400)
        ]
    );
}

#[test]
fn out_of_order_inserts_stay_consistent() {
    let tree = Adaptree::new();
    let inserts = [(5u64, 50u64), (1, 10), (3, 30), (2, 20), (4, 40)];
    for (i, &(k, v)) in inserts.iter().enumerate() {
        assert!(tree.insert(k, v), "first insert of {} must report new", k);
        for &(pk, pv) in &inserts[..=i] {
            assert_eq!(tree.lookup(pk), Some(pv), "key {} after {} inserts", pk, i + 1);
        }
    }
    assert_eq!(
        tree.scan(0, 10),
        vec![
            Record::new(1, 10),
            Record::new(2, 20),
            Record::new(3, 30),
            Record::new(4, 40),
            Record::new(5, 50)
        ]
    );
}

#[test]
fn sequential_fill_splits_and_chains() {
    let opts = small_opts();
    let n = 4 * opts.leaf_capacity as u64;
    let tree = Adaptree::with_options(opts).unwrap();
    for k in 1..=n {
        tree.insert(k, k);
    }

    let leaves = tree.check_chain();
    assert!(leaves >= 3, "expected at least two splits, got {} leaves", leaves);

    let all = tree.scan(0, usize::MAX);
    assert_eq!(all.len() as u64, n);
    assert!(all.windows(2).all(|w| w[0].key < w[1].key));
    assert_eq!(keys_of(&all), (1..=n).collect::<Vec<_>>());
    assert_eq!(tree.lookup(n), Some(n));
    assert_eq!(tree.len() as u64, n);
}

#[test]
fn extreme_keys_are_valid() {
    let tree = Adaptree::new();
    assert!(tree.insert(1, 11));
    assert!(tree.insert(u64::MAX - 1, 22));
    assert_eq!(tree.lookup(1), Some(11));
    assert_eq!(tree.lookup(u64::MAX - 1), Some(22));
    assert_eq!(
        tree.scan(0, 10),
        vec![Record::new(1, 11), Record::new(u64::MAX - 1, 22)]
    );
}

#[test]
fn empty_and_singleton_bulk_loads() {
    let tree = Adaptree::with_records(&[], TreeOptions::default()).unwrap();
    assert!(tree.is_empty());
    assert_eq!(tree.lookup(42), None);
    assert!(tree.scan(0, 10).is_empty());
    assert!(tree.insert(42, 1));
    assert_eq!(tree.lookup(42), Some(1));

    let tree = Adaptree::with_records(&[Record::new(7, 70)], TreeOptions::default()).unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.lookup(7), Some(70));
    assert_eq!(tree.lookup(8), None);
}

#[test]
fn scan_bounds() {
    let records: Vec<Record> = (1..=100u64).map(|k| Record::new(k, k)).collect();
    let tree = Adaptree::with_records(&records, TreeOptions::default()).unwrap();
    assert!(tree.scan(1, 0).is_empty());
    assert_eq!(tree.scan(0, 1000).len(), 100);
    assert_eq!(tree.scan(90, 1000).len(), 11);
}

#[test]
fn bulk_load_input_validation() {
    use adaptree::BuildError;
    let unsorted = [Record::new(5, 1), Record::new(3, 1)];
    assert_eq!(
        Adaptree::with_records(&unsorted, TreeOptions::default()).err(),
        Some(BuildError::Unsorted)
    );
    let zero_key = [Record::new(0, 1)];
    assert!(matches!(
        Adaptree::with_records(&zero_key, TreeOptions::default()).err(),
        Some(BuildError::KeyOutOfDomain(0))
    ));
    let zero_val = [Record::new(3, 0)];
    assert_eq!(
        Adaptree::with_records(&zero_val, TreeOptions::default()).err(),
        Some(BuildError::ReservedPayload)
    );

    let mut used = Adaptree::new();
    used.insert(1, 1);
    assert_eq!(
        used.bulk_load(&[Record::new(9, 9)]).err(),
        Some(BuildError::NotEmpty)
    );
}

#[test]
fn last_write_wins_under_random_upserts() {
    let mut rng = XorShiftRng::seed_from_u64(0xfeed);
    let tree = Adaptree::with_options(small_opts()).unwrap();
    let mut reference: BTreeMap<u64, u64> = BTreeMap::new();

    for round in 0u64..20_000 {
        let key = rng.gen_range(1..4096u64);
        let val = round + 1;
        let inserted = tree.insert(key, val);
        let was_new = reference.insert(key, val).is_none();
        assert_eq!(inserted, was_new, "insert verdict for key {}", key);
    }
    for (&k, &v) in &reference {
        assert_eq!(tree.lookup(k), Some(v), "key {}", k);
    }
    assert_eq!(tree.len(), reference.len());
}

#[test]
fn remove_tombstones_until_reinsert() {
    let records: Vec<Record> = (1..=500u64).map(|k| Record::new(k, k)).collect();
    let tree = Adaptree::with_records(&records, small_opts()).unwrap();

    for k in (1..=500u64).step_by(3) {
        assert!(tree.remove(k), "first remove of {}", k);
        assert_eq!(tree.lookup(k), None);
        assert!(!tree.remove(k), "second remove of {}", k);
        assert!(!tree.update(k, 9), "update of removed {}", k);
    }
    for k in (1..=500u64).step_by(6) {
        assert!(tree.insert(k, k + 1_000), "reinsert of {} reports new", k);
        assert_eq!(tree.lookup(k), Some(k + 1_000));
    }

    let live = tree.scan(0, usize::MAX);
    for w in live.windows(2) {
        assert!(w[0].key < w[1].key);
    }
    for rec in &live {
        if rec.key % 3 == 1 && rec.key % 6 != 1 {
            panic!("tombstoned key {} resurfaced", rec.key);
        }
    }
}

#[test]
fn random_scans_match_reference() {
    let mut rng = XorShiftRng::seed_from_u64(0xbead);
    let tree = Adaptree::with_options(small_opts()).unwrap();
    let mut reference: BTreeMap<u64, u64> = BTreeMap::new();

    for _ in 0..10_000 {
        let key = rng.gen_range(1..100_000u64);
        tree.insert(key, key);
        reference.insert(key, key);
    }
    for _ in 0..200 {
        let from = rng.gen_range(0..100_000u64);
        let n = rng.gen_range(0..50usize);
        let got = tree.scan(from, n);
        let want: Vec<Record> = reference
            .range(from..)
            .take(n)
            .map(|(&k, &v)| Record::new(k, v))
            .collect();
        assert_eq!(got, want, "scan({}, {})", from, n);
    }
}

#[test]
fn updates_only_touch_live_records() {
    let tree = Adaptree::new();
    assert!(!tree.update(10, 1), "update of an absent key");
    tree.insert(10, 1);
    assert!(tree.update(10, 2));
    assert_eq!(tree.lookup(10), Some(2));
    tree.remove(10);
    assert!(!tree.update(10, 3));
    assert_eq!(tree.lookup(10), None);
}

#[test]
fn structure_survives_heavy_growth() {
    // enough sequential inserts to push the root through its tiers
    let opts = TreeOptions {
        leaf_capacity: 128,
        piece_size: 16,
        probe_size: 16,
        morphing_enabled: false,
        ..TreeOptions::default()
    };
    let n = 60_000u64;
    let tree = Adaptree::with_options(opts).unwrap();
    for k in 1..=n {
        tree.insert(k, k);
    }
    let info = tree.info();
    assert!(info.leaves > 512, "growth should outrun the root directory");
    assert!(
        info.root_children < 512,
        "root must have been rebuilt, has {} children",
        info.root_children
    );
    assert!(info.height >= 1, "root rebuild raises the forest height");
    assert!(info.inner_nodes >= 1);
    assert_eq!(tree.check_chain(), info.leaves);

    let mut rng = XorShiftRng::seed_from_u64(7);
    for _ in 0..2_000 {
        let k = rng.gen_range(1..=n);
        assert_eq!(tree.lookup(k), Some(k));
    }
    assert_eq!(tree.len() as u64, n);
}
