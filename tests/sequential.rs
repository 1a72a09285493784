/// Deterministic model tests: every sequence of operations is mirrored
/// into a `BTreeSet` and the two structures must agree at every step.
use std::collections::BTreeSet;

use concurrent_set::ConcurrentSet;

fn set_model(items: &[u64]) -> (ConcurrentSet<u64>, BTreeSet<u64>) {
    let set = ConcurrentSet::new(u64::MAX - 1, u64::MAX).unwrap();
    let mut model = BTreeSet::new();

    for item in items {
        assert_eq!(set.insert(*item), Ok(model.insert(*item)));
    }

    (set, model)
}

fn prop_snapshot_matches(set: &ConcurrentSet<u64>, model: &BTreeSet<u64>) {
    let expected: Vec<u64> = model.iter().copied().collect();
    let actual: Vec<u64> = set.iter().collect();
    assert_eq!(expected, actual);

    let expected_rev: Vec<u64> = model.iter().rev().copied().collect();
    let actual_rev: Vec<u64> = set.iter().rev().collect();
    assert_eq!(expected_rev, actual_rev);
}

fn prop_membership_matches(set: &ConcurrentSet<u64>, model: &BTreeSet<u64>, probes: &[u64]) {
    for probe in probes {
        assert_eq!(
            set.contains(probe),
            Ok(model.contains(probe)),
            "membership disagreement for key {probe}"
        );
    }
}

#[test]
fn ascending_run() {
    let items: Vec<u64> = (0..256).collect();
    let (set, model) = set_model(&items);

    prop_snapshot_matches(&set, &model);
    prop_membership_matches(&set, &model, &[0, 1, 128, 255, 256, 1000]);
    assert_eq!(set.len(), 256);
}

#[test]
fn descending_run() {
    let items: Vec<u64> = (0..256).rev().collect();
    let (set, model) = set_model(&items);

    prop_snapshot_matches(&set, &model);
    prop_membership_matches(&set, &model, &[0, 255, 300]);
}

#[test]
fn duplicate_heavy_run() {
    let items = [95, 126, 2, 73, 0, 106, 54, 2, 95, 95, 0, 126];
    let (set, model) = set_model(&items);

    prop_snapshot_matches(&set, &model);
    assert_eq!(set.len(), model.len());
}

#[test]
fn extreme_values() {
    // keys at both ends of the permitted domain, just below the sentinels
    let items = [
        0,
        1,
        u64::MAX - 2,
        u64::MAX - 3,
        838_873_789,
        49_478_023_249_920,
        5_859_553_998_519_926_784,
    ];
    let (set, model) = set_model(&items);

    prop_snapshot_matches(&set, &model);
    prop_membership_matches(&set, &model, &items);
}

#[test]
fn interleaved_removes() {
    let items: Vec<u64> = (0..128).map(|i| (i * 37) % 128).collect();
    let (set, mut model) = set_model(&items);

    for probe in 0..192 {
        assert_eq!(set.remove(&probe), Ok(model.remove(&probe)));
        if probe % 3 == 0 {
            assert_eq!(set.insert(probe), Ok(model.insert(probe)));
        }
        if probe % 16 == 0 {
            prop_snapshot_matches(&set, &model);
        }
    }

    prop_snapshot_matches(&set, &model);
    prop_membership_matches(&set, &model, &(0..192).collect::<Vec<_>>());
}

#[test]
fn drain_and_refill() {
    let items: Vec<u64> = (0..64).collect();
    let (set, mut model) = set_model(&items);

    for item in &items {
        assert_eq!(set.remove(item), Ok(model.remove(item)));
    }
    assert_eq!(set.iter().next(), None);
    assert_eq!(set.len(), 0);

    // the emptied tree accepts the same keys again
    for item in &items {
        assert_eq!(set.insert(*item), Ok(model.insert(*item)));
    }
    prop_snapshot_matches(&set, &model);
}

#[test]
fn pseudo_random_workload() {
    // fixed-seed xorshift so the sequence is identical on every run
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    let set = ConcurrentSet::new(u64::MAX - 1, u64::MAX).unwrap();
    let mut model = BTreeSet::new();

    for step in 0..4096 {
        let key = next() % 512;
        if next() % 3 == 0 {
            assert_eq!(set.remove(&key), Ok(model.remove(&key)));
        } else {
            assert_eq!(set.insert(key), Ok(model.insert(key)));
        }

        if step % 256 == 0 {
            prop_snapshot_matches(&set, &model);
        }
    }

    prop_snapshot_matches(&set, &model);
}
