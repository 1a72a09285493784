#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate concurrent_set;

fuzz_target!(|data: Vec<u16>| {
    let mut model = std::collections::BTreeSet::new();

    for item in &data {
        if *item < u16::MAX - 1 {
            model.insert(*item);
        }
    }

    let model_snapshot: Vec<u16> = model.iter().copied().collect();

    let set = concurrent_set::ConcurrentSet::<u16>::new(u16::MAX - 1, u16::MAX).unwrap();

    for item in &data {
        let _ = set.insert(*item);
    }

    let snapshot: Vec<u16> = set.iter().collect();
    assert_eq!(snapshot, model_snapshot);

    // removing every other surviving key leaves exactly the rest
    for (i, item) in model_snapshot.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(set.remove(item), Ok(true));
            model.remove(item);
        }
    }

    let thinned: Vec<u16> = set.iter().collect();
    let model_thinned: Vec<u16> = model.iter().copied().collect();
    assert_eq!(thinned, model_thinned);
});
