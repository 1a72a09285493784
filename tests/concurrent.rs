use concurrent_set::ConcurrentSet;

fn new_set<const LOCAL_GC_BUFFER_SIZE: usize>() -> ConcurrentSet<u32, LOCAL_GC_BUFFER_SIZE> {
    ConcurrentSet::new(u32::MAX - 1, u32::MAX).unwrap()
}

#[test]
fn concurrent_set() {
    let n: u32 = 512;
    let concurrency = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
        * 2;

    let run = |set: ConcurrentSet<u32, 16>, barrier: &std::sync::Barrier, low_bits: u32| {
        let shift = concurrency.next_power_of_two().trailing_zeros();
        let unique_key = |key: u32| (key << shift) | low_bits;

        barrier.wait();
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(set.contains(&i), Ok(false));
            assert_eq!(set.insert(i), Ok(true), "failed to insert key {i}");
            assert_eq!(set.contains(&i), Ok(true), "failed to find key {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(set.contains(&i), Ok(true), "failed to find key {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(set.insert(i), Ok(false), "key {i} was lost");
        }

        let visible: std::collections::HashSet<u32> = set.iter().collect();
        for key in 0..n {
            let i = unique_key(key);
            assert!(visible.contains(&i), "snapshot is missing key {i}");
        }

        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(set.remove(&i), Ok(true), "failed to remove key {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(set.contains(&i), Ok(false), "key {i} survived removal");
        }
    };

    let set = new_set::<16>();

    std::thread::scope(|s| {
        for _ in 0..16 {
            let barrier = std::sync::Arc::new(std::sync::Barrier::new(concurrency));
            let mut threads = vec![];
            for i in 0..concurrency {
                let set_2 = set.clone();
                let barrier_2 = barrier.clone();

                let thread = s.spawn(move || run(set_2, &barrier_2, u32::try_from(i).unwrap()));
                threads.push(thread);
            }
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(set.iter().next(), None);
            assert_eq!(set.len(), 0);
        }
    });
}

#[test]
fn striped_bulk_insert() {
    let threads: u32 = 8;
    let stride: u32 = 1000;

    let set = new_set::<128>();
    let barrier = std::sync::Barrier::new(threads as usize);

    std::thread::scope(|s| {
        let mut handles = vec![];
        for t in 0..threads {
            let set_2 = set.clone();
            let barrier_2 = &barrier;

            let handle = s.spawn(move || {
                barrier_2.wait();
                for key in t * stride..(t + 1) * stride {
                    assert_eq!(set_2.insert(key), Ok(true));
                }
            });
            handles.push(handle);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    });

    let snapshot: Vec<u32> = set.iter().collect();
    let expected: Vec<u32> = (0..threads * stride).collect();
    assert_eq!(snapshot, expected);
    assert_eq!(set.len(), (threads * stride) as usize);
}

// Two threads fighting over a single key exercise the full help protocol:
// every interleaving of IFLAG, DFLAG, MARK and the backtracking unflag
// shows up here eventually.
#[test]
fn same_key_churn() {
    let iterations = 100_000;

    let set = new_set::<16>();
    let barrier = std::sync::Barrier::new(2);

    std::thread::scope(|s| {
        let mut handles = vec![];
        for _ in 0..2 {
            let set_2 = set.clone();
            let barrier_2 = &barrier;

            let handle = s.spawn(move || {
                barrier_2.wait();
                for _ in 0..iterations {
                    set_2.insert(100).unwrap();
                    set_2.remove(&100).unwrap();
                }
            });
            handles.push(handle);
        }
        for handle in handles {
            handle.join().unwrap();
        }
    });

    // the last operation in real time is a remove, so the key is gone and
    // the tree is back to its initial two-sentinel configuration.
    assert_eq!(set.iter().next(), None);
    assert_eq!(set.contains(&100), Ok(false));
    assert_eq!(set.len(), 0);
}

#[test]
fn mixed_readers_and_writers() {
    let n: u32 = 2048;
    let writers = 4;
    let readers = 4;

    let set = new_set::<128>();
    let barrier = std::sync::Barrier::new(writers + readers);

    std::thread::scope(|s| {
        let mut handles = vec![];

        for w in 0..writers {
            let set_2 = set.clone();
            let barrier_2 = &barrier;

            let handle = s.spawn(move || {
                let low_bits = u32::try_from(w).unwrap();
                barrier_2.wait();
                for key in 0..n {
                    let i = (key << 3) | low_bits;
                    set_2.insert(i).unwrap();
                    if key % 2 == 0 {
                        set_2.remove(&i).unwrap();
                    }
                }
            });
            handles.push(handle);
        }

        for _ in 0..readers {
            let set_2 = set.clone();
            let barrier_2 = &barrier;

            let handle = s.spawn(move || {
                barrier_2.wait();
                for _ in 0..8 {
                    let snapshot: Vec<u32> = set_2.iter().collect();
                    // the snapshot is always sorted and duplicate-free,
                    // no matter what the writers are doing
                    assert!(snapshot.windows(2).all(|pair| pair[0] < pair[1]));
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }
    });

    // after quiescence, exactly the odd-indexed keys of each writer remain
    let mut expected: Vec<u32> = vec![];
    for w in 0..writers {
        let low_bits = u32::try_from(w).unwrap();
        for key in (1..n).step_by(2) {
            expected.push((key << 3) | low_bits);
        }
    }
    expected.sort_unstable();

    let snapshot: Vec<u32> = set.iter().collect();
    assert_eq!(snapshot, expected);
}
