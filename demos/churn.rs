use std::thread::scope;
use std::time::Instant;

use concurrent_set::ConcurrentSet;

const WRITERS: usize = 64;
const READERS: usize = 16;
const N: usize = 1024 * 1024;
const WRITER_N: usize = N / WRITERS;

fn writer(set: ConcurrentSet<usize>, min: usize, max: usize) {
    for i in min..max {
        set.insert(i).unwrap();
    }
    for i in min..max {
        assert_eq!(set.remove(&i), Ok(true));
    }
}

fn reader(set: ConcurrentSet<usize>) {
    let mut scanned = 0;
    while scanned < N {
        scanned += set.iter().len().max(1);
    }
}

fn main() {
    let set = ConcurrentSet::new(usize::MAX - 1, usize::MAX).unwrap();

    let before = Instant::now();
    scope(|s| {
        let mut handles = vec![];

        for i in 0..WRITERS {
            let min = i * WRITER_N;
            let max = (i + 1) * WRITER_N;
            let set = set.clone();
            let handle = s.spawn(move || writer(set, min, max));
            handles.push(handle);
        }

        for _ in 0..READERS {
            let set = set.clone();
            let handle = s.spawn(move || reader(set));
            handles.push(handle);
        }
    });

    let elapsed = before.elapsed();
    let ops = 2 * N;

    assert!(set.is_empty());

    println!(
        "{} total updates in {:?}, {} updates per second",
        ops,
        elapsed,
        (ops * 1000) / elapsed.as_millis().max(1) as usize
    );
}
