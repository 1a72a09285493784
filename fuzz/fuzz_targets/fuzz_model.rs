#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate concurrent_set;

use arbitrary::Arbitrary;

const KEYSPACE: u16 = 255;

#[derive(Debug)]
enum Op {
    Insert { key: u16 },
    Remove { key: u16 },
    Contains { key: u16 },
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(match u.int_in_range(0..=2).unwrap_or(0) {
            0 => Op::Insert {
                key: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
            },
            1 => Op::Remove {
                key: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
            },
            _ => Op::Contains {
                key: u.int_in_range(0..=KEYSPACE).unwrap_or(0),
            },
        })
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let set = concurrent_set::ConcurrentSet::<u16>::new(u16::MAX - 1, u16::MAX).unwrap();
    let mut model = std::collections::BTreeSet::new();

    for op in ops {
        match op {
            Op::Insert { key } => {
                assert_eq!(set.insert(key), Ok(model.insert(key)));
            }
            Op::Remove { key } => {
                assert_eq!(set.remove(&key), Ok(model.remove(&key)));
            }
            Op::Contains { key } => {
                assert_eq!(set.contains(&key), Ok(model.contains(&key)));
            }
        };

        let snapshot: Vec<u16> = set.iter().collect();
        let expected: Vec<u16> = model.iter().copied().collect();
        assert_eq!(snapshot, expected);
    }
});
