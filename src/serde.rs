use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::ConcurrentSet;

// Serialization walks the snapshot iterator, so it sees the same
// linearizable-at-construction view that callers of `iter` see.
//
// There is deliberately no `Deserialize` counterpart: reconstructing a set
// requires the caller's sentinel keys, which a deserializer has no way to
// obtain. Deserialize into a standard collection and re-insert instead.
impl<K, const LOCAL_GC_BUFFER_SIZE: usize> Serialize for ConcurrentSet<K, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Serialize + Clone + Ord + Send + Sync,
{
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(None)?;
        for key in self.iter() {
            seq.serialize_element(&key)?;
        }
        seq.end()
    }
}
