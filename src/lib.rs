#![cfg_attr(
    test,
    deny(
        missing_docs,
        future_incompatible,
        nonstandard_style,
        rust_2018_idioms,
        missing_copy_implementations,
        trivial_casts,
        trivial_numeric_casts,
        unused_qualifications,
    )
)]
#![cfg_attr(test, deny(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::decimal_literal_representation,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::explicit_into_iter_loop,
    clippy::explicit_iter_loop,
    clippy::expl_impl_clone_on_copy,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::get_unwrap,
    clippy::if_not_else,
    clippy::inline_always,
    clippy::invalid_upcast_comparisons,
    clippy::items_after_statements,
    clippy::manual_find_map,
    clippy::map_entry,
    clippy::map_flatten,
    clippy::match_like_matches_macro,
    clippy::match_same_arms,
    clippy::maybe_infinite_iter,
    clippy::mem_forget,
    clippy::module_name_repetitions,
    clippy::multiple_inherent_impl,
    clippy::mut_mut,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_pass_by_value,
    clippy::non_ascii_literal,
    clippy::path_buf_push_overwrite,
    clippy::redundant_closure_for_method_calls,
    clippy::shadow_reuse,
    clippy::shadow_same,
    clippy::shadow_unrelated,
    clippy::single_match_else,
    clippy::string_add,
    clippy::string_add_assign,
    clippy::type_repetition_in_bounds,
    clippy::unicode_not_nfc,
    clippy::unimplemented,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding,
    clippy::wildcard_dependencies,
))]
#![cfg_attr(
    test,
    warn(
        clippy::missing_const_for_fn,
        clippy::multiple_crate_versions,
        clippy::wildcard_enum_match_arm,
    )
)]

//! A lock-free ordered set implemented as a non-blocking external binary
//! search tree, following Ellen, Fatourou, Ruppert and van Breugel's
//! "Non-blocking Binary Search Trees" (PODC 2010).
//!
//! User keys live exclusively in leaves. Internal nodes carry routing keys
//! together with a single-word update state through which in-flight
//! insertions and deletions publish their operation descriptors. A thread
//! that finds a node claimed by another operation completes ("helps") that
//! operation instead of waiting for it, so no thread ever blocks another:
//! [`ConcurrentSet::contains`] and [`ConcurrentSet::iter`] are wait-free,
//! while [`ConcurrentSet::insert`] and [`ConcurrentSet::remove`] are
//! lock-free.
//!
//! Note that this structure is `Send` but NOT `Sync`, despite being a
//! lock-free tree. This is because the inner reclamation system, provided
//! by the `ebr` crate, completely avoids atomic operations in its hot path
//! for efficiency. If you want to share a [`ConcurrentSet`] between
//! threads, simply clone it, and this will set up a new efficient
//! thread-local memory reclamation state. All clones operate on the same
//! shared tree.
//!
//! The `LOCAL_GC_BUFFER_SIZE` const generic controls the epoch-based
//! reclamation granularity. Unlinked nodes and descriptors are placed into
//! fixed-size arrays, and garbage collection only happens after such an
//! array fills up and a final timestamp is assigned to it. Lower values
//! cause unlinked memory to be dropped more quickly but with lower
//! efficiency; very high values may hold memory for longer than desired.
//!
//! Construction requires a pair of sentinel keys, each strictly greater
//! than every key that will ever be inserted. The sentinels anchor the
//! right spine of the tree so that every user key has both a parent and a
//! grandparent, which removes all empty-tree special cases from the
//! insertion and deletion protocols.
//!
//! # Examples
//!
//! ```
//! let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
//!
//! assert_eq!(set.insert(1), Ok(true));
//! assert_eq!(set.insert(1), Ok(false));
//! assert_eq!(set.contains(&1), Ok(true));
//! assert_eq!(set.remove(&1), Ok(true));
//! assert_eq!(set.remove(&1), Ok(false));
//! ```

#[cfg(feature = "serde")]
mod serde;

#[cfg(not(feature = "fault_injection"))]
#[inline]
const fn debug_delay() -> bool {
    false
}

/// This function is useful for inducing random jitter into
/// our atomic operations, shaking out more possible
/// interleavings quickly. It gets fully eliminated by the
/// compiler in non-test code.
#[cfg(feature = "fault_injection")]
fn debug_delay() -> bool {
    use std::thread;

    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();

    match rng.gen_range(0..100) {
        0..=98 => false,
        _ => {
            thread::yield_now();
            true
        }
    }
}

use std::borrow::Borrow;
use std::fmt;
use std::ptr;
use std::sync::{
    atomic::{AtomicIsize, AtomicPtr, Ordering},
    Arc,
};

#[cfg(feature = "timing")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "timing")]
use std::time::{Duration, Instant};

use ebr::{Ebr, Guard};

const CLEAN: usize = 0b00;
const IFLAG: usize = 0b01;
const DFLAG: usize = 0b10;
const MARK: usize = 0b11;
const STATE_MASK: usize = 0b11;

enum Deferred<K: 'static + Clone + Ord + Send + Sync> {
    Node(Box<Node<K>>),
    Info(Box<Info<K>>),
}

/// A single-word snapshot of an internal node's update state. The two low
/// bits of the pointer carry the state (`CLEAN`, `IFLAG`, `DFLAG`, `MARK`)
/// and the remaining bits are the address of the operation descriptor
/// associated with a non-`CLEAN` state.
struct UpdateWord<K>(*mut Info<K>);

impl<K> Clone for UpdateWord<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for UpdateWord<K> {}

impl<K> PartialEq for UpdateWord<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<K> Eq for UpdateWord<K> {}

impl<K> UpdateWord<K> {
    const fn clean() -> UpdateWord<K> {
        UpdateWord(ptr::null_mut())
    }

    fn tagged(info: *mut Info<K>, state: usize) -> UpdateWord<K> {
        // descriptor allocations are pointer-aligned, leaving the
        // two low bits free for the state
        debug_assert_eq!(info as usize & STATE_MASK, 0);
        UpdateWord((info as usize | state) as *mut Info<K>)
    }

    fn state(&self) -> usize {
        self.0 as usize & STATE_MASK
    }

    fn info(&self) -> *mut Info<K> {
        (self.0 as usize & !STATE_MASK) as *mut Info<K>
    }

    const fn raw(&self) -> *mut Info<K> {
        self.0
    }
}

/// Error returned when a key argument or a sentinel pair violates the
/// bounds that a [`ConcurrentSet`] was (or is being) constructed with.
///
/// Every key passed to [`ConcurrentSet::contains`],
/// [`ConcurrentSet::insert`] or [`ConcurrentSet::remove`] must be strictly
/// less than the first sentinel supplied at construction time, and the
/// first sentinel must itself be strictly less than the second. The error
/// is reported synchronously and no shared state is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidArgument;

impl fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("argument violates the set's sentinel key bounds")
    }
}

impl std::error::Error for InvalidArgument {}

/// A lock-free ordered set.
///
/// The set is an external binary search tree: internal nodes hold routing
/// keys only, and the present keys live in the leaves. Insertions replace
/// a leaf with a freshly allocated three-node subtree; deletions splice a
/// leaf and its parent out through the grandparent. Both operations
/// publish a descriptor into an internal node's update word via CAS before
/// touching the tree shape, which lets every other thread drive the
/// operation to completion if its owner stalls.
///
/// The two sentinel keys supplied to [`ConcurrentSet::new`] must be
/// strictly greater than every key that will be inserted. Operations on
/// keys outside that range fail with [`InvalidArgument`].
///
/// Note that this structure is `Send` but NOT `Sync`; see the crate-level
/// documentation for how to share it between threads by cloning.
///
/// # Examples
///
/// ```
/// let set = concurrent_set::ConcurrentSet::<i32>::new(i32::MAX - 1, i32::MAX).unwrap();
///
/// for key in [5, 3, 7, 1, 9] {
///     assert_eq!(set.insert(key), Ok(true));
/// }
///
/// set.remove(&5).unwrap();
///
/// let snapshot: Vec<i32> = set.iter().collect();
/// assert_eq!(snapshot, vec![1, 3, 7, 9]);
/// ```
#[derive(Clone)]
pub struct ConcurrentSet<K, const LOCAL_GC_BUFFER_SIZE: usize = 128>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    // epoch-based reclamation
    ebr: Ebr<Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    // the tree structure, separate from the reclamation
    // handle so that clones share one tree but each get
    // their own thread-local garbage state.
    inner: Arc<Inner<K>>,
}

impl<K, const LOCAL_GC_BUFFER_SIZE: usize> ConcurrentSet<K, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    /// Creates an empty `ConcurrentSet` bounded by the two sentinel keys.
    ///
    /// `sentinel1` must be strictly less than `sentinel2`, and both must be
    /// strictly greater than every key that will ever be inserted into this
    /// set. Returns [`InvalidArgument`] if the sentinels are not strictly
    /// ordered.
    ///
    /// # Examples
    /// ```
    /// use concurrent_set::ConcurrentSet;
    ///
    /// let set: ConcurrentSet<u32> = ConcurrentSet::new(u32::MAX - 1, u32::MAX).unwrap();
    /// assert!(set.is_empty());
    ///
    /// assert!(ConcurrentSet::<u32>::new(7, 7).is_err());
    /// ```
    pub fn new(sentinel1: K, sentinel2: K) -> Result<Self, InvalidArgument> {
        assert!(
            LOCAL_GC_BUFFER_SIZE > 0,
            "LOCAL_GC_BUFFER_SIZE must be greater than 0"
        );

        if sentinel1 >= sentinel2 {
            return Err(InvalidArgument);
        }

        // the initial configuration: both sentinel leaves under a root
        // routed on the larger sentinel. every user key descends left of
        // the root, so the root itself can never be flagged for deletion.
        let leaf1 = Box::into_raw(Box::new(Node::Leaf(sentinel1.clone())));
        let leaf2 = Box::into_raw(Box::new(Node::Leaf(sentinel2.clone())));
        let root = Box::into_raw(Box::new(Node::Internal(Internal::new(
            sentinel2, leaf1, leaf2,
        ))));

        Ok(ConcurrentSet {
            ebr: Ebr::default(),
            inner: Arc::new(Inner {
                root,
                sentinel1,
                len: AtomicIsize::new(0),
                #[cfg(feature = "timing")]
                slowest_op: u64::MIN.into(),
                #[cfg(feature = "timing")]
                fastest_op: u64::MAX.into(),
            }),
        })
    }

    /// Returns `true` if the set contains the specified key.
    ///
    /// This operation is wait-free: it performs a single root-to-leaf
    /// descent and never retries or helps other operations.
    ///
    /// # Examples
    /// ```
    /// let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    ///
    /// set.insert(1).unwrap();
    ///
    /// assert_eq!(set.contains(&1), Ok(true));
    /// assert_eq!(set.contains(&2), Ok(false));
    /// ```
    pub fn contains<Q>(&self, key: &Q) -> Result<bool, InvalidArgument>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.check_key(key)?;

        let mut guard = self.ebr.pin();
        let r = self.inner.search(key, &mut guard);

        Ok(unsafe { (*r.leaf).key() }.borrow() == key)
    }

    /// Adds a key to the set.
    ///
    /// Returns `Ok(true)` if the key was not already present. The new key
    /// becomes visible to all threads the moment the operation's
    /// descriptor is installed, even if this thread stalls immediately
    /// afterwards; any other thread will finish the structural work.
    ///
    /// # Examples
    /// ```
    /// let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    ///
    /// assert_eq!(set.insert(10), Ok(true));
    /// assert_eq!(set.insert(10), Ok(false));
    /// ```
    pub fn insert(&self, key: K) -> Result<bool, InvalidArgument> {
        self.check_key(&key)?;

        let mut guard = self.ebr.pin();
        Ok(self.inner.insert(key, &mut guard))
    }

    /// Removes a key from the set.
    ///
    /// Returns `Ok(true)` if the key was present.
    ///
    /// # Examples
    /// ```
    /// let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    ///
    /// assert_eq!(set.remove(&1), Ok(false));
    /// set.insert(1).unwrap();
    /// assert_eq!(set.remove(&1), Ok(true));
    /// assert_eq!(set.contains(&1), Ok(false));
    /// ```
    pub fn remove<Q>(&self, key: &Q) -> Result<bool, InvalidArgument>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.check_key(key)?;

        let mut guard = self.ebr.pin();
        Ok(self.inner.remove(key, &mut guard))
    }

    /// A **lagging**, eventually-consistent count of the keys in the set.
    ///
    /// The counter is maintained by whichever thread completes the
    /// structural step of each insertion or deletion, so reads are not
    /// linearizable with respect to in-flight operations. Once all
    /// operations quiesce it equals the actual cardinality, and it is
    /// never reported as negative.
    ///
    /// # Examples
    /// ```
    /// let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    ///
    /// set.insert(1).unwrap();
    /// set.insert(2).unwrap();
    /// assert_eq!(set.len(), 2);
    /// ```
    pub fn len(&self) -> usize {
        // a stalled increment may let its paired decrement land first,
        // so the transiently-negative window is clamped out here.
        usize::try_from(self.inner.len.load(Ordering::Relaxed).max(0)).unwrap_or(0)
    }

    /// A **lagging**, eventually-consistent check for emptiness, based on
    /// the correspondingly non-atomic [`ConcurrentSet::len`] method.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot iterator over the keys of the set, in ascending
    /// order.
    ///
    /// The snapshot is materialized when this method is called, by a
    /// wait-free in-order traversal that performs no CAS. After
    /// construction the iterator never re-reads the tree: mutations that
    /// race with the traversal may or may not be observed, but any key
    /// that is present for the whole call is always included, sentinels
    /// are never included, and in the absence of concurrent mutation the
    /// snapshot is exact.
    ///
    /// # Examples
    /// ```
    /// let set = concurrent_set::ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    ///
    /// for key in [3, 1, 2] {
    ///     set.insert(key).unwrap();
    /// }
    ///
    /// let snapshot: Vec<u64> = set.iter().collect();
    /// assert_eq!(snapshot, vec![1, 2, 3]);
    /// ```
    pub fn iter(&self) -> Iter<K> {
        let mut guard = self.ebr.pin();

        Iter {
            snapshot: self.inner.snapshot(&mut guard).into_iter(),
        }
    }

    fn check_key<Q>(&self, key: &Q) -> Result<(), InvalidArgument>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if key < self.inner.sentinel1.borrow() {
            Ok(())
        } else {
            Err(InvalidArgument)
        }
    }
}

impl<K, const LOCAL_GC_BUFFER_SIZE: usize> PartialEq for ConcurrentSet<K, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn eq(&self, other: &Self) -> bool {
        let literally_the_same = Arc::as_ptr(&self.inner) == Arc::as_ptr(&other.inner);
        if literally_the_same {
            return true;
        }

        let mut other_iter = other.iter();

        for key in self.iter() {
            if Some(key) != other_iter.next() {
                return false;
            }
        }

        other_iter.next().is_none()
    }
}

impl<K, const LOCAL_GC_BUFFER_SIZE: usize> fmt::Debug for ConcurrentSet<K, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + fmt::Debug + Clone + Ord + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConcurrentSet ")?;
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, K, const LOCAL_GC_BUFFER_SIZE: usize> IntoIterator
    for &'a ConcurrentSet<K, LOCAL_GC_BUFFER_SIZE>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    type Item = K;
    type IntoIter = Iter<K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A snapshot iterator over a [`ConcurrentSet`], created by
/// [`ConcurrentSet::iter`].
///
/// The keys were collected into an ordered sequence at construction time;
/// iterating performs no further reads of the shared tree and holds no
/// reclamation guard, so a long-lived `Iter` never delays memory reuse.
pub struct Iter<K> {
    snapshot: std::vec::IntoIter<K>,
}

impl<K> Iterator for Iter<K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.snapshot.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.snapshot.size_hint()
    }
}

impl<K> DoubleEndedIterator for Iter<K> {
    fn next_back(&mut self) -> Option<K> {
        self.snapshot.next_back()
    }
}

impl<K> ExactSizeIterator for Iter<K> {}

struct SearchResult<K> {
    grandparent: *mut Node<K>,
    parent: *mut Node<K>,
    leaf: *mut Node<K>,
    pupdate: UpdateWord<K>,
    gpupdate: UpdateWord<K>,
}

struct Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    root: *mut Node<K>,
    // user keys are strictly below this bound; the two leaves at or
    // above it are permanent and invisible to callers.
    sentinel1: K,
    len: AtomicIsize,
    #[cfg(feature = "timing")]
    slowest_op: AtomicU64,
    #[cfg(feature = "timing")]
    fastest_op: AtomicU64,
}

unsafe impl<K> Send for Inner<K> where K: 'static + Clone + Ord + Send + Sync {}
unsafe impl<K> Sync for Inner<K> where K: 'static + Clone + Ord + Send + Sync {}

impl<K> Drop for Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    fn drop(&mut self) {
        #[cfg(feature = "timing")]
        self.print_timing();

        // exclusive access: walk the reachable graph once, freeing every
        // node together with whatever descriptor is still installed on it.
        // unlinked nodes were already retired through the epoch guards.
        let mut stack: Vec<*mut Node<K>> = vec![self.root];

        while let Some(cursor) = stack.pop() {
            let node: Box<Node<K>> = unsafe { Box::from_raw(cursor) };

            if let Node::Internal(ref internal) = *node {
                stack.push(internal.left.load(Ordering::Relaxed));
                stack.push(internal.right.load(Ordering::Relaxed));

                let update = UpdateWord(internal.update.load(Ordering::Relaxed));
                if !update.info().is_null() {
                    let info: Box<Info<K>> = unsafe { Box::from_raw(update.info()) };
                    drop(info);
                }
            }
        }
    }
}

impl<K> Inner<K>
where
    K: 'static + Clone + Ord + Send + Sync,
{
    #[cfg(feature = "timing")]
    fn print_timing(&self) {
        println!(
            "min : {:?}",
            Duration::from_nanos(self.fastest_op.load(Ordering::Acquire))
        );
        println!(
            "max : {:?}",
            Duration::from_nanos(self.slowest_op.load(Ordering::Acquire))
        );
    }

    #[cfg(feature = "timing")]
    fn record_timing(&self, time: Duration) {
        let nanos = time.as_nanos() as u64;
        let min = self.fastest_op.load(Ordering::Relaxed);
        if nanos < min {
            self.fastest_op.fetch_min(nanos, Ordering::Relaxed);
        }

        let max = self.slowest_op.load(Ordering::Relaxed);
        if nanos > max {
            self.slowest_op.fetch_max(nanos, Ordering::Relaxed);
        }
    }

    /// Root-to-leaf descent. Records the last two internal nodes visited
    /// along with the update words read from them on the way down. The
    /// words may be stale by the time the caller CASes against them, in
    /// which case the CAS fails and the caller helps whatever got there
    /// first.
    fn search<Q, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        key: &Q,
        _guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) -> SearchResult<K>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        #[cfg(feature = "timing")]
        let before = Instant::now();

        let mut grandparent: *mut Node<K> = ptr::null_mut();
        let mut parent: *mut Node<K> = ptr::null_mut();
        let mut gpupdate = UpdateWord::clean();
        let mut pupdate = UpdateWord::clean();
        let mut cursor: *mut Node<K> = self.root;

        loop {
            let internal = match unsafe { &*cursor } {
                Node::Leaf(_) => break,
                Node::Internal(internal) => internal,
            };

            grandparent = parent;
            gpupdate = pupdate;
            parent = cursor;
            pupdate = internal.read_update();

            cursor = if key < internal.key.borrow() {
                internal.left.load(Ordering::Acquire)
            } else {
                internal.right.load(Ordering::Acquire)
            };
        }

        #[cfg(feature = "timing")]
        self.record_timing(before.elapsed());

        SearchResult {
            grandparent,
            parent,
            leaf: cursor,
            pupdate,
            gpupdate,
        }
    }

    fn insert<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        key: K,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool {
        loop {
            let r = self.search(&key, guard);
            let leaf_key: &K = unsafe { (*r.leaf).key() };

            if *leaf_key == key {
                return false;
            }

            if r.pupdate.state() != CLEAN {
                // the parent is claimed by another operation; finish it
                // and start over with a fresh search.
                self.help(r.pupdate, guard);
                continue;
            }

            if debug_delay() {
                continue;
            }

            // a fresh three-node subtree: the displaced leaf and the new
            // leaf in search order under an internal routed on the larger
            // of the two keys. nothing is shared until the flag CAS below.
            let new_leaf = Box::into_raw(Box::new(Node::Leaf(key.clone())));
            let sibling = Box::into_raw(Box::new(Node::Leaf(leaf_key.clone())));
            let (left, right, routing) = if key < *leaf_key {
                (new_leaf, sibling, leaf_key.clone())
            } else {
                (sibling, new_leaf, key.clone())
            };
            let new_internal = Box::into_raw(Box::new(Node::Internal(Internal::new(
                routing, left, right,
            ))));

            let info = Box::into_raw(Box::new(Info::Insert(InsertInfo {
                parent: r.parent,
                new_internal,
                old_leaf: r.leaf,
            })));

            let parent = unsafe { (*r.parent).internal() };

            match parent.cas_update(r.pupdate, UpdateWord::tagged(info, IFLAG)) {
                Ok(()) => {
                    // the insertion is linearized; retire the descriptor
                    // we displaced and finish the structural work.
                    if !r.pupdate.info().is_null() {
                        let displaced: Box<Info<K>> = unsafe { Box::from_raw(r.pupdate.info()) };
                        guard.defer_drop(Deferred::Info(displaced));
                    }
                    self.help_insert(info, guard);
                    return true;
                }
                Err(actual) => {
                    // nothing was published; reclaim the fresh allocations
                    // directly and help whoever beat us to the parent.
                    unsafe {
                        drop(Box::from_raw(info));
                        drop(Box::from_raw(new_internal));
                        drop(Box::from_raw(new_leaf));
                        drop(Box::from_raw(sibling));
                    }
                    self.help(actual, guard);
                }
            }
        }
    }

    fn remove<Q, const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        key: &Q,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        loop {
            let r = self.search(key, guard);

            if unsafe { (*r.leaf).key() }.borrow() != key {
                return false;
            }

            if r.gpupdate.state() != CLEAN {
                self.help(r.gpupdate, guard);
                continue;
            }

            if r.pupdate.state() != CLEAN {
                self.help(r.pupdate, guard);
                continue;
            }

            if debug_delay() {
                continue;
            }

            // a leaf holding a user key always sits at depth two or more,
            // because the permanent sentinel leaves cap the right spine.
            debug_assert!(!r.grandparent.is_null());
            let grandparent = unsafe { (*r.grandparent).internal() };

            let info = Box::into_raw(Box::new(Info::Delete(DeleteInfo {
                grandparent: r.grandparent,
                parent: r.parent,
                leaf: r.leaf,
                pupdate: r.pupdate,
            })));

            match grandparent.cas_update(r.gpupdate, UpdateWord::tagged(info, DFLAG)) {
                Ok(()) => {
                    if !r.gpupdate.info().is_null() {
                        let displaced: Box<Info<K>> = unsafe { Box::from_raw(r.gpupdate.info()) };
                        guard.defer_drop(Deferred::Info(displaced));
                    }
                    if self.help_delete(info, guard) {
                        return true;
                    }
                    // flagging succeeded but the mark step lost a race;
                    // the grandparent has been unflagged, so retry.
                }
                Err(actual) => {
                    unsafe {
                        drop(Box::from_raw(info));
                    }
                    self.help(actual, guard);
                }
            }
        }
    }

    /// Completes whatever operation the given update word describes.
    /// Safe to call any number of times from any thread, including after
    /// the operation has already finished: every step is a CAS that either
    /// performs the transition or observes that it has been performed.
    fn help<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        update: UpdateWord<K>,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) {
        if update.info().is_null() {
            return;
        }

        match update.state() {
            IFLAG => self.help_insert(update.info(), guard),
            DFLAG => {
                let _ = self.help_delete(update.info(), guard);
            }
            MARK => self.help_marked(update.info(), guard),
            _ => {}
        }
    }

    fn help_insert<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        info: *mut Info<K>,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) {
        let ins = unsafe { &*info }.insert_info();
        let parent = unsafe { (*ins.parent).internal() };

        // splice the new subtree over the displaced leaf. exactly one
        // helper wins this CAS and becomes responsible for retiring the
        // leaf and bumping the counter.
        if parent.cas_child(ins.old_leaf, ins.new_internal) {
            self.len.fetch_add(1, Ordering::Relaxed);

            let unlinked: Box<Node<K>> = unsafe { Box::from_raw(ins.old_leaf) };
            guard.defer_drop(Deferred::Node(unlinked));
        }

        // IFLAG -> CLEAN with the descriptor identity retained, so a late
        // helper still observes which operation completed here.
        let _ = parent.cas_update(
            UpdateWord::tagged(info, IFLAG),
            UpdateWord::tagged(info, CLEAN),
        );
    }

    /// Attempts the MARK step of a deletion. Returns `true` if the
    /// deletion is (or already was) past the point of no return.
    fn help_delete<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        info: *mut Info<K>,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) -> bool {
        let del = unsafe { &*info }.delete_info();
        let parent = unsafe { (*del.parent).internal() };
        let grandparent = unsafe { (*del.grandparent).internal() };

        let mark = UpdateWord::tagged(info, MARK);

        match parent.cas_update(del.pupdate, mark) {
            Ok(()) => {
                if !del.pupdate.info().is_null() {
                    let displaced: Box<Info<K>> = unsafe { Box::from_raw(del.pupdate.info()) };
                    guard.defer_drop(Deferred::Info(displaced));
                }
                self.help_marked(info, guard);
                true
            }
            Err(actual) => {
                if actual == mark {
                    // another helper installed our mark already
                    self.help_marked(info, guard);
                    true
                } else {
                    // the parent was claimed by a different operation.
                    // finish it, then unflag the grandparent so the
                    // deletion can be retried from scratch.
                    self.help(actual, guard);
                    let _ = grandparent.cas_update(
                        UpdateWord::tagged(info, DFLAG),
                        UpdateWord::tagged(info, CLEAN),
                    );
                    false
                }
            }
        }
    }

    fn help_marked<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        info: *mut Info<K>,
        guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) {
        let del = unsafe { &*info }.delete_info();
        let parent = unsafe { (*del.parent).internal() };
        let grandparent = unsafe { (*del.grandparent).internal() };

        // the parent is marked, so its children are frozen; the sibling
        // of the doomed leaf survives the splice.
        let right = parent.right.load(Ordering::Acquire);
        let other = if right == del.leaf {
            parent.left.load(Ordering::Acquire)
        } else {
            right
        };

        // one atomic step removes both the marked parent and the leaf.
        // exactly one helper wins and retires them.
        if grandparent.cas_child(del.parent, other) {
            self.len.fetch_sub(1, Ordering::Relaxed);

            let unlinked_leaf: Box<Node<K>> = unsafe { Box::from_raw(del.leaf) };
            guard.defer_drop(Deferred::Node(unlinked_leaf));

            let unlinked_parent: Box<Node<K>> = unsafe { Box::from_raw(del.parent) };
            guard.defer_drop(Deferred::Node(unlinked_parent));
        }

        let _ = grandparent.cas_update(
            UpdateWord::tagged(info, DFLAG),
            UpdateWord::tagged(info, CLEAN),
        );
    }

    /// In-order traversal of the root's left subtree, collecting every key
    /// strictly below the sentinel bound. Performs atomic child loads but
    /// no CAS, so it cannot interfere with concurrent writers.
    fn snapshot<const LOCAL_GC_BUFFER_SIZE: usize>(
        &self,
        _guard: &mut Guard<'_, Deferred<K>, LOCAL_GC_BUFFER_SIZE>,
    ) -> Vec<K> {
        let root = unsafe { (*self.root).internal() };

        let mut keys = Vec::new();
        let mut stack: Vec<*mut Node<K>> = Vec::new();
        let mut cursor: *mut Node<K> = root.left.load(Ordering::Acquire);

        loop {
            while let Node::Internal(internal) = unsafe { &*cursor } {
                stack.push(cursor);
                cursor = internal.left.load(Ordering::Acquire);
            }

            if let Node::Leaf(key) = unsafe { &*cursor } {
                if *key < self.sentinel1 {
                    keys.push(key.clone());
                }
            }

            match stack.pop() {
                Some(internal_ptr) => {
                    cursor = unsafe { (*internal_ptr).internal() }
                        .right
                        .load(Ordering::Acquire);
                }
                None => return keys,
            }
        }
    }
}

enum Node<K> {
    Leaf(K),
    Internal(Internal<K>),
}

impl<K> Node<K> {
    const fn key(&self) -> &K {
        match self {
            Node::Leaf(key) => key,
            Node::Internal(internal) => &internal.key,
        }
    }

    fn internal(&self) -> &Internal<K> {
        match self {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => unreachable!(),
        }
    }
}

struct Internal<K> {
    // routing key: everything in the left subtree is strictly below it,
    // everything in the right subtree is at or above it.
    key: K,
    left: AtomicPtr<Node<K>>,
    right: AtomicPtr<Node<K>>,
    // the (descriptor, state) pair, packed into one word. see UpdateWord.
    update: AtomicPtr<Info<K>>,
}

impl<K> Internal<K>
where
    K: Ord,
{
    fn new(key: K, left: *mut Node<K>, right: *mut Node<K>) -> Internal<K> {
        Internal {
            key,
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
            update: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn read_update(&self) -> UpdateWord<K> {
        UpdateWord(self.update.load(Ordering::Acquire))
    }

    fn cas_update(&self, old: UpdateWord<K>, new: UpdateWord<K>) -> Result<(), UpdateWord<K>> {
        match self.update.compare_exchange(
            old.raw(),
            new.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => Err(UpdateWord(actual)),
        }
    }

    /// Replaces one child with another. The side is chosen by comparing
    /// the replacement's key against the routing key, which is the same
    /// partition the replacement's whole subtree already lives under.
    fn cas_child(&self, old: *mut Node<K>, new: *mut Node<K>) -> bool {
        let side = if unsafe { (*new).key() } < &self.key {
            &self.left
        } else {
            &self.right
        };

        side.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Info<K> {
    Insert(InsertInfo<K>),
    Delete(DeleteInfo<K>),
}

unsafe impl<K: Send> Send for Info<K> {}
unsafe impl<K: Sync> Sync for Info<K> {}

impl<K> Info<K> {
    fn insert_info(&self) -> &InsertInfo<K> {
        match self {
            Info::Insert(info) => info,
            Info::Delete(_) => unreachable!(),
        }
    }

    fn delete_info(&self) -> &DeleteInfo<K> {
        match self {
            Info::Delete(info) => info,
            Info::Insert(_) => unreachable!(),
        }
    }
}

/// Everything a helper needs to finish an insertion: splice
/// `new_internal` over `old_leaf` under `parent`, then unflag `parent`.
struct InsertInfo<K> {
    parent: *mut Node<K>,
    new_internal: *mut Node<K>,
    old_leaf: *mut Node<K>,
}

/// Everything a helper needs to finish a deletion: mark `parent` against
/// the `pupdate` word observed during the search, splice the sibling of
/// `leaf` over `parent` under `grandparent`, then unflag `grandparent`.
struct DeleteInfo<K> {
    grandparent: *mut Node<K>,
    parent: *mut Node<K>,
    leaf: *mut Node<K>,
    pupdate: UpdateWord<K>,
}

// This ensures that ConcurrentSet is Send and Clone.
const fn _test_impls() {
    const fn send<T: Send>() {}
    const fn clone<T: Clone>() {}
    send::<ConcurrentSet<usize>>();
    clone::<ConcurrentSet<usize>>();
}

#[test]
fn basic_set() {
    let set = ConcurrentSet::<i32>::new(i32::MAX - 1, i32::MAX).unwrap();

    for key in [3, 4, 5, 6, 7] {
        assert_eq!(set.insert(key), Ok(true));
    }

    assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);
    assert_eq!(set.contains(&5), Ok(true));
    assert_eq!(set.contains(&8), Ok(false));
    assert_eq!(set.len(), 5);

    let set = ConcurrentSet::<i32>::new(i32::MAX - 1, i32::MAX).unwrap();

    for key in [5, 3, 7, 1, 9] {
        assert_eq!(set.insert(key), Ok(true));
    }
    assert_eq!(set.remove(&5), Ok(true));

    assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 7, 9]);
    assert_eq!(set.contains(&5), Ok(false));
}

#[test]
fn reinsert_and_double_remove() {
    let set = ConcurrentSet::<i32>::new(i32::MAX - 1, i32::MAX).unwrap();

    assert_eq!(set.insert(10), Ok(true));
    assert_eq!(set.insert(10), Ok(false));
    assert_eq!(set.remove(&10), Ok(true));
    assert_eq!(set.remove(&10), Ok(false));
    assert_eq!(set.contains(&10), Ok(false));

    // the key is fully usable again after removal
    assert_eq!(set.insert(10), Ok(true));
    assert_eq!(set.contains(&10), Ok(true));
}

#[test]
fn drains_to_empty() {
    let set = ConcurrentSet::<i32>::new(i32::MAX - 1, i32::MAX).unwrap();

    assert_eq!(set.insert(42), Ok(true));
    assert_eq!(set.remove(&42), Ok(true));

    assert_eq!(set.iter().next(), None);
    assert_eq!(set.len(), 0);
    assert!(set.is_empty());
}

#[test]
fn invalid_arguments() {
    assert_eq!(ConcurrentSet::<u64>::new(5, 5).unwrap_err(), InvalidArgument);
    assert_eq!(ConcurrentSet::<u64>::new(9, 3).unwrap_err(), InvalidArgument);

    let set = ConcurrentSet::<u64>::new(100, 200).unwrap();

    assert_eq!(set.insert(100), Err(InvalidArgument));
    assert_eq!(set.insert(150), Err(InvalidArgument));
    assert_eq!(set.insert(200), Err(InvalidArgument));
    assert_eq!(set.contains(&100), Err(InvalidArgument));
    assert_eq!(set.remove(&250), Err(InvalidArgument));

    // nothing was mutated by the rejected calls
    assert!(set.is_empty());
    assert_eq!(set.insert(99), Ok(true));
    assert_eq!(set.contains(&99), Ok(true));
}

#[test]
fn snapshot_is_ascending_and_sentinel_free() {
    let set = ConcurrentSet::<u16>::new(u16::MAX - 1, u16::MAX).unwrap();

    for key in [909, 17, 3, 444, 21, 8, 1000, 2, 615] {
        set.insert(key).unwrap();
    }

    let snapshot: Vec<u16> = set.iter().collect();
    assert!(snapshot.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(!snapshot.contains(&(u16::MAX - 1)));
    assert!(!snapshot.contains(&u16::MAX));
    assert_eq!(snapshot.len(), 9);

    // the snapshot iterator is double-ended and exact-size
    let reversed: Vec<u16> = set.iter().rev().collect();
    assert_eq!(reversed, snapshot.iter().rev().copied().collect::<Vec<_>>());
    assert_eq!(set.iter().len(), 9);
}

#[test]
fn snapshot_equality() {
    let a = ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();
    let b = ConcurrentSet::<u64>::new(u64::MAX - 1, u64::MAX).unwrap();

    for key in [1, 2, 3] {
        a.insert(key).unwrap();
        b.insert(key).unwrap();
    }

    assert_eq!(a, b);
    assert_eq!(a, a.clone());

    b.remove(&2).unwrap();
    assert_ne!(a, b);
}

#[test]
fn borrowed_key_lookups() {
    let set =
        ConcurrentSet::<String>::new("\u{10ffff}".into(), "\u{10ffff}\u{10ffff}".into()).unwrap();

    set.insert("apple".to_string()).unwrap();
    set.insert("banana".to_string()).unwrap();

    assert_eq!(set.contains("apple"), Ok(true));
    assert_eq!(set.contains("cherry"), Ok(false));
    assert_eq!(set.remove("banana"), Ok(true));
    assert_eq!(set.contains("banana"), Ok(false));
}
