//! The hash-table reducer map.
//!
//! Keys hash into a power-of-two array of optional [`Bucket`]s. The array
//! doubles whenever `nelem + nelem/8 + 1` would exceed the number of
//! buckets, so chains stay short: most buckets hold zero or one element.
//! All storage comes from the pool of the worker the map was made on.

use std::fmt;

use strand_alloc::{ContextId, MemTag, Pool, RawSlice};

use super::elem::{Bucket, Elem};
use super::ViewStorage;
use crate::error::ReducerBug;
use crate::fatal::{fatal, rt_assert};
use crate::hyperobject::{HyperobjectBase, ReducerKey};
use crate::worker::{pool_for, with_teardown_worker, Worker};

/// Position of an element: bucket index and slot within the bucket.
///
/// Valid until the next insert or removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSlot {
    bucket: usize,
    index: usize,
}

fn min_size(nelem: usize) -> usize {
    1 + nelem + nelem / 8
}

fn next_size(nbuckets: usize) -> usize {
    2 * nbuckets
}

/// Bucket index of `key` in a table of `nbuckets` (a power of two).
pub fn hash_key(key: ReducerKey, nbuckets: usize) -> usize {
    let mut k = key.addr();
    k ^= k >> 21;
    k ^= k >> 8;
    k ^= k >> 3;
    k & (nbuckets - 1)
}

pub struct HashReducerMap {
    ctx: Option<ContextId>,
    nelem: usize,
    buckets: RawSlice<Option<Bucket>>,
    merging: bool,
    is_leftmost: bool,
}

// SAFETY: a map is owned by exactly one worker at a time and handed over
// wholesale; the raw slices it holds are owned by the map.
unsafe impl Send for HashReducerMap {}

impl HashReducerMap {
    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the table is currently over its load threshold.
    pub fn need_rehash(&self) -> bool {
        min_size(self.nelem) > self.nbuckets()
    }

    fn check_context(&self, w: Option<&Worker>) {
        if w.map(Worker::context) != self.ctx {
            fatal(w, ReducerBug::PoolContextMismatch);
        }
    }

    fn new_buckets(pool: &Pool, nbuckets: usize) -> RawSlice<Option<Bucket>> {
        debug_assert!(nbuckets.is_power_of_two());
        RawSlice::alloc_filled(pool, nbuckets, None, MemTag::ReducerMap)
    }

    /// # Safety
    /// `buckets` must not be used afterwards.
    unsafe fn free_buckets(pool: &Pool, buckets: RawSlice<Option<Bucket>>) {
        for bucket in buckets.as_slice().iter().flatten() {
            bucket.free(pool);
        }
        buckets.free(pool, MemTag::ReducerMap);
    }

    /// Finds the element for `key`.
    pub fn lookup(&self, key: ReducerKey) -> Option<HashSlot> {
        let bucket = hash_key(key, self.nbuckets());
        let b = self.buckets.as_slice()[bucket].as_ref()?;
        let index = b.position(key)?;
        rt_assert!(
            None,
            b.live()[index].view.is_some(),
            ReducerBug::MapCorrupted("element without a view")
        );
        Some(HashSlot { bucket, index })
    }

    /// Inserts `elem` without checking the load threshold.
    ///
    /// The caller guarantees the key is not present.
    pub fn insert_no_rehash(&mut self, w: Option<&Worker>, elem: Elem) -> HashSlot {
        self.check_context(w);
        let Some(key) = elem.key else {
            fatal(w, ReducerBug::MapCorrupted("inserting an element without a key"));
        };
        let bucket = hash_key(key, self.nbuckets());
        let slots = &mut self.buckets.as_mut_slice()[bucket];
        let index = Bucket::grow(pool_for(w), slots);
        if let Some(b) = slots.as_mut() {
            *b.slot_mut(index) = elem;
        }
        self.nelem += 1;
        HashSlot { bucket, index }
    }

    /// Doubles the bucket array and redistributes every element.
    pub fn rehash(&mut self, w: Option<&Worker>) {
        self.check_context(w);
        let pool = pool_for(w);
        let old = self.buckets;
        let onelem = self.nelem;

        self.buckets = Self::new_buckets(pool, next_size(old.len()));
        self.nelem = 0;
        for bucket in old.as_slice().iter().flatten() {
            for el in bucket.live() {
                self.insert_no_rehash(w, *el);
            }
        }
        rt_assert!(w, self.nelem == onelem, ReducerBug::MapCorrupted("rehash lost elements"));
        log::debug!("reducer map rehashed: {} -> {} buckets, {} elements", old.len(), self.nbuckets(), onelem);

        // SAFETY: every element was copied out of the old array.
        unsafe { Self::free_buckets(pool, old) };
    }

    /// Inserts `elem`, growing the table first if the insert would take it
    /// over the load threshold.
    pub fn rehash_and_insert(&mut self, w: Option<&Worker>, elem: Elem) -> HashSlot {
        if min_size(self.nelem + 1) > self.nbuckets() {
            self.rehash(w);
        }
        self.insert_no_rehash(w, elem)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Elem> + '_ {
        self.buckets
            .as_slice()
            .iter()
            .flatten()
            .flat_map(|b| b.live().iter())
    }
}

impl ViewStorage for HashReducerMap {
    type Slot = HashSlot;

    fn make(w: Option<&Worker>) -> Box<Self> {
        let pool = pool_for(w);
        Box::new(Self {
            ctx: w.map(Worker::context),
            nelem: 0,
            buckets: Self::new_buckets(pool, 1),
            merging: false,
            is_leftmost: false,
        })
    }

    fn destroy(mut self: Box<Self>, w: Option<&Worker>) {
        self.check_context(w);
        self.check(true);
        with_teardown_worker(w, || {
            for bucket in self.buckets.as_mut_slice().iter_mut().flatten() {
                for el in bucket.live_mut() {
                    // SAFETY: descriptors outlive their elements; the map owns
                    // every non-leftmost view.
                    unsafe { el.destroy() };
                }
            }
        });
        // SAFETY: the map is consumed.
        unsafe { Self::free_buckets(pool_for(w), self.buckets) };
    }

    fn len(&self) -> usize {
        self.nelem
    }

    fn is_leftmost(&self) -> bool {
        self.is_leftmost
    }

    fn set_leftmost(&mut self, leftmost: bool) {
        self.is_leftmost = leftmost;
    }

    fn is_merging(&self) -> bool {
        self.merging
    }

    fn set_merging(&mut self, merging: bool) {
        self.merging = merging;
    }

    fn find(&self, key: ReducerKey, _hb: &HyperobjectBase) -> Option<HashSlot> {
        self.lookup(key)
    }

    fn elem(&self, slot: HashSlot) -> &Elem {
        match &self.buckets.as_slice()[slot.bucket] {
            Some(b) => &b.live()[slot.index],
            None => fatal(None, ReducerBug::MapCorrupted("slot in a missing bucket")),
        }
    }

    fn elem_mut(&mut self, slot: HashSlot) -> &mut Elem {
        match &mut self.buckets.as_mut_slice()[slot.bucket] {
            Some(b) => b.slot_mut(slot.index),
            None => fatal(None, ReducerBug::MapCorrupted("slot in a missing bucket")),
        }
    }

    fn insert(&mut self, w: Option<&Worker>, elem: Elem) -> HashSlot {
        self.rehash_and_insert(w, elem)
    }

    fn remove(&mut self, slot: HashSlot) {
        match &mut self.buckets.as_mut_slice()[slot.bucket] {
            Some(b) => b.remove(slot.index),
            None => fatal(None, ReducerBug::MapCorrupted("slot in a missing bucket")),
        }
        self.nelem -= 1;
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Elem)) {
        for bucket in self.buckets.as_mut_slice().iter_mut().flatten() {
            for el in bucket.live_mut() {
                f(el);
            }
        }
    }

    fn check(&self, allow_null_view: bool) {
        if !cfg!(debug_assertions) {
            return;
        }
        let corrupted = |what| fatal(None, ReducerBug::MapCorrupted(what));
        if !self.nbuckets().is_power_of_two() {
            corrupted("bucket count is not a power of two");
        }
        let mut count = 0;
        for (index, bucket) in self.buckets.as_slice().iter().enumerate() {
            let Some(b) = bucket else { continue };
            if let Err(what) = b.check() {
                corrupted(what);
            }
            for el in b.live() {
                if !allow_null_view && el.view.is_none() {
                    corrupted("element without a view");
                }
                if el.key.map(|k| hash_key(k, self.nbuckets())) != Some(index) {
                    corrupted("element in the wrong bucket");
                }
                count += 1;
            }
        }
        if count != self.nelem {
            corrupted("element count does not match the table");
        }
    }
}

impl fmt::Debug for HashReducerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashReducerMap")
            .field("ctx", &self.ctx)
            .field("nelem", &self.nelem)
            .field("nbuckets", &self.nbuckets())
            .field("merging", &self.merging)
            .field("is_leftmost", &self.is_leftmost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, runtime, Sum};
    use std::ptr::NonNull;
    use crate::Reducer;
    use proptest::prelude::*;

    /// An element with a distinct, never dereferenced view and descriptor.
    fn fake_elem(i: usize) -> Elem {
        let k = key(i);
        let view = NonNull::new((k.addr() + 8) as *mut u8).unwrap();
        let hb = NonNull::new((k.addr() + 16) as *mut HyperobjectBase).unwrap();
        Elem::new(k, hb, view)
    }

    #[test]
    fn test_hash_key_masks_to_table() {
        for n in [1, 2, 4, 64, 1024] {
            for i in 0..100 {
                assert!(hash_key(key(i), n) < n);
            }
        }
        assert_eq!(hash_key(key(3), 1), 0);
    }

    #[test]
    fn test_empty_map() {
        let rt = runtime(1);
        let w = &**rt.worker(0).unwrap();
        let map = HashReducerMap::make(Some(w));
        assert_eq!(map.nbuckets(), 1);
        assert!(map.is_empty());
        assert_eq!(map.lookup(key(1)), None);
        assert!(!map.need_rehash());
        map.destroy(Some(w));
        assert_eq!(rt.outstanding(MemTag::ReducerMap), 0);
    }

    #[test]
    fn test_insert_and_lookup() {
        let rt = runtime(1);
        let w = &**rt.worker(0).unwrap();
        let mut map = HashReducerMap::make(Some(w));
        for i in 1..=10 {
            map.rehash_and_insert(Some(w), fake_elem(i));
        }
        assert_eq!(map.len(), 10);
        for i in 1..=10 {
            let slot = map.lookup(key(i)).unwrap();
            assert_eq!(map.elem(slot).key(), Some(key(i)));
        }
        assert_eq!(map.lookup(key(11)), None);
        assert_eq!(map.iter().count(), 10);
        map.check(false);

        // Fake views must not reach a deallocate callback.
        map.for_each_mut(&mut |el| el.view = None);
        map.destroy(Some(w));
        assert_eq!(rt.outstanding(MemTag::ReducerMap), 0);
    }

    #[test]
    fn test_table_doubles_under_load() {
        let rt = runtime(1);
        let w = &**rt.worker(0).unwrap();
        let mut map = HashReducerMap::make(Some(w));
        let mut sizes = vec![map.nbuckets()];
        for i in 1..=20 {
            map.rehash_and_insert(Some(w), fake_elem(i));
            assert!(map.nbuckets().is_power_of_two());
            assert!(map.len() + map.len() / 8 + 1 <= map.nbuckets());
            if sizes.last() != Some(&map.nbuckets()) {
                sizes.push(map.nbuckets());
            }
        }
        assert_eq!(sizes, vec![1, 2, 4, 8, 16, 32]);
        map.for_each_mut(&mut |el| el.view = None);
        map.destroy(Some(w));
    }

    #[test]
    fn test_need_rehash_reports_current_state() {
        let rt = runtime(1);
        let w = &**rt.worker(0).unwrap();
        let mut map = HashReducerMap::make(Some(w));
        // One element in one bucket: 1 + 1 + 0 > 1.
        map.insert_no_rehash(Some(w), fake_elem(1));
        assert!(map.need_rehash());
        map.rehash(Some(w));
        assert_eq!(map.nbuckets(), 2);
        assert!(!map.need_rehash());
        assert!(map.lookup(key(1)).is_some());
        map.for_each_mut(&mut |el| el.view = None);
        map.destroy(Some(w));
    }

    #[test]
    fn test_remove_keeps_other_keys() {
        let rt = runtime(1);
        let w = &**rt.worker(0).unwrap();
        let mut map = HashReducerMap::make(Some(w));
        for i in 1..=8 {
            map.rehash_and_insert(Some(w), fake_elem(i));
        }
        let slot = map.lookup(key(4)).unwrap();
        map.remove(slot);
        assert_eq!(map.len(), 7);
        assert_eq!(map.lookup(key(4)), None);
        for i in (1..=8).filter(|i| *i != 4) {
            assert!(map.lookup(key(i)).is_some());
        }
        map.check(false);
        map.for_each_mut(&mut |el| el.view = None);
        map.destroy(Some(w));
    }

    #[test]
    fn test_destroy_frees_only_owned_views() {
        let rt = runtime(1);
        let guard = rt.enter(0).unwrap();
        let w = &**guard.worker();
        let reducer = Reducer::new(Sum::default(), 0);
        let hb = reducer.base();

        let mut map = HashReducerMap::make(Some(w));
        map.rehash_and_insert(Some(w), Elem::for_view(hb, hb.key().leftmost_view()));
        for i in 1..=3 {
            let view = unsafe {
                let view = hb.allocate();
                hb.identity(view);
                view
            };
            map.rehash_and_insert(Some(w), Elem::new(key(i), NonNull::from(hb), view));
        }
        assert!(rt.outstanding(MemTag::ReducerView) > 0);
        map.destroy(Some(w));
        assert_eq!(rt.outstanding(MemTag::ReducerView), 0);
        assert_eq!(rt.outstanding(MemTag::ReducerMap), 0);
    }

    #[test]
    #[should_panic(expected = "another runtime context")]
    fn test_foreign_worker_is_fatal() {
        let rt = runtime(1);
        let other = runtime(1);
        let mut map = HashReducerMap::make(rt.worker(0).map(|w| &**w));
        map.rehash_and_insert(other.worker(0).map(|w| &**w), fake_elem(1));
    }

    #[test]
    fn test_contextless_map() {
        let mut map = HashReducerMap::make(None);
        map.rehash_and_insert(None, fake_elem(1));
        map.rehash_and_insert(None, fake_elem(2));
        assert_eq!(map.len(), 2);
        map.for_each_mut(&mut |el| el.view = None);
        map.destroy(None);
    }

    proptest! {
        #[test]
        fn prop_rehash_preserves_elements(ids in proptest::collection::hash_set(1usize..100_000, 0..200)) {
            let mut map = HashReducerMap::make(None);
            for &i in &ids {
                map.rehash_and_insert(None, fake_elem(i));
                prop_assert!(map.len() + map.len() / 8 + 1 <= map.nbuckets());
            }
            prop_assert_eq!(map.len(), ids.len());
            prop_assert_eq!(map.iter().count(), ids.len());
            for &i in &ids {
                let slot = map.lookup(key(i));
                prop_assert!(slot.is_some());
                let el = map.elem(slot.unwrap());
                prop_assert_eq!(*el, fake_elem(i));
                prop_assert_eq!(el.view().map(|v| v.as_ptr() as usize), Some(key(i).addr() + 8));
                prop_assert_eq!(el.hyperobject().map(|hb| hb.as_ptr() as usize), Some(key(i).addr() + 16));
            }
            map.check(false);
            map.for_each_mut(&mut |el| el.view = None);
            map.destroy(None);
        }
    }
}
