//! Map elements and hash buckets.

use std::mem;
use std::ptr::NonNull;

use strand_alloc::{round_up, MemTag, Pool, RawSlice};

use crate::hyperobject::{HyperobjectBase, ReducerKey};

/// One reducer's view as seen by one map.
///
/// The view is owned by the element unless the element is leftmost
/// (`key == view`), in which case the view is the reducer's own storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elem {
    pub(crate) key: Option<ReducerKey>,
    pub(crate) hb: Option<NonNull<HyperobjectBase>>,
    pub(crate) view: Option<NonNull<u8>>,
}

impl Elem {
    pub const EMPTY: Elem = Elem {
        key: None,
        hb: None,
        view: None,
    };

    pub fn new(key: ReducerKey, hb: NonNull<HyperobjectBase>, view: NonNull<u8>) -> Self {
        Self {
            key: Some(key),
            hb: Some(hb),
            view: Some(view),
        }
    }

    /// An element holding `view` for the reducer described by `hb`.
    pub fn for_view(hb: &HyperobjectBase, view: NonNull<u8>) -> Self {
        Self::new(hb.key(), NonNull::from(hb), view)
    }

    pub fn key(&self) -> Option<ReducerKey> {
        self.key
    }

    pub fn view(&self) -> Option<NonNull<u8>> {
        self.view
    }

    pub fn hyperobject(&self) -> Option<NonNull<HyperobjectBase>> {
        self.hb
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn is_leftmost(&self) -> bool {
        matches!((self.key, self.view), (Some(key), Some(view)) if key.leftmost_view() == view)
    }

    /// Releases the element's view unless it is the leftmost one, and clears
    /// the view pointer.
    ///
    /// # Safety
    /// The element's descriptor must still be alive and a non-leftmost view
    /// must not be referenced anywhere else.
    pub unsafe fn destroy(&mut self) {
        if let (Some(hb), Some(view)) = (self.hb, self.view) {
            if !self.is_leftmost() {
                hb.as_ref().deallocate(view);
            }
        }
        self.view = None;
    }
}

/// A hash bucket: a pool block of element slots.
///
/// Live elements form a prefix of the block. The slot after the last usable
/// one is a sentinel that always stays empty, so a scan can stop at the
/// first empty key.
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    slots: RawSlice<Elem>,
    len: usize,
}

impl Bucket {
    /// Bookkeeping charged to every bucket: the length word and the sentinel.
    pub const HEADER: usize = mem::size_of::<usize>() + mem::size_of::<Elem>();

    /// Bytes a bucket of capacity `nmax` occupies.
    pub fn byte_size(nmax: usize) -> usize {
        Self::HEADER + nmax * mem::size_of::<Elem>()
    }

    /// The capacity actually obtained when asking for `nmax` slots, once the
    /// pool has rounded the block up to its size class.
    pub fn round_up_capacity(nmax: usize) -> usize {
        (round_up(Self::byte_size(nmax)) - Self::HEADER) / mem::size_of::<Elem>()
    }

    fn alloc(pool: &Pool, nmax: usize) -> Self {
        Self {
            slots: RawSlice::alloc_filled(pool, nmax + 1, Elem::EMPTY, MemTag::ReducerMap),
            len: 0,
        }
    }

    /// # Safety
    /// No copy of this bucket may be used afterwards.
    pub(crate) unsafe fn free(self, pool: &Pool) {
        self.slots.free(pool, MemTag::ReducerMap);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn live(&self) -> &[Elem] {
        &self.slots.as_slice()[..self.len]
    }

    pub fn live_mut(&mut self) -> &mut [Elem] {
        let len = self.len;
        &mut self.slots.as_mut_slice()[..len]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Elem {
        &mut self.live_mut()[index]
    }

    pub fn position(&self, key: ReducerKey) -> Option<usize> {
        self.live().iter().position(|el| el.key == Some(key))
    }

    /// Reserves a slot in `*bucket` for a new element and returns its index.
    ///
    /// A full (or missing) bucket is replaced by one of twice the capacity,
    /// rounded up to the pool's size class.
    pub(crate) fn grow(pool: &Pool, bucket: &mut Option<Bucket>) -> usize {
        let nmax = match bucket {
            Some(b) if b.len < b.capacity() => {
                b.len += 1;
                return b.len - 1;
            }
            Some(b) => b.capacity(),
            None => 0,
        };

        let mut grown = Self::alloc(pool, Self::round_up_capacity(2 * nmax));
        if let Some(old) = bucket.take() {
            grown.slots.as_mut_slice()[..nmax].copy_from_slice(old.live());
            // SAFETY: the old bucket is no longer reachable.
            unsafe { old.free(pool) };
        }
        log::trace!("bucket grown from {} to {} slots", nmax, grown.capacity());
        grown.len = nmax + 1;
        *bucket = Some(grown);
        nmax
    }

    /// Removes the element at `index`, shifting the rest of the prefix down.
    pub(crate) fn remove(&mut self, index: usize) {
        let len = self.len;
        let slots = self.slots.as_mut_slice();
        slots.copy_within(index + 1..len, index);
        slots[len - 1] = Elem::EMPTY;
        self.len -= 1;
    }

    /// Checks the prefix and sentinel layout.
    pub(crate) fn check(&self) -> Result<(), &'static str> {
        let slots = self.slots.as_slice();
        if slots[..self.len].iter().any(Elem::is_empty) {
            return Err("empty slot inside a bucket's live prefix");
        }
        if slots[self.len..].iter().any(|el| !el.is_empty()) {
            return Err("bucket sentinel or free slot is occupied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::key;

    fn elem(i: usize) -> Elem {
        let fake = NonNull::<HyperobjectBase>::dangling();
        Elem::new(key(i), fake, NonNull::<u8>::dangling())
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_round_up_capacity() {
        assert_eq!(mem::size_of::<Elem>(), 24);
        assert_eq!(Bucket::HEADER, 32);
        assert_eq!(Bucket::round_up_capacity(0), 1);
        assert_eq!(Bucket::round_up_capacity(2), 4);
        assert_eq!(Bucket::round_up_capacity(8), 9);
        assert_eq!(Bucket::round_up_capacity(18), 20);
    }

    #[test]
    fn test_capacity_always_grows() {
        let mut nmax = 0;
        for _ in 0..12 {
            let next = Bucket::round_up_capacity(2 * nmax);
            assert!(next > nmax);
            nmax = next;
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_grow_sequence_in_one_bucket() {
        let pool = Pool::new(None);
        let mut bucket = None;
        let mut capacities = Vec::new();
        for i in 1..=5 {
            let slot = Bucket::grow(&pool, &mut bucket);
            let b = bucket.as_mut().unwrap();
            *b.slot_mut(slot) = elem(i);
            capacities.push(b.capacity());
        }
        // Growth happens on the 2nd and 5th insert.
        assert_eq!(capacities, vec![1, 4, 4, 4, 9]);

        let b = bucket.unwrap();
        let keys: Vec<_> = b.live().iter().map(|el| el.key).collect();
        assert_eq!(keys, (1..=5).map(|i| Some(key(i))).collect::<Vec<_>>());
        assert!(b.check().is_ok());
        unsafe { b.free(&pool) };
        assert_eq!(pool.outstanding(MemTag::ReducerMap), 0);
    }

    #[test]
    fn test_remove_compacts_prefix() {
        let pool = Pool::new(None);
        let mut bucket = None;
        for i in 1..=4 {
            let slot = Bucket::grow(&pool, &mut bucket);
            *bucket.as_mut().unwrap().slot_mut(slot) = elem(i);
        }
        let mut b = bucket.unwrap();
        b.remove(1);
        assert_eq!(b.len(), 3);
        assert_eq!(b.position(key(2)), None);
        assert_eq!(b.position(key(3)), Some(1));
        assert_eq!(b.position(key(4)), Some(2));
        assert!(b.check().is_ok());

        b.remove(2);
        b.remove(0);
        assert_eq!(b.live(), &[elem(3)]);
        assert!(b.check().is_ok());
        unsafe { b.free(&pool) };
    }

    #[test]
    fn test_leftmost_elem() {
        let k = key(7);
        let fake = NonNull::<HyperobjectBase>::dangling();
        assert!(Elem::new(k, fake, k.leftmost_view()).is_leftmost());
        assert!(!elem(7).is_leftmost());
        assert!(!Elem::EMPTY.is_leftmost());
        assert!(Elem::EMPTY.is_empty());
    }
}
