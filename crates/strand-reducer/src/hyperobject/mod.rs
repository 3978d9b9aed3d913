//! Hyperobject descriptors and reducer identity.
//!
//! A reducer is described by a [`HyperobjectBase`], owned by whoever created
//! the reducer. The descriptor sits at a fixed offset from the reducer's
//! leftmost view; the address of that view is the reducer's [`ReducerKey`].
//! Reducer maps only ever borrow descriptors: a descriptor must outlive every
//! map element that refers to it, which holds as long as the reducer is
//! unregistered after the final sync.

mod typed;

use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use slab::Slab;

use crate::error::ReducerBug;
use crate::fatal::fatal;

pub use typed::{Monoid, Reducer};

/// Identity of a reducer within a reducer map.
///
/// The key is the address of the reducer's leftmost view. An element whose
/// view equals its key is the leftmost element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ReducerKey(NonZeroUsize);

impl ReducerKey {
    /// The key of the reducer described by `hb`.
    pub fn of(hb: &HyperobjectBase) -> Self {
        let addr = (hb as *const HyperobjectBase as usize).wrapping_add(hb.view_offset);
        match NonZeroUsize::new(addr) {
            Some(addr) => Self(addr),
            None => fatal(None, ReducerBug::MapCorrupted("reducer key wrapped to null")),
        }
    }

    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// The leftmost view, which lives at the key's address.
    pub fn leftmost_view(self) -> NonNull<u8> {
        // SAFETY: the key is non-zero.
        unsafe { NonNull::new_unchecked(self.0.get() as *mut u8) }
    }
}

impl fmt::Display for ReducerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A small integer naming a registered reducer.
///
/// Issued when the reducer is registered and released when it is
/// unregistered; indexes the sparse-array map strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReducerId(u32);

impl ReducerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const ID_VALID: u32 = 1 << 31;

static REDUCER_IDS: Lazy<Mutex<Slab<()>>> = Lazy::new(|| Mutex::new(Slab::new()));

/// Allocates storage for one view of `view_size` bytes.
pub type AllocateFn = unsafe fn(hb: &HyperobjectBase, view_size: usize) -> NonNull<u8>;
/// Initializes `view` to the monoid's identity.
pub type IdentityFn = unsafe fn(hb: &HyperobjectBase, view: NonNull<u8>);
/// Folds `right` into `left`. `right` is released afterwards without being
/// read again.
pub type ReduceFn = unsafe fn(hb: &HyperobjectBase, left: NonNull<u8>, right: NonNull<u8>);
/// Destroys and frees a view produced by the allocate callback.
pub type DeallocateFn = unsafe fn(hb: &HyperobjectBase, view: NonNull<u8>);

/// The callbacks describing a reducer's monoid and view storage.
#[derive(Clone, Copy)]
pub struct MonoidFns {
    pub allocate: AllocateFn,
    pub identity: IdentityFn,
    pub reduce: ReduceFn,
    pub deallocate: DeallocateFn,
}

impl fmt::Debug for MonoidFns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonoidFns").finish_non_exhaustive()
    }
}

/// Descriptor of a reducer.
#[repr(C)]
pub struct HyperobjectBase {
    monoid: MonoidFns,
    id: AtomicU32,
    view_offset: usize,
    view_size: usize,
}

impl HyperobjectBase {
    /// Creates a descriptor whose leftmost view sits `view_offset` bytes past
    /// the descriptor itself.
    pub const fn new(monoid: MonoidFns, view_offset: usize, view_size: usize) -> Self {
        Self {
            monoid,
            id: AtomicU32::new(0),
            view_offset,
            view_size,
        }
    }

    pub fn monoid(&self) -> &MonoidFns {
        &self.monoid
    }

    pub fn view_offset(&self) -> usize {
        self.view_offset
    }

    pub fn view_size(&self) -> usize {
        self.view_size
    }

    pub(crate) fn set_view_offset(&mut self, view_offset: usize) {
        self.view_offset = view_offset;
    }

    pub fn key(&self) -> ReducerKey {
        ReducerKey::of(self)
    }

    /// The registration id, if the reducer is registered.
    pub fn id(&self) -> Option<ReducerId> {
        let raw = self.id.load(Ordering::Acquire);
        (raw & ID_VALID != 0).then_some(ReducerId(raw & !ID_VALID))
    }

    /// Issues an id unless one is already held.
    pub(crate) fn register_id(&self) -> ReducerId {
        if let Some(id) = self.id() {
            return id;
        }
        let mut ids = REDUCER_IDS.lock();
        if let Some(id) = self.id() {
            return id;
        }
        let raw = ids.insert(());
        if raw >= ID_VALID as usize {
            ids.remove(raw);
            drop(ids);
            fatal(None, ReducerBug::IdsExhausted);
        }
        self.id.store(raw as u32 | ID_VALID, Ordering::Release);
        ReducerId(raw as u32)
    }

    pub(crate) fn release_id(&self) {
        let raw = self.id.swap(0, Ordering::AcqRel);
        if raw & ID_VALID != 0 {
            REDUCER_IDS.lock().try_remove((raw & !ID_VALID) as usize);
        }
    }

    /// # Safety
    /// The returned storage is uninitialized until [`Self::identity`] runs.
    pub(crate) unsafe fn allocate(&self) -> NonNull<u8> {
        (self.monoid.allocate)(self, self.view_size)
    }

    pub(crate) unsafe fn identity(&self, view: NonNull<u8>) {
        (self.monoid.identity)(self, view)
    }

    pub(crate) unsafe fn reduce(&self, left: NonNull<u8>, right: NonNull<u8>) {
        (self.monoid.reduce)(self, left, right)
    }

    pub(crate) unsafe fn deallocate(&self, view: NonNull<u8>) {
        (self.monoid.deallocate)(self, view)
    }
}

impl fmt::Debug for HyperobjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperobjectBase")
            .field("key", &self.key())
            .field("id", &self.id())
            .field("view_size", &self.view_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Sum;

    #[test]
    fn test_key_is_leftmost_view_address() {
        let reducer = Reducer::new(Sum::default(), 5);
        let key = reducer.base().key();
        assert_eq!(key.leftmost_view(), reducer.leftmost_ptr().cast());
        assert_eq!(
            key.addr() - (reducer.base() as *const HyperobjectBase as usize),
            reducer.base().view_offset()
        );
    }

    #[test]
    fn test_id_lifecycle() {
        let reducer = Reducer::new(Sum::default(), 0);
        let hb = reducer.base();
        assert_eq!(hb.id(), None);

        let id = hb.register_id();
        assert_eq!(hb.id(), Some(id));
        // Idempotent while registered.
        assert_eq!(hb.register_id(), id);

        hb.release_id();
        assert_eq!(hb.id(), None);
        hb.release_id();
    }

    #[test]
    fn test_ids_are_distinct_while_registered() {
        let a = Reducer::new(Sum::default(), 0);
        let b = Reducer::new(Sum::default(), 0);
        let ia = a.base().register_id();
        let ib = b.base().register_id();
        assert_ne!(ia, ib);
        a.base().release_id();
        b.base().release_id();
    }

    #[test]
    fn test_from_addr() {
        assert_eq!(ReducerKey::from_addr(0), None);
        assert_eq!(ReducerKey::from_addr(0x40).map(ReducerKey::addr), Some(0x40));
    }
}
