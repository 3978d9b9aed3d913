//! Reducer maps: per-worker storage of reducer views.
//!
//! Two storage strategies implement [`ViewStorage`]:
//!
//! - [`HashReducerMap`] keys elements by the address of the reducer's
//!   leftmost view (the default).
//! - [`SpaReducerMap`] indexes a sparse array by the reducer's registration
//!   id and logs touched ids for cheap iteration (feature `spa`).
//!
//! The merge engine, the lookup path and the lifecycle API are written
//! against the trait; [`ReducerMap`] names the strategy the crate was built
//! with.

pub mod elem;
pub mod hash;
pub mod spa;

pub use elem::{Bucket, Elem};
pub use hash::{hash_key, HashReducerMap, HashSlot};
pub use spa::SpaReducerMap;

use std::fmt::Debug;

use crate::hyperobject::{HyperobjectBase, ReducerKey};
use crate::worker::Worker;

/// The reducer map strategy used by workers.
#[cfg(not(feature = "spa"))]
pub type ReducerMap = HashReducerMap;

/// The reducer map strategy used by workers.
#[cfg(feature = "spa")]
pub type ReducerMap = SpaReducerMap;

/// Storage of one worker's reducer views.
///
/// Maps are boxed, owned by one worker at a time and handed over whole at
/// merges. Every allocating operation takes the worker whose pool to use;
/// `None` means the context-less global pool and is only valid for a map
/// made with `None`.
pub trait ViewStorage: Send + Sized {
    /// Position of an element. Invalidated by inserts and removals.
    type Slot: Copy + Debug;

    fn make(w: Option<&Worker>) -> Box<Self>;

    /// Destroys the map, deallocating every non-leftmost view it still holds.
    fn destroy(self: Box<Self>, w: Option<&Worker>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_leftmost(&self) -> bool;
    fn set_leftmost(&mut self, leftmost: bool);
    fn is_merging(&self) -> bool;
    fn set_merging(&mut self, merging: bool);

    /// Fails fast if `hb` cannot be stored in this kind of map.
    fn admit(&self, _w: Option<&Worker>, _hb: &HyperobjectBase) {}

    fn find(&self, key: ReducerKey, hb: &HyperobjectBase) -> Option<Self::Slot>;
    fn elem(&self, slot: Self::Slot) -> &Elem;
    fn elem_mut(&mut self, slot: Self::Slot) -> &mut Elem;

    /// Inserts an element whose key is not yet present, growing as needed.
    fn insert(&mut self, w: Option<&Worker>, elem: Elem) -> Self::Slot;

    /// Removes an element without touching its view.
    fn remove(&mut self, slot: Self::Slot);

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Elem));

    /// Debug consistency check; fatal on corruption.
    fn check(&self, allow_null_view: bool);
}
