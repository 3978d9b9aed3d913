//! The sparse-array reducer map.
//!
//! Views live in `vinfo[id]`, where `id` is the reducer's registration id.
//! Lookups are a bounds check and an index. Iteration would have to scan the
//! whole array, so inserted ids are also appended to a small log; merges and
//! teardown walk the log instead. Once the log overflows the map falls back
//! to scanning.

use std::fmt;

use strand_alloc::{ContextId, MemTag, Pool, RawSlice};

use super::elem::Elem;
use super::ViewStorage;
use crate::error::ReducerBug;
use crate::fatal::{fatal, rt_assert};
use crate::hyperobject::{HyperobjectBase, ReducerId, ReducerKey};
use crate::worker::{pool_for, with_teardown_worker, Worker};

const INITIAL_CAPACITY: usize = 16;
const LOG_CAPACITY: usize = 32;

pub struct SpaReducerMap {
    ctx: Option<ContextId>,
    vinfo: RawSlice<Elem>,
    nelem: usize,
    touched: RawSlice<u32>,
    ntouched: usize,
    overflowed: bool,
    merging: bool,
    is_leftmost: bool,
}

// SAFETY: see `HashReducerMap`.
unsafe impl Send for SpaReducerMap {}

impl SpaReducerMap {
    pub fn capacity(&self) -> usize {
        self.vinfo.len()
    }

    /// Whether iteration has fallen back to scanning the whole array.
    pub fn log_overflowed(&self) -> bool {
        self.overflowed
    }

    fn check_context(&self, w: Option<&Worker>) {
        if w.map(Worker::context) != self.ctx {
            fatal(w, ReducerBug::PoolContextMismatch);
        }
    }

    fn id_of(w: Option<&Worker>, elem: &Elem) -> ReducerId {
        // SAFETY: descriptors outlive their elements.
        let id = elem.hb.and_then(|hb| unsafe { hb.as_ref() }.id());
        match id {
            Some(id) => id,
            None => fatal(w, ReducerBug::InvalidReducerId),
        }
    }

    fn reserve(&mut self, pool: &Pool, id: ReducerId) {
        if id.index() < self.capacity() {
            return;
        }
        let capacity = (id.index() + 1).next_power_of_two().max(2 * self.capacity());
        let mut grown = RawSlice::alloc_filled(pool, capacity, Elem::EMPTY, MemTag::ReducerMap);
        grown.as_mut_slice()[..self.capacity()].copy_from_slice(self.vinfo.as_slice());
        let old = std::mem::replace(&mut self.vinfo, grown);
        log::debug!("sparse reducer map grown: {} -> {} slots", old.len(), capacity);
        // SAFETY: the old array has been copied and is unreachable.
        unsafe { old.free(pool, MemTag::ReducerMap) };
    }

    fn log_touch(&mut self, id: ReducerId) {
        if self.overflowed {
            return;
        }
        if self.ntouched == LOG_CAPACITY {
            log::trace!("sparse reducer map log overflowed");
            self.overflowed = true;
            return;
        }
        self.touched.as_mut_slice()[self.ntouched] = id.index() as u32;
        self.ntouched += 1;
    }

    fn log_forget(&mut self, id: ReducerId) {
        if self.overflowed {
            return;
        }
        let ntouched = self.ntouched;
        let log = &mut self.touched.as_mut_slice()[..ntouched];
        if let Some(pos) = log.iter().position(|&t| t as usize == id.index()) {
            log.swap(pos, ntouched - 1);
            self.ntouched -= 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Elem> + '_ {
        self.vinfo.as_slice().iter().filter(|el| !el.is_empty())
    }
}

impl ViewStorage for SpaReducerMap {
    type Slot = ReducerId;

    fn make(w: Option<&Worker>) -> Box<Self> {
        let pool = pool_for(w);
        Box::new(Self {
            ctx: w.map(Worker::context),
            vinfo: RawSlice::alloc_filled(pool, INITIAL_CAPACITY, Elem::EMPTY, MemTag::ReducerMap),
            nelem: 0,
            touched: RawSlice::alloc_filled(pool, LOG_CAPACITY, 0, MemTag::ReducerMap),
            ntouched: 0,
            overflowed: false,
            merging: false,
            is_leftmost: false,
        })
    }

    fn destroy(mut self: Box<Self>, w: Option<&Worker>) {
        self.check_context(w);
        self.check(true);
        with_teardown_worker(w, || {
            self.for_each_mut(&mut |el| {
                // SAFETY: descriptors outlive their elements; the map owns
                // every non-leftmost view.
                unsafe { el.destroy() }
            })
        });
        let pool = pool_for(w);
        // SAFETY: the map is consumed.
        unsafe {
            self.vinfo.free(pool, MemTag::ReducerMap);
            self.touched.free(pool, MemTag::ReducerMap);
        }
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

    fn admit(&self, w: Option<&Worker>, hb: &HyperobjectBase) {
        if hb.id().is_none() {
            fatal(w, ReducerBug::InvalidReducerId);
        }
    }

    fn find(&self, key: ReducerKey, hb: &HyperobjectBase) -> Option<ReducerId> {
        let id = hb.id()?;
        let el = self.vinfo.as_slice().get(id.index())?;
        let found = el.key?;
        rt_assert!(
            None,
            found == key,
            ReducerBug::MapCorrupted("reducer id holds another reducer's view")
        );
        Some(id)
    }

    fn elem(&self, slot: ReducerId) -> &Elem {
        &self.vinfo.as_slice()[slot.index()]
    }

    fn elem_mut(&mut self, slot: ReducerId) -> &mut Elem {
        &mut self.vinfo.as_mut_slice()[slot.index()]
    }

    fn insert(&mut self, w: Option<&Worker>, elem: Elem) -> ReducerId {
        self.check_context(w);
        let id = Self::id_of(w, &elem);
        self.reserve(pool_for(w), id);
        let slot = &mut self.vinfo.as_mut_slice()[id.index()];
        if !slot.is_empty() {
            fatal(w, ReducerBug::MapCorrupted("reducer id already holds a view"));
        }
        *slot = elem;
        self.nelem += 1;
        self.log_touch(id);
        id
    }

    fn remove(&mut self, slot: ReducerId) {
        self.vinfo.as_mut_slice()[slot.index()] = Elem::EMPTY;
        self.nelem -= 1;
        self.log_forget(slot);
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Elem)) {
        let vinfo = self.vinfo.as_mut_slice();
        if self.overflowed {
            vinfo.iter_mut().filter(|el| !el.is_empty()).for_each(f);
        } else {
            for &id in &self.touched.as_slice()[..self.ntouched] {
                f(&mut vinfo[id as usize]);
            }
        }
    }

    fn check(&self, allow_null_view: bool) {
        if !cfg!(debug_assertions) {
            return;
        }
        let corrupted = |what| fatal(None, ReducerBug::MapCorrupted(what));
        let mut count = 0;
        for el in self.iter() {
            if !allow_null_view && el.view.is_none() {
                corrupted("element without a view");
            }
            count += 1;
        }
        if count != self.nelem {
            corrupted("element count does not match the array");
        }
        if !self.overflowed {
            let log = &self.touched.as_slice()[..self.ntouched];
            if log.len() != self.nelem {
                corrupted("touched-id log out of step with the array");
            }
            if log.iter().any(|&id| self.vinfo.as_slice()[id as usize].is_empty()) {
                corrupted("touched-id log names an empty slot");
            }
        }
    }
}

impl fmt::Debug for SpaReducerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaReducerMap")
            .field("ctx", &self.ctx)
            .field("nelem", &self.nelem)
            .field("capacity", &self.capacity())
            .field("logged", &self.ntouched)
            .field("overflowed", &self.overflowed)
            .field("merging", &self.merging)
            .field("is_leftmost", &self.is_leftmost)
            .finish()
    }
}
