//! The reducer lookup fast path.

use std::ptr::NonNull;

use crate::error::ReducerBug;
use crate::fatal::fatal;
use crate::hyperobject::HyperobjectBase;
use crate::map::{Elem, ViewStorage};
use crate::worker::{current_worker, Worker, WorkerGuard};

/// The calling strand's view of the reducer described by `hb`.
///
/// Outside any worker this is the leftmost view and no map is touched.
pub fn hyper_lookup(hb: &HyperobjectBase) -> NonNull<u8> {
    match current_worker() {
        // SAFETY: the current worker is bound to this thread.
        Some(w) => unsafe { lookup_with(&w, hb) },
        None => hb.key().leftmost_view(),
    }
}

/// [`hyper_lookup`] on the worker held by `guard`.
pub fn lookup_in(guard: &WorkerGuard<'_>, hb: &HyperobjectBase) -> NonNull<u8> {
    // SAFETY: the guard proves the binding.
    unsafe { lookup_with(guard.worker(), hb) }
}

/// # Safety
/// The calling thread must be bound to `w`.
pub(crate) unsafe fn lookup_with(w: &Worker, hb: &HyperobjectBase) -> NonNull<u8> {
    if w.force_reduce() {
        w.promote_own_deque();
    }

    let map = w.reducer_map_or_install();
    if map.is_merging() {
        fatal(Some(w), ReducerBug::HyperobjectInUse);
    }
    map.admit(Some(w), hb);

    let key = hb.key();
    if let Some(slot) = map.find(key, hb) {
        return match map.elem(slot).view() {
            Some(view) => view,
            None => fatal(Some(w), ReducerBug::MapCorrupted("element without a view")),
        };
    }

    let view = if map.is_leftmost() {
        key.leftmost_view()
    } else {
        let view = hb.allocate();
        hb.identity(view);
        view
    };

    // The callbacks above may have touched the worker's map.
    let map = w.reducer_map_or_install();
    map.insert(Some(w), Elem::new(key, NonNull::from(hb), view));
    log::trace!("worker {}: new view for reducer {}", w.id(), key);
    view
}
