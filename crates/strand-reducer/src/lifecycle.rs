//! Reducer registration, unregistration and view storage.
//!
//! Outside a parallel region the calls here fall back to the default
//! runtime's most recently exited worker, which is bound for the duration of
//! the call.

use std::ptr::NonNull;
use std::sync::Arc;

use strand_alloc::MemTag;

use crate::error::ReducerBug;
use crate::fatal::fatal;
use crate::hyperobject::HyperobjectBase;
use crate::map::{Elem, ReducerMap, ViewStorage};
use crate::worker::{current_worker, default_runtime, view_pool, Worker, WorkerGuard};

fn with_worker<R>(f: impl FnOnce(&Worker) -> R) -> R {
    if let Some(w) = current_worker() {
        return f(&w);
    }
    let rt = default_runtime();
    let id = rt.exiting_worker().id();
    match rt.enter(id) {
        Ok(guard) => f(guard.worker()),
        Err(err) => {
            log::error!("no worker to fall back to: {}", err);
            fatal(None, ReducerBug::WorkerBusy(id))
        }
    }
}

/// Registers the reducer described by `hb` with the calling worker's map.
pub fn hyper_create(hb: &HyperobjectBase) {
    // SAFETY: `with_worker` only hands out workers bound to this thread.
    with_worker(|w| unsafe { create_with(w, hb) })
}

pub fn create_in(guard: &WorkerGuard<'_>, hb: &HyperobjectBase) {
    // SAFETY: the guard proves the binding.
    unsafe { create_with(guard.worker(), hb) }
}

/// # Safety
/// The calling thread must be bound to `w`.
pub(crate) unsafe fn create_with(w: &Worker, hb: &HyperobjectBase) {
    let map = w.reducer_map_or_install();
    if map.is_merging() {
        fatal(Some(w), ReducerBug::HyperobjectInUse);
    }
    let key = hb.key();
    if map.find(key, hb).is_some() {
        fatal(Some(w), ReducerBug::DoubleRegistration);
    }
    hb.register_id();
    map.admit(Some(w), hb);
    map.insert(Some(w), Elem::new(key, NonNull::from(hb), key.leftmost_view()));
    log::debug!("worker {}: registered reducer {} ({:?})", w.id(), key, hb.id());
}

/// Unregisters the reducer described by `hb`.
///
/// Only valid from the strand holding the leftmost view, once every strand
/// that could hold another view has synced.
pub fn hyper_destroy(hb: &HyperobjectBase) {
    // SAFETY: as in `hyper_create`.
    with_worker(|w| unsafe { destroy_with(w, hb) })
}

pub fn destroy_in(guard: &WorkerGuard<'_>, hb: &HyperobjectBase) {
    // SAFETY: the guard proves the binding.
    unsafe { destroy_with(guard.worker(), hb) }
}

/// # Safety
/// The calling thread must be bound to `w`.
pub(crate) unsafe fn destroy_with(w: &Worker, hb: &HyperobjectBase) {
    let Some(map) = w.reducer_map() else {
        fatal(Some(w), ReducerBug::UnsyncedReducer)
    };
    if map.is_merging() {
        fatal(Some(w), ReducerBug::HyperobjectInUse);
    }

    let key = hb.key();
    let Some(slot) = map.find(key, hb) else {
        fatal(Some(w), ReducerBug::UnsyncedReducer)
    };
    let el = map.elem_mut(slot);
    if !el.is_leftmost() {
        fatal(Some(w), ReducerBug::UnsyncedReducer);
    }
    el.destroy();
    map.remove(slot);
    map.check(false);
    hb.release_id();
    log::debug!("worker {}: unregistered reducer {}", w.id(), key);
}

/// Storage for one view of `hb`.
///
/// Served by the worker whose map is being torn down, else the current
/// worker, else the default runtime's exiting worker.
pub fn hyper_alloc(hb: &HyperobjectBase, bytes: usize) -> NonNull<u8> {
    let ptr = view_pool(|pool| pool.alloc(bytes, MemTag::ReducerView));
    log::trace!("allocated {} bytes for a view of reducer {}", bytes, hb.key());
    ptr
}

/// Returns storage obtained from [`hyper_alloc`].
///
/// # Safety
/// `view` must come from [`hyper_alloc`] for `hb` and must not be used
/// afterwards.
pub unsafe fn hyper_dealloc(hb: &HyperobjectBase, view: NonNull<u8>) {
    view_pool(|pool| pool.free(view, hb.view_size(), MemTag::ReducerView))
}

/// A deallocate callback for views that need no cleanup.
///
/// # Safety
/// Always safe; `unsafe` only to fit [`crate::hyperobject::DeallocateFn`].
pub unsafe fn noop_destroy(_hb: &HyperobjectBase, _view: NonNull<u8>) {}

/// Gives the guard's worker a fresh, empty map, destroying any previous one.
pub fn install_new_reducer_map<'g>(guard: &'g mut WorkerGuard<'_>) -> &'g mut ReducerMap {
    let w = Arc::clone(guard.worker());
    let fresh = ReducerMap::make(Some(&*w));
    if let Some(old) = guard.set_reducer_map(Some(fresh)) {
        log::warn!("worker {}: replacing a reducer map with {} views", w.id(), old.len());
        old.destroy(Some(&*w));
    }
    // SAFETY: the guard proves the binding and is mutably borrowed for the
    // lifetime of the result.
    unsafe { guard.worker().reducer_map_or_install() }
}

/// Marks `map` as the leftmost map, whose misses resolve to leftmost views.
pub fn set_leftmost_reducer_map<S: ViewStorage>(map: &mut S, leftmost: bool) {
    map.set_leftmost(leftmost);
}
