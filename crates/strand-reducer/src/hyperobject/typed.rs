use std::cell::UnsafeCell;
use std::marker::PhantomPinned;
use std::mem;
use std::pin::Pin;
use std::ptr::{self, NonNull};

use strand_alloc::BLOCK_ALIGN;

use super::{HyperobjectBase, MonoidFns};
use crate::error::ReducerBug;
use crate::fatal::fatal;
use crate::lifecycle;
use crate::lookup;
use crate::worker::WorkerGuard;

/// An associative operation with an identity, over views of type `View`.
///
/// `reduce` must be associative for the result of a parallel computation to
/// match its serial execution. It need not be commutative: the runtime
/// always passes the serially earlier view as `left`.
pub trait Monoid: Send + Sync {
    type View: Send;

    fn identity(&self) -> Self::View;

    /// Folds `right` into `left`. `right` is dropped afterwards.
    fn reduce(&self, left: &mut Self::View, right: &mut Self::View);
}

/// A reducer over monoid `M`, owning its leftmost view.
///
/// The descriptor is the first field so that callbacks handed a
/// `&HyperobjectBase` can recover the whole reducer. The reducer is pinned:
/// its address is its identity in every reducer map.
///
/// # Usage
///
/// ```rust
/// use strand_reducer::{Monoid, Options, Reducer, Runtime};
///
/// #[derive(Default)]
/// struct Sum;
///
/// impl Monoid for Sum {
///     type View = u64;
///     fn identity(&self) -> u64 { 0 }
///     fn reduce(&self, left: &mut u64, right: &mut u64) { *left += *right; }
/// }
///
/// let rt = Runtime::new(Options { nworkers: 1, force_reduce: false }).unwrap();
/// let guard = rt.enter(0).unwrap();
/// let mut total = Reducer::new(Sum, 0);
/// total.register_in(&guard);
/// total.update_in(&guard, |v| *v += 42);
/// total.unregister_in(&guard);
/// drop(guard);
/// assert_eq!(*total.as_mut().leftmost_mut(), 42);
/// ```
#[repr(C)]
pub struct Reducer<M: Monoid> {
    base: HyperobjectBase,
    monoid: M,
    leftmost: UnsafeCell<M::View>,
    _pinned: PhantomPinned,
}

// SAFETY: views are only touched by the strand that currently owns them;
// the fork-join discipline hands each strand a distinct view.
unsafe impl<M: Monoid> Sync for Reducer<M> {}

impl<M: Monoid> Reducer<M> {
    const FNS: MonoidFns = MonoidFns {
        allocate: allocate_view::<M>,
        identity: identity_view::<M>,
        reduce: reduce_views::<M>,
        deallocate: deallocate_view::<M>,
    };

    /// Creates an unregistered reducer whose leftmost view starts as `initial`.
    pub fn new(monoid: M, initial: M::View) -> Pin<Box<Self>> {
        let align = mem::align_of::<M::View>();
        if align > BLOCK_ALIGN {
            fatal(None, ReducerBug::ViewAlignment(align));
        }

        let mut boxed = Box::new(Self {
            base: HyperobjectBase::new(Self::FNS, 0, mem::size_of::<M::View>()),
            monoid,
            leftmost: UnsafeCell::new(initial),
            _pinned: PhantomPinned,
        });
        let offset = boxed.leftmost.get() as usize - &boxed.base as *const HyperobjectBase as usize;
        boxed.base.set_view_offset(offset);
        Box::into_pin(boxed)
    }

    pub fn base(&self) -> &HyperobjectBase {
        &self.base
    }

    pub fn monoid(&self) -> &M {
        &self.monoid
    }

    pub fn leftmost_ptr(&self) -> NonNull<M::View> {
        // SAFETY: `UnsafeCell::get` never returns null.
        unsafe { NonNull::new_unchecked(self.leftmost.get()) }
    }

    /// Registers the reducer with the current worker.
    pub fn register(&self) {
        lifecycle::hyper_create(&self.base);
    }

    pub fn register_in(&self, guard: &WorkerGuard<'_>) {
        lifecycle::create_in(guard, &self.base);
    }

    /// Unregisters the reducer. Must run after the final sync, from the
    /// strand that holds the leftmost view.
    pub fn unregister(&self) {
        lifecycle::hyper_destroy(&self.base);
    }

    pub fn unregister_in(&self, guard: &WorkerGuard<'_>) {
        lifecycle::destroy_in(guard, &self.base);
    }

    /// The current strand's view.
    pub fn view(&self) -> NonNull<M::View> {
        lookup::hyper_lookup(&self.base).cast()
    }

    pub fn view_in(&self, guard: &WorkerGuard<'_>) -> NonNull<M::View> {
        lookup::lookup_in(guard, &self.base).cast()
    }

    /// Runs `f` on the current strand's view.
    ///
    /// `f` must not look up this reducer again.
    pub fn update<R>(&self, f: impl FnOnce(&mut M::View) -> R) -> R {
        let view = self.view();
        // SAFETY: the view belongs to the calling strand.
        unsafe { f(&mut *view.as_ptr()) }
    }

    pub fn update_in<R>(&self, guard: &WorkerGuard<'_>, f: impl FnOnce(&mut M::View) -> R) -> R {
        let view = self.view_in(guard);
        // SAFETY: as in `update`.
        unsafe { f(&mut *view.as_ptr()) }
    }

    /// The leftmost view, for use once every strand has synced.
    pub fn leftmost_mut(self: Pin<&mut Self>) -> &mut M::View {
        // SAFETY: the view is not structurally pinned; nothing is moved.
        unsafe { self.get_unchecked_mut().leftmost.get_mut() }
    }

    /// Consumes an unregistered reducer and returns its leftmost view.
    pub fn into_value(self: Pin<Box<Self>>) -> M::View {
        if let Some(id) = self.base.id() {
            log::warn!("reducer {} ({:?}) dropped while registered", self.base.key(), id);
        }
        // SAFETY: no map may refer to an unregistered reducer, so nothing
        // observes the address after this point.
        let this = unsafe { Pin::into_inner_unchecked(self) };
        this.leftmost.into_inner()
    }
}

/// # Safety
/// `hb` must be the descriptor embedded in a `Reducer<M>`.
unsafe fn typed<M: Monoid>(hb: &HyperobjectBase) -> &Reducer<M> {
    &*(hb as *const HyperobjectBase).cast::<Reducer<M>>()
}

unsafe fn allocate_view<M: Monoid>(hb: &HyperobjectBase, view_size: usize) -> NonNull<u8> {
    debug_assert_eq!(view_size, mem::size_of::<M::View>());
    lifecycle::hyper_alloc(hb, view_size)
}

unsafe fn identity_view<M: Monoid>(hb: &HyperobjectBase, view: NonNull<u8>) {
    let value = typed::<M>(hb).monoid.identity();
    view.cast::<M::View>().as_ptr().write(value);
}

unsafe fn reduce_views<M: Monoid>(hb: &HyperobjectBase, left: NonNull<u8>, right: NonNull<u8>) {
    typed::<M>(hb).monoid.reduce(
        &mut *left.cast::<M::View>().as_ptr(),
        &mut *right.cast::<M::View>().as_ptr(),
    );
}

unsafe fn deallocate_view<M: Monoid>(hb: &HyperobjectBase, view: NonNull<u8>) {
    ptr::drop_in_place(view.cast::<M::View>().as_ptr());
    lifecycle::hyper_dealloc(hb, view);
}
