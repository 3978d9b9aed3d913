//! Strand-Reducer: reducer hyperobjects for a fork-join runtime
//!
//! A reducer lets parallel strands accumulate into one logical object
//! without locks. Each strand that touches a reducer gets a private view;
//! views are folded together with the reducer's monoid when strands sync, in
//! the order a serial execution would have produced them.
//!
//! # Architecture
//!
//! - [`HyperobjectBase`]: the descriptor of a reducer. Its [`ReducerKey`] is
//!   the address of the leftmost view. [`Reducer`] is the typed wrapper over a
//!   [`Monoid`].
//! - [`ReducerMap`]: a worker's key→view registry. The default strategy is a
//!   power-of-two hash table ([`HashReducerMap`]); the `spa` feature selects a
//!   sparse array indexed by registration id ([`SpaReducerMap`]).
//! - [`merge`] / [`merge_two_maps`]: destructive merging of two maps at a
//!   sync point.
//! - [`hyper_lookup`]: the per-access fast path.
//! - [`hyper_create`] / [`hyper_destroy`]: registration of leftmost views.
//! - [`Runtime`] / [`Worker`]: the workers maps belong to, and the
//!   thread-local binding that makes one of them current.
//!
//! # Thread Safety
//!
//! Reducer maps carry no locks. A map belongs to exactly one worker at a
//! time and only the thread bound to that worker touches it; maps change
//! hands whole, at merges. A map's `merging` flag turns a reducer touched
//! from two strands without an intervening sync into an immediate fatal
//! error instead of silent corruption.
//!
//! # Errors
//!
//! Misuse of the reducer API is never recoverable: it is reported through
//! [`fatal::fatal`], which aborts. Runtime construction returns
//! [`RuntimeError`].
//!
//! # Usage
//!
//! ```rust
//! use strand_reducer::{merge_two_maps, Monoid, Options, Reducer, Runtime};
//! use std::sync::Arc;
//!
//! struct Concat;
//!
//! impl Monoid for Concat {
//!     type View = String;
//!     fn identity(&self) -> String { String::new() }
//!     fn reduce(&self, left: &mut String, right: &mut String) { left.push_str(right); }
//! }
//!
//! let rt = Runtime::new(Options { nworkers: 1, force_reduce: false }).unwrap();
//! let mut guard = rt.enter(0).unwrap();
//! let mut text = Reducer::new(Concat, String::new());
//! text.register_in(&guard);
//!
//! // The parent strand appends through the leftmost view.
//! text.update_in(&guard, |s| s.push_str("fork"));
//! let parent = guard.take_reducer_map();
//!
//! // A stolen child strand starts from an empty map and gets a fresh view.
//! text.update_in(&guard, |s| s.push_str("-join"));
//! let child = guard.take_reducer_map();
//!
//! // At the sync the child's map is folded into the parent's.
//! let mut w = Arc::clone(guard.worker());
//! let merged = merge_two_maps(&mut w, parent, child);
//! guard.set_reducer_map(merged);
//!
//! text.unregister_in(&guard);
//! drop(guard);
//! assert_eq!(text.as_mut().leftmost_mut().as_str(), "fork-join");
//! ```

pub mod config;
pub mod error;
pub mod fatal;
pub mod hyperobject;
pub mod lifecycle;
pub mod lookup;
pub mod map;
pub mod merge;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Options;
pub use error::{ConfigError, ReducerBug, RuntimeError};
pub use hyperobject::{
    AllocateFn, DeallocateFn, HyperobjectBase, IdentityFn, Monoid, MonoidFns, ReduceFn, Reducer,
    ReducerId, ReducerKey,
};
pub use lifecycle::{
    create_in, destroy_in, hyper_alloc, hyper_create, hyper_dealloc, hyper_destroy,
    install_new_reducer_map, noop_destroy, set_leftmost_reducer_map,
};
pub use lookup::{hyper_lookup, lookup_in};
pub use map::{Elem, HashReducerMap, ReducerMap, SpaReducerMap, ViewStorage};
pub use merge::{merge, merge_two_maps, MergeKind};
pub use worker::{current_worker, default_runtime, DequeHook, Runtime, Worker, WorkerGuard, WorkerId};
