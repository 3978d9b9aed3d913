//! Strand-Alloc: worker-scoped memory pools for the strand runtime.
//!
//! Every worker of a strand runtime owns a [`Pool`]. Reducer maps, their
//! buckets and the views they hold are carved out of these pools, so the hot
//! paths of the reducer subsystem never go back to the system allocator once
//! a worker has warmed up.
//!
//! # Size Classes
//!
//! Requests are rounded with [`round_up`]:
//!
//! ```text
//! size < 64          -> 64
//! 64 <= size < 2048  -> next power of two
//! size >= 2048       -> size (served directly by the system allocator)
//! ```
//!
//! Blocks in the six classes `64, 128, ..., 2048` are cached on lock-free
//! free lists and reused. Every block is aligned to [`BLOCK_ALIGN`].
//!
//! # Contexts
//!
//! Pools belonging to the same runtime share a [`ContextId`]. Structures that
//! remember the context they were created in can refuse to be resized or
//! freed through a pool of a different runtime. A process-wide pool without
//! a context ([`global`]) serves teardown paths that run with no worker.
//!
//! # Thread Safety
//!
//! A [`Pool`] is `Sync`: a block allocated from one pool may be returned to
//! any other pool of the same context, which is what happens when a view
//! migrates between workers during a merge.

mod context;
mod pool;
mod raw;

pub use context::ContextId;
pub use pool::{global, round_up, MemTag, Pool, BLOCK_ALIGN, MAX_CLASS, MIN_CLASS};
pub use raw::RawSlice;
