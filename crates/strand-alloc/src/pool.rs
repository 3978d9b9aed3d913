use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;

use crate::ContextId;

/// Alignment of every block handed out by a pool (one cache line).
pub const BLOCK_ALIGN: usize = 64;
/// Smallest size class.
pub const MIN_CLASS: usize = 64;
/// Largest cached size class. Bigger requests bypass the free lists.
pub const MAX_CLASS: usize = 2048;

const NUM_CLASSES: usize = (MAX_CLASS.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize + 1;

/// What a block is used for. Outstanding bytes are tracked per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemTag {
    /// Reducer map headers, bucket arrays and buckets.
    ReducerMap,
    /// Reducer views allocated on a lookup miss.
    ReducerView,
}

impl MemTag {
    const COUNT: usize = 2;

    fn index(self) -> usize {
        self as usize
    }
}

/// Rounds a request up to the size the pool will actually hand out.
pub fn round_up(size: usize) -> usize {
    if size < MIN_CLASS {
        MIN_CLASS
    } else if size < MAX_CLASS {
        size.next_power_of_two()
    } else {
        size
    }
}

fn class_index(rounded: usize) -> Option<usize> {
    (rounded <= MAX_CLASS)
        .then(|| (rounded.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize)
}

fn block_layout(rounded: usize) -> Layout {
    match Layout::from_size_align(rounded, BLOCK_ALIGN) {
        Ok(layout) => layout,
        Err(_) => panic!("pool request of {rounded} bytes overflows the address space"),
    }
}

/// A cached free block.
struct Block(NonNull<u8>);

// SAFETY: a block on a free list is owned by the list alone.
unsafe impl Send for Block {}

/// A size-classed block pool.
///
/// # Thread Safety
///
/// All operations take `&self`. Free lists are `SegQueue`s, so a worker may
/// free into a sibling worker's pool while that worker allocates from it.
pub struct Pool {
    ctx: Option<ContextId>,
    free_lists: [SegQueue<Block>; NUM_CLASSES],
    outstanding: [AtomicIsize; MemTag::COUNT],
}

impl Pool {
    /// Creates an empty pool bound to `ctx`.
    pub fn new(ctx: Option<ContextId>) -> Self {
        Self {
            ctx,
            free_lists: std::array::from_fn(|_| SegQueue::new()),
            outstanding: std::array::from_fn(|_| AtomicIsize::new(0)),
        }
    }

    pub fn context(&self) -> Option<ContextId> {
        self.ctx
    }

    /// Allocates a block of at least `size` bytes, aligned to [`BLOCK_ALIGN`].
    ///
    /// The contents of the block are unspecified.
    pub fn alloc(&self, size: usize, tag: MemTag) -> NonNull<u8> {
        let rounded = round_up(size);
        self.outstanding[tag.index()].fetch_add(rounded as isize, Ordering::Relaxed);

        if let Some(class) = class_index(rounded) {
            if let Some(Block(ptr)) = self.free_lists[class].pop() {
                return ptr;
            }
        }

        let layout = block_layout(rounded);
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    /// Returns a block to the pool.
    ///
    /// # Safety
    /// `ptr` must come from [`Pool::alloc`] on a pool of the same context,
    /// called with a `size` that rounds to the same class, and must not be
    /// used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, tag: MemTag) {
        let rounded = round_up(size);
        self.outstanding[tag.index()].fetch_sub(rounded as isize, Ordering::Relaxed);

        match class_index(rounded) {
            Some(class) => self.free_lists[class].push(Block(ptr)),
            None => alloc::dealloc(ptr.as_ptr(), block_layout(rounded)),
        }
    }

    /// Bytes allocated under `tag` and not yet freed through this pool.
    ///
    /// Blocks allocated here and freed into a sibling pool make the two
    /// counters drift in opposite directions; sum across a context to get a
    /// meaningful figure.
    pub fn outstanding(&self, tag: MemTag) -> isize {
        self.outstanding[tag.index()].load(Ordering::Relaxed)
    }

    /// Number of blocks sitting on the free lists.
    pub fn cached_blocks(&self) -> usize {
        self.free_lists.iter().map(SegQueue::len).sum()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let mut released = 0usize;
        for (class, list) in self.free_lists.iter().enumerate() {
            let layout = block_layout(MIN_CLASS << class);
            while let Some(Block(ptr)) = list.pop() {
                // SAFETY: cached blocks were allocated with exactly this layout.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                released += 1;
            }
        }
        if released > 0 {
            log::trace!("pool {:?} released {} cached blocks", self.ctx, released);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("ctx", &self.ctx)
            .field("cached_blocks", &self.cached_blocks())
            .field("maps", &self.outstanding(MemTag::ReducerMap))
            .field("views", &self.outstanding(MemTag::ReducerView))
            .finish()
    }
}

static GLOBAL: Lazy<Pool> = Lazy::new(|| Pool::new(None));

/// The process-wide pool with no context.
pub fn global() -> &'static Pool {
    &GLOBAL
}
