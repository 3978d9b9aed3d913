use std::mem;
use std::ptr::NonNull;
use std::slice;

use crate::{MemTag, Pool, BLOCK_ALIGN};

/// A fixed-length array of `T` living in a pool block.
///
/// `RawSlice` is a plain handle: it is `Copy`, it does not free itself, and
/// the owner decides when to return the block with [`RawSlice::free`]. This
/// lets containers keep handles inside other pool-backed arrays.
#[derive(Debug)]
pub struct RawSlice<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T> Clone for RawSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawSlice<T> {}

impl<T: Copy> RawSlice<T> {
    /// Bytes requested from the pool for `len` elements.
    pub fn byte_size(len: usize) -> usize {
        match len.checked_mul(mem::size_of::<T>()) {
            Some(bytes) => bytes,
            None => panic!("raw slice of {len} elements overflows the address space"),
        }
    }

    /// Allocates `len` elements from `pool`, each initialized to `fill`.
    pub fn alloc_filled(pool: &Pool, len: usize, fill: T, tag: MemTag) -> Self {
        assert!(mem::align_of::<T>() <= BLOCK_ALIGN);
        let ptr = pool.alloc(Self::byte_size(len), tag).cast::<T>();
        for i in 0..len {
            // SAFETY: the block holds at least `len` elements and is aligned.
            unsafe { ptr.as_ptr().add(i).write(fill) };
        }
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: every element was initialized by `alloc_filled`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above; `&mut self` stands in for the owner's exclusivity.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the block to `pool`.
    ///
    /// # Safety
    /// The slice must have been allocated from a pool of the same context
    /// with the same `tag`, and no copy of this handle may be used afterwards.
    pub unsafe fn free(self, pool: &Pool, tag: MemTag) {
        pool.free(self.ptr.cast(), Self::byte_size(self.len), tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_filled() {
        let pool = Pool::new(None);
        let mut slice = RawSlice::alloc_filled(&pool, 5, Some(7u64), MemTag::ReducerMap);
        assert_eq!(slice.len(), 5);
        assert!(slice.as_slice().iter().all(|v| *v == Some(7)));

        slice.as_mut_slice()[2] = None;
        let copy = slice;
        assert_eq!(copy.as_slice()[2], None);

        unsafe { slice.free(&pool, MemTag::ReducerMap) };
        assert_eq!(pool.outstanding(MemTag::ReducerMap), 0);
    }

    #[test]
    fn test_empty_slice_still_takes_a_block() {
        let pool = Pool::new(None);
        let slice = RawSlice::<u32>::alloc_filled(&pool, 0, 0, MemTag::ReducerView);
        assert_eq!(slice.len(), 0);
        assert_eq!(pool.outstanding(MemTag::ReducerView), 64);
        unsafe { slice.free(&pool, MemTag::ReducerView) };
    }
}
