//! Refcounted storage for zero-copy views and cheap tensor sharing.
//!
//! A tensor assignment is a reference-count share, not a copy; crop and
//! channel-range views alias a sub-range of the parent allocation and keep
//! it alive through the shared handle.

use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use crate::allocator::{TensorAllocator, TensorAllocatorError};

/// Inner storage that owns the actual memory.
///
/// Wrapped in an `Arc` so that views with different offsets can share one
/// allocation. The allocator handle travels with the block so the injected
/// allocator that produced the memory is the one that frees it.
struct StorageImpl<T> {
    /// Pointer to the tensor memory; dangling iff `len == 0`.
    ptr: NonNull<T>,
    /// Total allocated length in elements.
    len: usize,
    /// Layout used for allocation (unused when `len == 0`).
    layout: Layout,
    /// The allocator that owns this block.
    alloc: Arc<dyn TensorAllocator>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Drop for StorageImpl<T> {
    fn drop(&mut self) {
        if self.len != 0 {
            // SAFETY: ptr and layout were created together in `new`; this is
            // the final drop, no other Arc references exist.
            if let Some(ptr) = NonNull::new(self.ptr.as_ptr() as *mut u8) {
                self.alloc.dealloc(ptr, self.layout);
            }
        }
    }
}

/// Arc-based tensor storage enabling zero-copy sub-range views.
///
/// Clones are O(1) reference-count increments. A view narrows the accessible
/// range with an element offset and length; the underlying allocation stays
/// alive until the last view drops.
pub struct TensorStorage<T> {
    inner: Arc<StorageImpl<T>>,
    /// Offset into the allocation, in elements.
    offset: usize,
    /// Number of elements accessible from this view.
    len: usize,
}

impl<T> TensorStorage<T> {
    /// Allocates zeroed storage for `len` elements through `alloc`.
    pub fn new(len: usize, alloc: Arc<dyn TensorAllocator>) -> Result<Self, TensorAllocatorError> {
        let ptr = if len == 0 {
            NonNull::dangling()
        } else {
            let layout = Layout::array::<T>(len).map_err(TensorAllocatorError::LayoutError)?;
            alloc.alloc(layout)?.cast::<T>()
        };
        let layout = Layout::array::<T>(len.max(1)).map_err(TensorAllocatorError::LayoutError)?;
        Ok(Self {
            inner: Arc::new(StorageImpl {
                ptr,
                len,
                layout,
                alloc,
                _marker: std::marker::PhantomData,
            }),
            offset: 0,
            len,
        })
    }

    /// Number of elements accessible from this view.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if this view has a length of 0.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the pointer to the first element of this view.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        // SAFETY: offset is within bounds, validated at view construction.
        unsafe { self.inner.ptr.as_ptr().add(self.offset) }
    }

    /// Returns the view data as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid for len elements starting at offset and the
        // memory was zero-initialized at allocation.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Returns the view data as a mutable slice.
    ///
    /// # Panics
    ///
    /// Panics if other views share this storage; mutation requires exclusive
    /// ownership of the allocation.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        assert!(
            self.is_unique(),
            "Cannot get mutable slice when storage is shared. Deep-clone the tensor first."
        );
        // SAFETY: ptr is valid for len elements and exclusively owned.
        unsafe { std::slice::from_raw_parts_mut(self.inner.ptr.as_ptr().add(self.offset), self.len) }
    }

    /// Returns true if this storage is uniquely owned (no other references).
    #[inline]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Returns the current offset into the allocation, in elements.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The allocator that owns the underlying block.
    #[inline]
    pub fn allocator(&self) -> Arc<dyn TensorAllocator> {
        self.inner.alloc.clone()
    }

    /// Returns true when both views alias the same allocation.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a zero-copy view of `len` elements starting `offset` elements
    /// into this view.
    pub fn view(&self, offset: usize, len: usize) -> Result<Self, TensorAllocatorError> {
        let end = self.offset + offset + len;
        if end > self.inner.len {
            return Err(TensorAllocatorError::NullPointer);
        }
        Ok(Self {
            inner: Arc::clone(&self.inner),
            offset: self.offset + offset,
            len,
        })
    }
}

// SAFETY: the storage owns its allocation; access to the data goes through
// &self / exclusive &mut self, and the allocator handle is Send + Sync.
unsafe impl<T: Send> Send for TensorStorage<T> {}
unsafe impl<T: Sync> Sync for TensorStorage<T> {}

impl<T> Clone for TensorStorage<T> {
    /// Cheap clone: increments the reference count, no data copy.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            offset: self.offset,
            len: self.len,
        }
    }
}

impl<T> std::fmt::Debug for TensorStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorStorage")
            .field("len", &self.len)
            .field("offset", &self.offset)
            .field("is_unique", &self.is_unique())
            .finish()
    }
}
