use std::alloc;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// An error type for tensor allocator operations.
#[derive(Debug, Error, PartialEq)]
pub enum TensorAllocatorError {
    /// The requested size/alignment combination is not a valid layout.
    #[error("Invalid tensor layout {0}")]
    LayoutError(core::alloc::LayoutError),

    /// The allocator could not satisfy the request.
    #[error("Null pointer")]
    NullPointer,
}

/// A capability for allocating and deallocating tensor memory.
///
/// Two allocator roles exist at the operator boundary: the *blob* allocator
/// for tensors that outlive one operator call (graph outputs) and the
/// *workspace* allocator for scratch tensors confined to one call. Both are
/// injected through [`Arc<dyn TensorAllocator>`]; the core never constructs
/// its own allocator beyond the [`CpuAllocator`] default.
///
/// Allocated memory must be zero-initialized: tensor creation hands the
/// block to safe slices directly.
pub trait TensorAllocator: Send + Sync {
    /// Allocates zeroed memory for a tensor with the given layout.
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, TensorAllocatorError>;

    /// Deallocates memory previously returned by [`TensorAllocator::alloc`].
    fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A tensor allocator backed by the system allocator.
#[derive(Clone, Default)]
pub struct CpuAllocator;

impl TensorAllocator for CpuAllocator {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, TensorAllocatorError> {
        // SAFETY: layout has non-zero size by construction in TensorStorage.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(TensorAllocatorError::NullPointer)
    }

    fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: ptr was obtained from alloc_zeroed with the same layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Returns a shared handle to the default CPU allocator.
pub fn cpu_allocator() -> Arc<dyn TensorAllocator> {
    Arc::new(CpuAllocator)
}
