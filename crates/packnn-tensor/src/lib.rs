#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// tensor allocator capability module.
pub mod allocator;

/// refcounted storage module.
pub mod storage;

/// packed tensor container module.
pub mod tensor;

pub use crate::allocator::{cpu_allocator, CpuAllocator, TensorAllocator, TensorAllocatorError};
pub use crate::storage::TensorStorage;
pub use crate::tensor::{Tensor, TensorError, TensorShape};
