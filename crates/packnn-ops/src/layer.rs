use std::sync::Arc;

use packnn_tensor::{cpu_allocator, Tensor, TensorAllocator};

use crate::error::OpsError;

/// Per-call configuration for one operator invocation.
///
/// Read-only for the duration of the call. The blob allocator serves tensors
/// that outlive the call (graph outputs); the workspace allocator serves
/// scratch intermediates confined to the call and may be pooled by the
/// caller between calls.
#[derive(Clone)]
pub struct Options {
    /// Worker-thread budget for parallel regions; 0 uses the global pool.
    pub num_threads: usize,
    /// Allocator for final output tensors.
    pub blob_allocator: Arc<dyn TensorAllocator>,
    /// Allocator for transient scratch tensors.
    pub workspace_allocator: Arc<dyn TensorAllocator>,
    /// Whether operators may keep and produce packed (elempack > 1) layouts.
    pub use_packing_layout: bool,
    /// Half-width float storage for GPU-side tensors.
    pub use_fp16_storage: bool,
    /// Truncated bfloat16 storage.
    pub use_bf16_storage: bool,
    /// 8-bit quantized storage.
    pub use_int8_storage: bool,
    /// Allow pack-8 layouts in GPU shader dispatch.
    pub use_shader_pack8: bool,
}

impl Default for Options {
    fn default() -> Self {
        let alloc = cpu_allocator();
        Self {
            num_threads: 0,
            blob_allocator: alloc.clone(),
            workspace_allocator: alloc,
            use_packing_layout: true,
            use_fp16_storage: false,
            use_bf16_storage: false,
            use_int8_storage: false,
            use_shader_pack8: false,
        }
    }
}

impl Options {
    /// A copy of these options whose blob allocator is the workspace
    /// allocator, for scratch tensors produced by nested operator calls.
    pub fn with_workspace_as_blob(&self) -> Self {
        let mut opt = self.clone();
        opt.blob_allocator = self.workspace_allocator.clone();
        opt
    }
}

/// The contract every operator implements.
///
/// A `forward` call follows the dispatch protocol, stopping at the first
/// applicable tier:
///
/// 1. *identity* — the output equals the input and no value transform is
///    required: alias the input (refcount share) and return;
/// 2. *aligned fast path* — packed input whose offsets divide the packing
///    factor: run the specialized kernel directly on packed groups;
/// 3. *repack-and-retry* — convert the input to `elempack = 1` through the
///    workspace allocator and recurse into the generic implementation;
/// 4. *generic path* — scalar-lane implementation, always correct; the
///    numeric reference for every specialized kernel.
///
/// Allocation failures propagate immediately through `Err`; an operator call
/// either completes or fails atomically with no partial output.
pub trait Layer<T> {
    /// Operator name, for logging.
    fn name(&self) -> &'static str;

    /// Whether the operator handles packed layouts without repacking.
    fn support_packing(&self) -> bool {
        false
    }

    /// Whether the operator handles half-width float storage.
    fn support_fp16_storage(&self) -> bool {
        false
    }

    /// Whether the operator handles 8-bit quantized storage.
    fn support_int8_storage(&self) -> bool {
        false
    }

    /// Whether a GPU-backed implementation of this operator exists.
    fn support_gpu(&self) -> bool {
        false
    }

    /// Runs the operator over `inputs`, producing fresh (or aliased) outputs.
    fn forward(&self, inputs: &[Tensor<T>], opt: &Options) -> Result<Vec<Tensor<T>>, OpsError> {
        let _ = (inputs, opt);
        Err(OpsError::Unsupported(format!(
            "{} does not implement forward",
            self.name()
        )))
    }

    /// Runs the operator in place over a single tensor.
    fn forward_inplace(&self, blob: &mut Tensor<T>, opt: &Options) -> Result<(), OpsError> {
        let _ = (blob, opt);
        Err(OpsError::Unsupported(format!(
            "{} does not implement forward_inplace",
            self.name()
        )))
    }
}
