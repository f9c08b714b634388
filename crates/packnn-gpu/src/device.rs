//! Compute device capability.
//!
//! The backend is injected behind object-safe traits so operator code never
//! touches a driver API directly. A device turns a [`PipelineSpec`] into a
//! compiled pipeline; a pipeline is dispatched with bound buffers, push
//! constants and a workgroup count.

use thiserror::Error;

/// Errors from the compute backend.
#[derive(Error, Debug)]
pub enum GpuError {
    /// The named shader is not available on this device.
    #[error("unknown shader {0:?}")]
    UnknownShader(String),

    /// Pipeline creation failed.
    #[error("pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A bound buffer does not match the dispatch footprint.
    #[error("binding {binding} holds {actual} bytes, dispatch needs {expected}")]
    BindingSize {
        /// Binding slot.
        binding: usize,
        /// Bytes required.
        expected: usize,
        /// Bytes bound.
        actual: usize,
    },

    /// The dispatch itself failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// A scalar specialization constant baked into a pipeline at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecConstant {
    /// 32-bit float constant.
    F32(f32),
    /// 32-bit unsigned constant.
    U32(u32),
}

/// Everything a device needs to compile one compute pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    /// Shader entry name, e.g. `"relu"` or `"relu_pack4"`.
    pub shader: String,
    /// Workgroup local size.
    pub local_size: [u32; 3],
    /// Specialization constants, in binding order.
    pub specializations: Vec<SpecConstant>,
}

/// Buffers bound to one dispatch: a read-only input and a write-only output.
pub struct Bindings<'a> {
    /// Binding 0, read-only.
    pub input: &'a [u8],
    /// Binding 1, write-only.
    pub output: &'a mut [u8],
}

/// A compiled compute pipeline.
pub trait ComputePipeline {
    /// Issues one dispatch of `group_count` workgroups.
    fn dispatch(
        &self,
        bindings: Bindings<'_>,
        push_constants: &[u32],
        group_count: [u32; 3],
    ) -> Result<(), GpuError>;
}

/// A compute-capable device.
pub trait ComputeDevice {
    /// The hardware subgroup width, for workgroup sizing.
    fn subgroup_size(&self) -> u32;

    /// Compiles a pipeline from `spec`.
    fn create_pipeline(&self, spec: &PipelineSpec) -> Result<Box<dyn ComputePipeline>, GpuError>;
}
