#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// compute device capability module.
pub mod device;

/// reference relu operator module.
pub mod relu;

pub use crate::device::{
    Bindings, ComputeDevice, ComputePipeline, GpuError, PipelineSpec, SpecConstant,
};
pub use crate::relu::{shape_elempack, GpuOptions, GpuRelu};
