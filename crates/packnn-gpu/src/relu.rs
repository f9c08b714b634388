//! Reference GPU operator: leaky ReLU.
//!
//! This is the template every GPU operator follows. Packing is decided at
//! setup time from the declared output shape alone, never from runtime data,
//! so pipeline selection is stable for the lifetime of the graph.

use log::debug;
use packnn_tensor::TensorShape;

use crate::device::{Bindings, ComputeDevice, ComputePipeline, GpuError, PipelineSpec, SpecConstant};

/// Precision and packing flags for pipeline setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuOptions {
    /// Store tensors as 16-bit floats on the device.
    pub use_fp16_storage: bool,
    /// Allow 8-lane packed shaders.
    pub use_shader_pack8: bool,
}

/// Packing factor for a declared output shape.
///
/// The packed axis is `w` for 1-D, `h` for 2-D and `c` for 3-D/4-D; 8 lanes
/// need the pack-8 flag, 4 lanes need divisibility, everything else runs
/// scalar.
pub fn shape_elempack(shape: &TensorShape, opt: &GpuOptions) -> usize {
    let n = match shape.dims {
        1 => shape.w,
        2 => shape.h,
        _ => shape.c,
    };
    if opt.use_shader_pack8 && n % 8 == 0 {
        8
    } else if n % 4 == 0 {
        4
    } else {
        1
    }
}

/// A leaky-ReLU pipeline specialized for one output shape.
pub struct GpuRelu {
    pipeline: Box<dyn ComputePipeline>,
    elempack: usize,
    elemsize: usize,
    groups: usize,
    local_size_x: u32,
}

impl GpuRelu {
    /// Compiles a ReLU pipeline for tensors of `shape`.
    ///
    /// `slope` is the negative-side slope, baked in as a specialization
    /// constant; 0 gives plain ReLU.
    pub fn new(
        device: &dyn ComputeDevice,
        shape: &TensorShape,
        slope: f32,
        opt: &GpuOptions,
    ) -> Result<Self, GpuError> {
        let elempack = shape_elempack(shape, opt);
        let scalar_size = if opt.use_fp16_storage { 2 } else { 4 };
        let elemsize = scalar_size * elempack;
        let total = shape.w * shape.h * shape.d * shape.c;
        let groups = total / elempack;

        let shader = match elempack {
            8 => "relu_pack8",
            4 => "relu_pack4",
            _ => "relu",
        };
        let local_size_x = device.subgroup_size().max(64);
        debug!(
            "gpu relu: shader={shader} elempack={elempack} elemsize={elemsize} groups={groups}"
        );
        let pipeline = device.create_pipeline(&PipelineSpec {
            shader: shader.to_owned(),
            local_size: [local_size_x, 1, 1],
            specializations: vec![SpecConstant::F32(slope)],
        })?;
        Ok(Self {
            pipeline,
            elempack,
            elemsize,
            groups,
            local_size_x,
        })
    }

    /// The packing factor chosen at setup.
    pub fn elempack(&self) -> usize {
        self.elempack
    }

    /// Bytes per packed group on the device.
    pub fn elemsize(&self) -> usize {
        self.elemsize
    }

    /// Runs the pipeline over one tensor's worth of bytes.
    ///
    /// Both buffers must hold exactly the footprint declared at setup.
    pub fn run(&self, input: &[u8], output: &mut [u8]) -> Result<(), GpuError> {
        let expected = self.groups * self.elemsize;
        if input.len() != expected {
            return Err(GpuError::BindingSize {
                binding: 0,
                expected,
                actual: input.len(),
            });
        }
        if output.len() != expected {
            return Err(GpuError::BindingSize {
                binding: 1,
                expected,
                actual: output.len(),
            });
        }
        let group_count = [
            (self.groups as u32).div_ceil(self.local_size_x),
            1,
            1,
        ];
        self.pipeline.dispatch(
            Bindings { input, output },
            &[self.groups as u32, self.elempack as u32],
            group_count,
        )
    }
}
