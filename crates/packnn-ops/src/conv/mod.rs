//! Convolution operator.

use log::debug;
use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;

pub mod deconv;
pub mod direct;
pub mod winograd;

pub use deconv::{deconv_direct_f32, Deconvolution};
pub use direct::{conv_direct_f32, conv_direct_i8, ConvParams};
pub use winograd::{conv3x3s1_winograd43, conv3x3s1_winograd43_transform_kernel};

/// Channel thresholds below which the transform overhead of Winograd
/// outweighs its multiply savings.
const WINOGRAD_MIN_CHANNELS: usize = 8;

/// 2-D convolution over a 3-D input.
///
/// Weights are `[num_output][inch][k][k]` row-major; an empty bias vector
/// means no bias. Call [`Convolution::prepare`] once after construction to
/// let eligible shapes take the Winograd path.
pub struct Convolution {
    /// Hyperparameters.
    pub params: ConvParams,
    /// Filter weights.
    pub weights: Vec<f32>,
    /// Per-output-channel bias, or empty.
    pub bias: Vec<f32>,
    winograd_kernel: Option<Tensor<f32>>,
}

impl Convolution {
    /// A convolution layer with untransformed weights.
    pub fn new(params: ConvParams, weights: Vec<f32>, bias: Vec<f32>) -> Self {
        Self {
            params,
            weights,
            bias,
            winograd_kernel: None,
        }
    }

    fn is_winograd_shape(&self) -> bool {
        self.params.kernel_size == 3 && self.params.stride == 1 && self.params.dilation == 1
    }

    /// Pre-transforms the kernel for the Winograd path when the
    /// hyperparameters allow it. `inch` is the expected input channel count.
    pub fn prepare(&mut self, inch: usize, opt: &Options) -> Result<(), OpsError> {
        if self.is_winograd_shape() && self.winograd_kernel.is_none() {
            self.winograd_kernel = Some(conv3x3s1_winograd43_transform_kernel(
                &self.weights,
                inch,
                self.params.num_output,
                opt,
            )?);
        }
        Ok(())
    }
}

impl Layer<f32> for Convolution {
    fn name(&self) -> &'static str {
        "Convolution"
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 1 {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: inputs.len(),
            });
        }
        let src = &inputs[0];

        // Compute dense over scalar layout; packed inputs repack first.
        let src = if src.elempack > 1 {
            debug!("conv: repacking elempack {} to 1", src.elempack);
            convert_packing(src, 1, &opt.with_workspace_as_blob())?
        } else {
            src.clone()
        };

        let inch = src.c;
        let use_winograd = self.is_winograd_shape()
            && inch >= WINOGRAD_MIN_CHANNELS
            && self.params.num_output >= WINOGRAD_MIN_CHANNELS
            && src.w >= 3
            && src.h >= 3;

        if use_winograd {
            if let Some(kernel_tm) = &self.winograd_kernel {
                debug!(
                    "conv: winograd43 {}x{}x{} -> {}",
                    src.w, src.h, inch, self.params.num_output
                );
                let out = conv3x3s1_winograd43(
                    &src,
                    kernel_tm,
                    &self.bias,
                    self.params.num_output,
                    opt,
                )?;
                return Ok(vec![out]);
            }
        }

        debug!(
            "conv: direct k{} s{} d{} over {}x{}x{}",
            self.params.kernel_size, self.params.stride, self.params.dilation, src.w, src.h, inch
        );
        let out = conv_direct_f32(&src, &self.weights, &self.bias, &self.params, opt)?;
        Ok(vec![out])
    }
}
