//! Direct convolution.
//!
//! The straightforward nested-loop kernels. Slow but obviously correct;
//! every specialized convolution path is validated against these.

use std::ops::{AddAssign, Mul};

use num_traits::{AsPrimitive, Zero};
use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::Options;
use crate::parallel::with_thread_budget;

/// Convolution hyperparameters, square in both spatial axes.
#[derive(Debug, Clone, Copy)]
pub struct ConvParams {
    /// Output channel count.
    pub num_output: usize,
    /// Kernel extent.
    pub kernel_size: usize,
    /// Stride.
    pub stride: usize,
    /// Dilation.
    pub dilation: usize,
}

impl ConvParams {
    /// Output spatial extent for an input extent, or `None` when the input
    /// is smaller than the dilated kernel span.
    pub fn out_extent(&self, extent: usize) -> Option<usize> {
        let span = self.dilation * (self.kernel_size - 1) + 1;
        Some(extent.checked_sub(span)? / self.stride + 1)
    }
}

/// Direct convolution over a scalar-layout 3-D input, accumulating in `A`.
///
/// `weights` is `[num_output][inch][k][k]` row-major. One kernel serves both
/// the float path (`f32` into `f32`) and the quantized path (`i8` into `i32`
/// accumulators, where the product cannot overflow).
fn conv_direct<T, A>(
    input: &Tensor<T>,
    weights: &[T],
    params: &ConvParams,
    opt: &Options,
) -> Result<Tensor<A>, OpsError>
where
    T: Copy + Send + Sync + AsPrimitive<A>,
    A: Copy + Send + Sync + Zero + AddAssign + Mul<Output = A> + 'static,
{
    let (w, h, inch) = (input.w, input.h, input.c);
    let k = params.kernel_size;
    let span = params.dilation * (params.kernel_size - 1) + 1;
    let (outw, outh) = match (params.out_extent(w), params.out_extent(h)) {
        (Some(outw), Some(outh)) => (outw, outh),
        _ => {
            return Err(OpsError::Unsupported(format!(
                "input {}x{} smaller than kernel span {}",
                w, h, span
            )))
        }
    };
    let mut out = Tensor::<A>::create_3d(outw, outh, params.num_output, 1, &opt.blob_allocator)?;

    let out_cstep = out.cstep;
    with_thread_budget(opt.num_threads, || {
        use rayon::prelude::*;
        out.as_slice_mut()
            .par_chunks_exact_mut(out_cstep)
            .enumerate()
            .for_each(|(p, dst)| {
                let kernel = &weights[p * inch * k * k..(p + 1) * inch * k * k];
                for oy in 0..outh {
                    for ox in 0..outw {
                        let mut sum = A::zero();
                        for q in 0..inch {
                            let plane = input.channel_data(q);
                            let kq = &kernel[q * k * k..];
                            for ky in 0..k {
                                let iy = oy * params.stride + ky * params.dilation;
                                let row = &plane[iy * w..];
                                for kx in 0..k {
                                    let ix = ox * params.stride + kx * params.dilation;
                                    sum += row[ix].as_() * kq[ky * k + kx].as_();
                                }
                            }
                        }
                        dst[oy * outw + ox] = sum;
                    }
                }
            });
    });
    Ok(out)
}

/// Float direct convolution. An empty `bias` means no bias.
pub fn conv_direct_f32(
    input: &Tensor<f32>,
    weights: &[f32],
    bias: &[f32],
    params: &ConvParams,
    opt: &Options,
) -> Result<Tensor<f32>, OpsError> {
    let mut out = conv_direct::<f32, f32>(input, weights, params, opt)?;
    if !bias.is_empty() {
        let cstep = out.cstep;
        for (p, dst) in out.as_slice_mut().chunks_exact_mut(cstep).enumerate() {
            let b = bias[p];
            for x in dst.iter_mut() {
                *x += b;
            }
        }
    }
    Ok(out)
}

/// Quantized direct convolution: `i8` input and weights, `i32` accumulators.
///
/// The caller dequantizes the accumulator tensor afterwards.
pub fn conv_direct_i8(
    input: &Tensor<i8>,
    weights: &[i8],
    params: &ConvParams,
    opt: &Options,
) -> Result<Tensor<i32>, OpsError> {
    conv_direct::<i8, i32>(input, weights, params, opt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use packnn_tensor::cpu_allocator;

    #[test]
    fn out_extent_math() {
        let p = ConvParams {
            num_output: 1,
            kernel_size: 3,
            stride: 1,
            dilation: 1,
        };
        assert_eq!(p.out_extent(6), Some(4));
        let p = ConvParams {
            kernel_size: 3,
            stride: 2,
            ..p
        };
        assert_eq!(p.out_extent(7), Some(3));
        let p = ConvParams {
            stride: 1,
            dilation: 2,
            ..p
        };
        assert_eq!(p.out_extent(7), Some(3));
        // Dilated span 5 does not fit a 4-wide input.
        assert_eq!(p.out_extent(4), None);
    }

    #[test]
    fn input_smaller_than_kernel_is_an_error() -> Result<(), OpsError> {
        let input = Tensor::from_vec_3d(2, 2, 1, 1, vec![1.0; 4], &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 3,
            stride: 1,
            dilation: 1,
        };
        let err = conv_direct_f32(&input, &[1.0; 9], &[], &params, &Options::default()).unwrap_err();
        assert!(matches!(err, OpsError::Unsupported(_)));
        Ok(())
    }

    #[test]
    fn identity_kernel_passes_through() -> Result<(), OpsError> {
        let data: Vec<f32> = (0..9).map(|x| x as f32).collect();
        let input = Tensor::from_vec_3d(3, 3, 1, 1, data, &cpu_allocator())?;
        // 1x1 kernel of weight 1.
        let params = ConvParams {
            num_output: 1,
            kernel_size: 1,
            stride: 1,
            dilation: 1,
        };
        let out = conv_direct_f32(&input, &[1.0], &[], &params, &Options::default())?;
        assert_eq!(out.as_slice(), input.as_slice());
        Ok(())
    }

    #[test]
    fn sum_kernel_with_bias() -> Result<(), OpsError> {
        let input = Tensor::from_vec_3d(3, 3, 1, 1, vec![1.0; 9], &cpu_allocator())?;
        let params = ConvParams {
            num_output: 2,
            kernel_size: 3,
            stride: 1,
            dilation: 1,
        };
        let mut weights = vec![1.0f32; 9];
        weights.extend(vec![2.0f32; 9]);
        let out = conv_direct_f32(&input, &weights, &[0.5, -0.5], &params, &Options::default())?;
        assert_eq!(out.as_slice(), &[9.5, 17.5]);
        Ok(())
    }

    #[test]
    fn multi_channel_accumulates() -> Result<(), OpsError> {
        let input =
            Tensor::from_vec_3d(2, 2, 2, 1, vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0], &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 2,
            stride: 1,
            dilation: 1,
        };
        let weights = vec![1.0f32; 8];
        let out = conv_direct_f32(&input, &weights, &[], &params, &Options::default())?;
        assert_eq!(out.as_slice(), &[110.0]);
        Ok(())
    }

    #[test]
    fn i8_accumulates_in_i32() -> Result<(), OpsError> {
        // 127 * 127 * 9 overflows i16 but not i32.
        let input = Tensor::from_vec_3d(3, 3, 1, 1, vec![127i8; 9], &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 3,
            stride: 1,
            dilation: 1,
        };
        let out = conv_direct_i8(&input, &[127i8; 9], &params, &Options::default())?;
        assert_eq!(out.as_slice(), &[127 * 127 * 9]);
        Ok(())
    }

    #[test]
    fn stride_and_dilation() -> Result<(), OpsError> {
        let data: Vec<f32> = (0..25).map(|x| x as f32).collect();
        let input = Tensor::from_vec_3d(5, 5, 1, 1, data, &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 2,
            stride: 2,
            dilation: 2,
        };
        // Taps at (0,0),(0,2),(2,0),(2,2) offsets; outputs on a stride-2 grid.
        let out = conv_direct_f32(&input, &[1.0; 4], &[], &params, &Options::default())?;
        assert_eq!((out.w, out.h), (2, 2));
        assert_eq!(out.as_slice()[0], 0.0 + 2.0 + 10.0 + 12.0);
        Ok(())
    }
}
