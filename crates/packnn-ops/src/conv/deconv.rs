//! Transposed convolution.
//!
//! Each input pixel scatters a stride-spaced copy of the kernel into the
//! output. The kernel below runs the equivalent gather: for every output
//! position it walks the kernel taps, keeps the ones that land on the
//! stride grid inside the input, and accumulates with flipped tap indices.

use packnn_tensor::Tensor;

use crate::conv::direct::ConvParams;
use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;
use crate::parallel::with_thread_budget;

impl ConvParams {
    /// Output spatial extent of the transposed convolution for an input
    /// extent; inputs always grow, so this cannot fail.
    pub fn deconv_out_extent(&self, extent: usize) -> usize {
        let span = self.dilation * (self.kernel_size - 1) + 1;
        (extent.saturating_sub(1)) * self.stride + span
    }
}

/// Transposed 2-D convolution over a 3-D input.
///
/// Weights are `[num_output][inch][k][k]` row-major in scatter orientation:
/// input pixel `(y, x)` contributes `in * weight[ky][kx]` to output
/// `(y * stride + ky * dilation, x * stride + kx * dilation)`. An empty
/// bias vector means no bias.
pub struct Deconvolution {
    /// Hyperparameters; `num_output` is the output channel count.
    pub params: ConvParams,
    /// Filter weights.
    pub weights: Vec<f32>,
    /// Per-output-channel bias, or empty.
    pub bias: Vec<f32>,
}

impl Deconvolution {
    /// A transposed convolution layer.
    pub fn new(params: ConvParams, weights: Vec<f32>, bias: Vec<f32>) -> Self {
        Self {
            params,
            weights,
            bias,
        }
    }
}

/// Scalar-layout transposed convolution kernel.
pub fn deconv_direct_f32(
    input: &Tensor<f32>,
    weights: &[f32],
    bias: &[f32],
    params: &ConvParams,
    opt: &Options,
) -> Result<Tensor<f32>, OpsError> {
    let (w, h, inch) = (input.w, input.h, input.c);
    let k = params.kernel_size;
    let (stride, dilation) = (params.stride, params.dilation);
    let span = dilation * (k - 1) + 1;
    let outw = params.deconv_out_extent(w);
    let outh = params.deconv_out_extent(h);
    let mut out = Tensor::<f32>::create_3d(outw, outh, params.num_output, 1, &opt.blob_allocator)?;

    let out_cstep = out.cstep;
    with_thread_budget(opt.num_threads, || {
        use rayon::prelude::*;
        out.as_slice_mut()
            .par_chunks_exact_mut(out_cstep)
            .enumerate()
            .for_each(|(p, dst)| {
                let b = if bias.is_empty() { 0.0 } else { bias[p] };
                for oy in 0..outh {
                    for ox in 0..outw {
                        let mut sum = b;
                        for q in 0..inch {
                            let plane = input.channel_data(q);
                            let kernel = &weights[(p * inch + q) * k * k..];
                            for ky in 0..k {
                                // Gather tap: the input row whose scatter of
                                // this tap reaches oy, if it lies on the
                                // stride grid.
                                let sys = oy + ky * dilation;
                                if sys < span - 1 || (sys - (span - 1)) % stride != 0 {
                                    continue;
                                }
                                let sy = (sys - (span - 1)) / stride;
                                if sy >= h {
                                    continue;
                                }
                                let row = &plane[sy * w..];
                                for kx in 0..k {
                                    let sxs = ox + kx * dilation;
                                    if sxs < span - 1 || (sxs - (span - 1)) % stride != 0 {
                                        continue;
                                    }
                                    let sx = (sxs - (span - 1)) / stride;
                                    if sx >= w {
                                        continue;
                                    }
                                    // Flipped taps turn the scatter into a
                                    // gather over stored weights.
                                    sum += row[sx] * kernel[(k - 1 - ky) * k + (k - 1 - kx)];
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

impl Layer<f32> for Deconvolution {
    fn name(&self) -> &'static str {
        "Deconvolution"
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 1 {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: inputs.len(),
            });
        }
        let src = if inputs[0].elempack > 1 {
            convert_packing(&inputs[0], 1, &opt.with_workspace_as_blob())?
        } else {
            inputs[0].clone()
        };
        let out = deconv_direct_f32(&src, &self.weights, &self.bias, &self.params, opt)?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packnn_tensor::cpu_allocator;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn deconv_extent_math() {
        let p = ConvParams {
            num_output: 1,
            kernel_size: 3,
            stride: 2,
            dilation: 1,
        };
        // (4 - 1) * 2 + 3
        assert_eq!(p.deconv_out_extent(4), 9);
        let p = ConvParams { dilation: 2, ..p };
        assert_eq!(p.deconv_out_extent(4), 11);
    }

    #[test]
    fn single_pixel_stamps_the_kernel() -> Result<(), OpsError> {
        let input = Tensor::from_vec_3d(1, 1, 1, 1, vec![2.0], &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 2,
            stride: 2,
            dilation: 1,
        };
        let layer = Deconvolution::new(params, vec![1.0, 2.0, 3.0, 4.0], vec![]);
        let out = &layer.forward(&[input], &Options::default())?[0];
        assert_eq!((out.w, out.h), (2, 2));
        assert_eq!(out.as_slice(), &[2.0, 4.0, 6.0, 8.0]);
        Ok(())
    }

    #[test]
    fn identity_kernel_passes_through() -> Result<(), OpsError> {
        let data: Vec<f32> = (0..9).map(|x| x as f32).collect();
        let input = Tensor::from_vec_3d(3, 3, 1, 1, data, &cpu_allocator())?;
        let params = ConvParams {
            num_output: 1,
            kernel_size: 1,
            stride: 1,
            dilation: 1,
        };
        let layer = Deconvolution::new(params, vec![1.0], vec![]);
        let out = &layer.forward(&[input.clone()], &Options::default())?[0];
        assert_eq!(out.as_slice(), input.as_slice());
        Ok(())
    }

    /// Scatter reference: every input pixel adds its kernel stamp at the
    /// strided output position.
    fn scatter_reference(
        input: &Tensor<f32>,
        weights: &[f32],
        bias: &[f32],
        params: &ConvParams,
    ) -> Vec<f32> {
        let (w, h, inch) = (input.w, input.h, input.c);
        let k = params.kernel_size;
        let outw = params.deconv_out_extent(w);
        let outh = params.deconv_out_extent(h);
        let mut out = vec![0.0f32; outw * outh * params.num_output];
        for p in 0..params.num_output {
            let plane = &mut out[p * outw * outh..(p + 1) * outw * outh];
            if !bias.is_empty() {
                plane.fill(bias[p]);
            }
            for q in 0..inch {
                let src = input.channel_data(q);
                let kernel = &weights[(p * inch + q) * k * k..];
                for y in 0..h {
                    for x in 0..w {
                        for ky in 0..k {
                            for kx in 0..k {
                                let oy = y * params.stride + ky * params.dilation;
                                let ox = x * params.stride + kx * params.dilation;
                                plane[oy * outw + ox] += src[y * w + x] * kernel[ky * k + kx];
                            }
                        }
                    }
                }
            }
        }
        out
    }

    #[test]
    fn gather_matches_scatter_reference() -> Result<(), OpsError> {
        let mut rng = StdRng::seed_from_u64(21);
        let (w, h, inch, outch) = (5, 4, 3, 2);
        let data: Vec<f32> = (0..w * h * inch).map(|_| rng.random_range(-1.0..1.0)).collect();
        let input = Tensor::from_vec_3d(w, h, inch, 1, data, &cpu_allocator())?;
        let weights: Vec<f32> = (0..outch * inch * 9)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let bias = vec![0.25, -0.25];
        let params = ConvParams {
            num_output: outch,
            kernel_size: 3,
            stride: 2,
            dilation: 1,
        };
        let expect = scatter_reference(&input, &weights, &bias, &params);
        let layer = Deconvolution::new(params, weights, bias);
        let out = &layer.forward(&[input], &Options::default())?[0];
        for (g, e) in out.as_slice().iter().zip(&expect) {
            assert!((g - e).abs() < 1e-5, "{g} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn packed_input_repacks_and_matches() -> Result<(), OpsError> {
        let opt = Options::default();
        let mut rng = StdRng::seed_from_u64(22);
        let data: Vec<f32> = (0..3 * 3 * 4).map(|_| rng.random_range(-1.0..1.0)).collect();
        let input = Tensor::from_vec_3d(3, 3, 4, 1, data, &cpu_allocator())?;
        let packed = convert_packing(&input, 4, &opt)?;
        let weights: Vec<f32> = (0..4 * 4).map(|_| rng.random_range(-1.0..1.0)).collect();
        let params = ConvParams {
            num_output: 1,
            kernel_size: 2,
            stride: 2,
            dilation: 1,
        };
        let layer = Deconvolution::new(params, weights, vec![]);
        let from_scalar = &layer.forward(&[input], &opt)?[0];
        let from_packed = &layer.forward(&[packed], &opt)?[0];
        assert_eq!(from_packed.as_slice(), from_scalar.as_slice());
        Ok(())
    }
}
