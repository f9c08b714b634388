//! Bicubic image resize.
//!
//! Separable 4-tap cubic resampling (Keys kernel, A = -0.75) with the
//! half-pixel coordinate mapping `fx = (dx + 0.5) * w / outw - 0.5`.
//! Border taps clamp to the edge sample. Tap offsets and coefficients are
//! precomputed per axis and shared across channels.

use log::debug;
use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;
use crate::parallel::for_each_plane_mut;

/// Bicubic resize to a fixed output size.
pub struct Interp {
    /// Output width.
    pub out_w: usize,
    /// Output height.
    pub out_h: usize,
}

/// 4-tap cubic convolution weights for a fractional offset in `[0, 1)`.
///
/// The weights sum to 1, so constant signals pass through unchanged, and a
/// zero fraction reduces to the center tap alone.
fn cubic_coeffs(t: f32) -> [f32; 4] {
    const A: f32 = -0.75;
    let t0 = t + 1.0;
    let t2 = 1.0 - t;
    let c0 = ((A * t0 - 5.0 * A) * t0 + 8.0 * A) * t0 - 4.0 * A;
    let c1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let c2 = ((A + 2.0) * t2 - (A + 3.0)) * t2 * t2 + 1.0;
    [c0, c1, c2, 1.0 - c0 - c1 - c2]
}

/// Per-output-index tap bases and weights along one axis.
fn axis_tables(src_extent: usize, dst_extent: usize) -> (Vec<isize>, Vec<[f32; 4]>) {
    let scale = src_extent as f32 / dst_extent as f32;
    let mut ofs = Vec::with_capacity(dst_extent);
    let mut coeffs = Vec::with_capacity(dst_extent);
    for d in 0..dst_extent {
        let f = (d as f32 + 0.5) * scale - 0.5;
        let s = f.floor();
        ofs.push(s as isize);
        coeffs.push(cubic_coeffs(f - s));
    }
    (ofs, coeffs)
}

#[inline]
fn clamp_tap(base: isize, tap: usize, extent: usize) -> usize {
    (base + tap as isize - 1).clamp(0, extent as isize - 1) as usize
}

impl Interp {
    /// Bicubic resize to `out_w` x `out_h`.
    pub fn new(out_w: usize, out_h: usize) -> Self {
        Self { out_w, out_h }
    }
}

impl Layer<f32> for Interp {
    fn name(&self) -> &'static str {
        "Interp"
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 1 {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: inputs.len(),
            });
        }
        if inputs[0].dims != 3 {
            return Err(OpsError::Unsupported(format!(
                "interp expects a 3-D input, got {} dims",
                inputs[0].dims
            )));
        }
        let src = if inputs[0].elempack > 1 {
            convert_packing(&inputs[0], 1, &opt.with_workspace_as_blob())?
        } else {
            inputs[0].clone()
        };
        let (w, h, channels) = (src.w, src.h, src.c);
        if (self.out_w, self.out_h) == (w, h) {
            return Ok(vec![src]);
        }
        if w == 0 || h == 0 {
            return Err(OpsError::Unsupported(
                "interp on an empty input".to_string(),
            ));
        }
        debug!("interp: bicubic {}x{} -> {}x{}", w, h, self.out_w, self.out_h);

        let (xofs, xcoeffs) = axis_tables(w, self.out_w);
        let (yofs, ycoeffs) = axis_tables(h, self.out_h);

        let mut out = Tensor::create_3d(self.out_w, self.out_h, channels, 1, &opt.blob_allocator)?;
        let out_cstep = out.cstep;
        let src_ref = &src;
        for_each_plane_mut(out.as_slice_mut(), out_cstep, opt.num_threads, |q, dst| {
            let plane = src_ref.channel_data(q);
            for dy in 0..self.out_h {
                let cy = &ycoeffs[dy];
                for dx in 0..self.out_w {
                    let cx = &xcoeffs[dx];
                    let mut sum = 0.0f32;
                    for ty in 0..4 {
                        let sy = clamp_tap(yofs[dy], ty, h);
                        let row = &plane[sy * w..];
                        let mut acc = 0.0f32;
                        for tx in 0..4 {
                            acc += row[clamp_tap(xofs[dx], tx, w)] * cx[tx];
                        }
                        sum += acc * cy[ty];
                    }
                    dst[dy * self.out_w + dx] = sum;
                }
            }
        });
        Ok(vec![out])
    }
}
