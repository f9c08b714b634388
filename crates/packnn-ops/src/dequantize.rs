//! Integer-to-float dequantization.
//!
//! Converts an `i32` accumulator tensor to `f32` as `x * scale` or
//! `x * scale + bias`; the bias-free form is its own kernel, never a zero
//! add. Scale and bias each broadcast from a single value or apply per
//! logical index along the outermost axis (elements for 1-D, rows for 2-D,
//! channels for 3-D). The output keeps the input geometry and packing.

use log::debug;
use packnn_tensor::{Tensor, TensorError};

use crate::error::OpsError;
use crate::layer::Options;
use crate::parallel::{for_each_plane_pair, with_thread_budget};

/// Dequantization parameters.
///
/// `scale` holds one value or one per outer logical index; `bias` is empty
/// for no bias, one value, or one per outer logical index. Table lengths are
/// validated against the input on every call. This is a type-changing
/// operator, so it exposes an inherent `forward` instead of the in-place
/// layer contract.
pub struct Dequantize {
    /// One scale, or one per outer logical index.
    pub scale: Vec<f32>,
    /// Empty for no bias, one value, or one per outer logical index.
    pub bias: Vec<f32>,
}

#[inline]
fn apply_mul(dst: &mut [f32], src: &[i32], scale: f32) {
    for (o, &v) in dst.iter_mut().zip(src) {
        *o = v as f32 * scale;
    }
}

#[inline]
fn apply_madd(dst: &mut [f32], src: &[i32], scale: f32, bias: f32) {
    for (o, &v) in dst.iter_mut().zip(src) {
        *o = v as f32 * scale + bias;
    }
}

#[inline]
fn apply_lanes_mul(dst: &mut [f32], src: &[i32], pack: usize, scales: &[f32]) {
    for (dg, sg) in dst.chunks_exact_mut(pack).zip(src.chunks_exact(pack)) {
        for lane in 0..pack {
            dg[lane] = sg[lane] as f32 * scales[lane];
        }
    }
}

#[inline]
fn apply_lanes_madd(dst: &mut [f32], src: &[i32], pack: usize, scales: &[f32], biases: &[f32]) {
    for (dg, sg) in dst.chunks_exact_mut(pack).zip(src.chunks_exact(pack)) {
        for lane in 0..pack {
            dg[lane] = sg[lane] as f32 * scales[lane] + biases[lane];
        }
    }
}

impl Dequantize {
    /// Dequantization with the given scale and bias tables.
    pub fn new(scale: Vec<f32>, bias: Vec<f32>) -> Self {
        Self { scale, bias }
    }

    fn scale_at(&self, i: usize) -> f32 {
        if self.scale.len() == 1 {
            self.scale[0]
        } else {
            self.scale[i]
        }
    }

    fn bias_at(&self, i: usize) -> f32 {
        if self.bias.len() == 1 {
            self.bias[0]
        } else {
            self.bias[i]
        }
    }

    /// Logical count along the outer axis the tables index.
    fn outer_len(src: &Tensor<i32>) -> usize {
        match src.dims {
            1 => src.total(),
            2 => src.h * src.elempack,
            _ => src.c * src.elempack,
        }
    }

    fn check_tables(&self, src: &Tensor<i32>) -> Result<(), OpsError> {
        let outer = Self::outer_len(src);
        if self.scale.len() != 1 && self.scale.len() != outer {
            return Err(OpsError::Tensor(TensorError::InvalidShape {
                expected: outer,
                actual: self.scale.len(),
            }));
        }
        if self.bias.len() > 1 && self.bias.len() != outer {
            return Err(OpsError::Tensor(TensorError::InvalidShape {
                expected: outer,
                actual: self.bias.len(),
            }));
        }
        Ok(())
    }

    /// Dequantizes `src` into a fresh `f32` tensor.
    pub fn forward(&self, src: &Tensor<i32>, opt: &Options) -> Result<Tensor<f32>, OpsError> {
        if self.scale.is_empty() {
            return Err(OpsError::Tensor(TensorError::InvalidShape {
                expected: 1,
                actual: 0,
            }));
        }
        self.check_tables(src)?;
        let mut out = Tensor::<f32>::create_like(src, &opt.blob_allocator)?;
        debug!(
            "dequantize dims={} scale_len={} bias_len={}",
            src.dims,
            self.scale.len(),
            self.bias.len()
        );
        match src.dims {
            1 => self.forward_1d(src, &mut out, opt),
            2 => self.forward_2d(src, &mut out, opt),
            _ => self.forward_channels(src, &mut out, opt),
        }
        Ok(out)
    }

    /// 1-D lanes lie in scalar order, so the table indexes by absolute
    /// scalar position. Work splits into width tiles across the budget.
    fn forward_1d(&self, src: &Tensor<i32>, out: &mut Tensor<f32>, opt: &Options) {
        let total = src.total();
        let threads = if opt.num_threads == 0 {
            rayon::current_num_threads()
        } else {
            opt.num_threads
        };
        let tile = (total / threads.max(1)).max(1);
        let src_data = src.as_slice();
        let has_bias = !self.bias.is_empty();
        with_thread_budget(opt.num_threads, || {
            use rayon::prelude::*;
            out.as_slice_mut()
                .par_chunks_mut(tile)
                .enumerate()
                .for_each(|(t, dst)| {
                    let base = t * tile;
                    let srow = &src_data[base..base + dst.len()];
                    match (self.scale.len() == 1 && self.bias.len() <= 1, has_bias) {
                        (true, false) => apply_mul(dst, srow, self.scale[0]),
                        (true, true) => apply_madd(dst, srow, self.scale[0], self.bias[0]),
                        (false, false) => {
                            for (i, (o, &v)) in dst.iter_mut().zip(srow).enumerate() {
                                *o = v as f32 * self.scale_at(base + i);
                            }
                        }
                        (false, true) => {
                            for (i, (o, &v)) in dst.iter_mut().zip(srow).enumerate() {
                                *o = v as f32 * self.scale_at(base + i) + self.bias_at(base + i);
                            }
                        }
                    }
                });
        });
    }

    fn forward_2d(&self, src: &Tensor<i32>, out: &mut Tensor<f32>, opt: &Options) {
        let pack = src.elempack;
        let row = src.w * pack;
        let src_data = src.as_slice();
        for_each_plane_pair(
            src_data,
            row,
            out.as_slice_mut(),
            row,
            opt.num_threads,
            |i, srow, drow| self.apply_outer(i, pack, srow, drow),
        );
    }

    fn forward_channels(&self, src: &Tensor<i32>, out: &mut Tensor<f32>, opt: &Options) {
        let pack = src.elempack;
        let cstep = src.cstep;
        let src_data = src.as_slice();
        for_each_plane_pair(
            src_data,
            cstep,
            out.as_slice_mut(),
            cstep,
            opt.num_threads,
            |q, splane, dplane| self.apply_outer(q, pack, splane, dplane),
        );
    }

    /// One outer group (row or channel) at logical base index `i * pack`.
    fn apply_outer(&self, i: usize, pack: usize, src: &[i32], dst: &mut [f32]) {
        let has_bias = !self.bias.is_empty();
        let per_lane = pack > 1 && (self.scale.len() > 1 || self.bias.len() > 1);
        if !per_lane {
            if has_bias {
                apply_madd(dst, src, self.scale_at(i), self.bias_at(i));
            } else {
                apply_mul(dst, src, self.scale_at(i));
            }
            return;
        }
        let mut scales = [0.0f32; 8];
        for lane in 0..pack {
            scales[lane] = self.scale_at(i * pack + lane);
        }
        if has_bias {
            let mut biases = [0.0f32; 8];
            for lane in 0..pack {
                biases[lane] = self.bias_at(i * pack + lane);
            }
            apply_lanes_madd(dst, src, pack, &scales[..pack], &biases[..pack]);
        } else {
            apply_lanes_mul(dst, src, pack, &scales[..pack]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packnn_tensor::cpu_allocator;

    #[test]
    fn scalar_scale_no_bias() -> Result<(), OpsError> {
        let src = Tensor::from_vec_1d(2, 1, vec![5, -3], &cpu_allocator())?;
        let out = Dequantize::new(vec![2.0], vec![]).forward(&src, &Options::default())?;
        assert_eq!(out.as_slice(), &[10.0, -6.0]);
        Ok(())
    }

    #[test]
    fn absent_bias_preserves_signed_zero() -> Result<(), OpsError> {
        // 0 * -2.0 is -0.0; a spurious + 0.0 would flip it to +0.0.
        let src = Tensor::from_vec_1d(1, 1, vec![0], &cpu_allocator())?;
        let out = Dequantize::new(vec![-2.0], vec![]).forward(&src, &Options::default())?;
        assert!(out.as_slice()[0].is_sign_negative());
        assert_eq!(out.as_slice()[0], 0.0);

        // The same through the channel path.
        let src = Tensor::from_vec_3d(1, 1, 2, 1, vec![0, 0], &cpu_allocator())?;
        let out = Dequantize::new(vec![-1.0, -3.0], vec![]).forward(&src, &Options::default())?;
        assert!(out.as_slice().iter().all(|x| x.is_sign_negative()));
        Ok(())
    }

    #[test]
    fn per_channel_scale_and_bias() -> Result<(), OpsError> {
        let src = Tensor::from_vec_3d(1, 1, 2, 1, vec![5, -3], &cpu_allocator())?;
        let out =
            Dequantize::new(vec![2.0, 3.0], vec![1.0, -1.0]).forward(&src, &Options::default())?;
        assert_eq!(out.as_slice(), &[11.0, -10.0]);
        Ok(())
    }

    #[test]
    fn per_row_scale_2d() -> Result<(), OpsError> {
        let src = Tensor::from_vec_2d(2, 2, 1, vec![1, 2, 3, 4], &cpu_allocator())?;
        let out = Dequantize::new(vec![10.0, 100.0], vec![]).forward(&src, &Options::default())?;
        assert_eq!(out.as_slice(), &[10.0, 20.0, 300.0, 400.0]);
        Ok(())
    }

    #[test]
    fn packed_channels_use_lane_tables() -> Result<(), OpsError> {
        // One pack-4 channel group holding logical channels 0..4, one scalar each.
        let src = Tensor::from_vec_3d(1, 1, 1, 4, vec![1, 1, 1, 1], &cpu_allocator())?;
        let scale = vec![1.0, 2.0, 3.0, 4.0];
        let bias = vec![0.5, 0.0, -0.5, 0.0];
        let out = Dequantize::new(scale, bias).forward(&src, &Options::default())?;
        assert_eq!(out.as_slice(), &[1.5, 2.0, 2.5, 4.0]);
        Ok(())
    }

    #[test]
    fn geometry_is_preserved() -> Result<(), OpsError> {
        let src = Tensor::<i32>::create_3d(3, 2, 2, 4, &cpu_allocator())?;
        let out = Dequantize::new(vec![1.0], vec![]).forward(&src, &Options::default())?;
        assert_eq!(
            (out.dims, out.w, out.h, out.c, out.elempack),
            (3, 3, 2, 2, 4)
        );
        Ok(())
    }

    #[test]
    fn broadcast_bias_applies_everywhere() -> Result<(), OpsError> {
        let src = Tensor::from_vec_2d(3, 1, 1, vec![0, 1, 2], &cpu_allocator())?;
        let out = Dequantize::new(vec![2.0], vec![7.0]).forward(&src, &Options::default())?;
        assert_eq!(out.as_slice(), &[7.0, 9.0, 11.0]);
        Ok(())
    }

    #[test]
    fn short_tables_are_rejected() -> Result<(), OpsError> {
        // 3 logical channels, but only 2 scales.
        let src = Tensor::from_vec_3d(1, 1, 3, 1, vec![1, 2, 3], &cpu_allocator())?;
        let err = Dequantize::new(vec![1.0, 2.0], vec![])
            .forward(&src, &Options::default())
            .unwrap_err();
        assert!(matches!(
            err,
            OpsError::Tensor(TensorError::InvalidShape {
                expected: 3,
                actual: 2
            })
        ));

        // Bias table too short as well.
        let err = Dequantize::new(vec![1.0], vec![1.0, 2.0])
            .forward(&src, &Options::default())
            .unwrap_err();
        assert!(matches!(
            err,
            OpsError::Tensor(TensorError::InvalidShape { .. })
        ));

        // An empty scale table is never valid.
        assert!(Dequantize::new(vec![], vec![])
            .forward(&src, &Options::default())
            .is_err());
        Ok(())
    }
}
