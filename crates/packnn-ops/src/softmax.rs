//! Softmax.
//!
//! Values are shifted by the running maximum before exponentiation so large
//! logits cannot overflow. The channel-axis path over 3-D tensors runs as
//! plane-wide passes with workspace max and sum planes; reductions along
//! spatial axes fall through to a strided per-lane loop.

use log::debug;
use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;
use crate::parallel::for_each_plane_mut;

/// Softmax along one logical axis, counted outermost-first: for a 3-D
/// tensor axis 0 is channels, 1 is height, 2 is width.
pub struct Softmax {
    /// Reduction axis.
    pub axis: usize,
}

impl Softmax {
    /// Softmax along `axis`.
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

/// Softmax over `n` values starting at `start`, `stride` apart.
fn softmax_strided(buf: &mut [f32], start: usize, stride: usize, n: usize) {
    let mut max = f32::NEG_INFINITY;
    for i in 0..n {
        max = max.max(buf[start + i * stride]);
    }
    let mut sum = 0.0f32;
    for i in 0..n {
        let e = (buf[start + i * stride] - max).exp();
        buf[start + i * stride] = e;
        sum += e;
    }
    for i in 0..n {
        buf[start + i * stride] /= sum;
    }
}

impl Layer<f32> for Softmax {
    fn name(&self) -> &'static str {
        "Softmax"
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 1 {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: inputs.len(),
            });
        }
        let src = &inputs[0];
        let mut out = if src.elempack > 1 {
            debug!("softmax: repacking elempack {} to 1", src.elempack);
            let unpacked = convert_packing(src, 1, &opt.with_workspace_as_blob())?;
            if unpacked.shares_storage(src) {
                unpacked.deep_clone(&opt.blob_allocator)?
            } else {
                unpacked
            }
        } else {
            src.deep_clone(&opt.blob_allocator)?
        };
        self.forward_inplace(&mut out, opt)?;
        Ok(vec![out])
    }

    fn forward_inplace(&self, blob: &mut Tensor<f32>, opt: &Options) -> Result<(), OpsError> {
        if blob.elempack != 1 {
            return Err(OpsError::Unsupported(
                "softmax in place requires scalar layout".to_owned(),
            ));
        }
        let (dims, w, h, cstep) = (blob.dims, blob.w, blob.h, blob.cstep);
        match (dims, self.axis) {
            (1, _) => {
                softmax_strided(blob.as_slice_mut(), 0, 1, w);
            }
            (2, 0) => {
                let data = blob.as_slice_mut();
                for x in 0..w {
                    softmax_strided(data, x, w, h);
                }
            }
            (2, _) => {
                for_each_plane_mut(blob.as_slice_mut(), w, opt.num_threads, |_, row| {
                    softmax_strided(row, 0, 1, w);
                });
            }
            (3, 0) => self.channel_axis_3d(blob, opt)?,
            (3, 1) => {
                for_each_plane_mut(blob.as_slice_mut(), cstep, opt.num_threads, |_, plane| {
                    for x in 0..w {
                        softmax_strided(plane, x, w, h);
                    }
                });
            }
            (3, _) => {
                for_each_plane_mut(blob.as_slice_mut(), cstep, opt.num_threads, |_, plane| {
                    for y in 0..h {
                        softmax_strided(plane, y * w, 1, w);
                    }
                });
            }
            _ => {
                return Err(OpsError::Unsupported(format!(
                    "softmax axis {} over {}-d tensor",
                    self.axis, dims
                )))
            }
        }
        Ok(())
    }
}

impl Softmax {
    /// The hot case: reduce across channels at every spatial position.
    ///
    /// Pass 1 folds the running maximum into a plane, pass 2 exponentiates
    /// every channel in parallel, pass 3 accumulates the sum plane and
    /// pass 4 divides in parallel.
    fn channel_axis_3d(&self, blob: &mut Tensor<f32>, opt: &Options) -> Result<(), OpsError> {
        let (w, h, c, cstep) = (blob.w, blob.h, blob.c, blob.cstep);
        let area = w * h;

        let mut max_plane = Tensor::<f32>::create_2d(w, h, 1, &opt.workspace_allocator)?;
        max_plane.fill(f32::NEG_INFINITY);
        for q in 0..c {
            let plane = blob.channel_data(q);
            for (m, &x) in max_plane.as_slice_mut().iter_mut().zip(plane) {
                *m = m.max(x);
            }
        }

        let max_data = max_plane.as_slice();
        for_each_plane_mut(blob.as_slice_mut(), cstep, opt.num_threads, |_, plane| {
            for (x, &m) in plane[..area].iter_mut().zip(max_data) {
                *x = (*x - m).exp();
            }
        });

        let mut sum_plane = Tensor::<f32>::create_2d(w, h, 1, &opt.workspace_allocator)?;
        for q in 0..c {
            let plane = blob.channel_data(q);
            for (s, &x) in sum_plane.as_slice_mut().iter_mut().zip(plane) {
                *s += x;
            }
        }

        let sum_data = sum_plane.as_slice();
        for_each_plane_mut(blob.as_slice_mut(), cstep, opt.num_threads, |_, plane| {
            for (x, &s) in plane[..area].iter_mut().zip(sum_data) {
                *x /= s;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use packnn_tensor::cpu_allocator;

    fn reference(values: &[f32]) -> Vec<f32> {
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = values.iter().map(|x| (x - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        exps.iter().map(|e| e / sum).collect()
    }

    #[test]
    fn vector_softmax_sums_to_one() -> Result<(), OpsError> {
        let values = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut t = Tensor::from_vec_1d(4, 1, values.clone(), &cpu_allocator())?;
        Softmax::new(0).forward_inplace(&mut t, &Options::default())?;
        let expect = reference(&values);
        for (g, e) in t.as_slice().iter().zip(&expect) {
            assert_relative_eq!(*g, *e, max_relative = 1e-6);
        }
        assert_relative_eq!(t.as_slice().iter().sum::<f32>(), 1.0, max_relative = 1e-6);
        Ok(())
    }

    #[test]
    fn large_logits_do_not_overflow() -> Result<(), OpsError> {
        let mut t = Tensor::from_vec_1d(3, 1, vec![1000.0f32, 1000.0, 1000.0], &cpu_allocator())?;
        Softmax::new(0).forward_inplace(&mut t, &Options::default())?;
        for &x in t.as_slice() {
            assert_relative_eq!(x, 1.0 / 3.0, max_relative = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn channel_axis_matches_reference_per_position() -> Result<(), OpsError> {
        let (w, h, c) = (2, 2, 3);
        let data: Vec<f32> = (0..w * h * c).map(|x| (x as f32 * 0.7).sin()).collect();
        let mut t = Tensor::from_vec_3d(w, h, c, 1, data.clone(), &cpu_allocator())?;
        Softmax::new(0).forward_inplace(&mut t, &Options::default())?;

        for y in 0..h {
            for x in 0..w {
                let lane: Vec<f32> = (0..c).map(|q| data[q * w * h + y * w + x]).collect();
                let expect = reference(&lane);
                for (q, e) in expect.iter().enumerate() {
                    assert_relative_eq!(
                        t.as_slice()[q * w * h + y * w + x],
                        *e,
                        max_relative = 1e-6
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn row_axis_normalizes_each_row() -> Result<(), OpsError> {
        let data = vec![1.0f32, 2.0, 3.0, 30.0, 20.0, 10.0];
        let mut t = Tensor::from_vec_2d(3, 2, 1, data.clone(), &cpu_allocator())?;
        Softmax::new(1).forward_inplace(&mut t, &Options::default())?;
        for row in 0..2 {
            let expect = reference(&data[row * 3..(row + 1) * 3]);
            for (g, e) in t.as_slice()[row * 3..(row + 1) * 3].iter().zip(&expect) {
                assert_relative_eq!(*g, *e, max_relative = 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn packed_input_matches_scalar() -> Result<(), OpsError> {
        let opt = Options::default();
        let alloc = cpu_allocator();
        let data: Vec<f32> = (0..2 * 2 * 8).map(|x| (x as f32 * 0.3).cos()).collect();
        let scalar = Tensor::from_vec_3d(2, 2, 8, 1, data, &alloc)?;
        let packed = convert_packing(&scalar, 4, &opt)?;

        let sm = Softmax::new(0);
        let expect = &sm.forward(&[scalar], &opt)?[0];
        let got = &sm.forward(&[packed], &opt)?[0];
        assert_eq!(got.elempack, 1);
        for (g, e) in got.as_slice().iter().zip(expect.as_slice()) {
            assert_relative_eq!(*g, *e, max_relative = 1e-6);
        }
        Ok(())
    }
}
