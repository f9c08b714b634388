//! Max pooling over a region of interest.
//!
//! The ROI arrives in image coordinates as a 4-scalar `[x1, y1, x2, y2]`
//! tensor and is scaled onto the feature map. Each output cell takes the
//! maximum over its bin; bins that clamp to nothing produce 0.

use log::debug;
use packnn_tensor::{Tensor, TensorError};

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;
use crate::parallel::for_each_plane_mut;
use crate::region::ScaledRoi;

/// ROI max pooling to a fixed output grid.
pub struct RoiPooling {
    /// Output grid width.
    pub pooled_w: usize,
    /// Output grid height.
    pub pooled_h: usize,
    /// Image-to-feature-map coordinate scale.
    pub spatial_scale: f32,
}

impl RoiPooling {
    /// ROI pooling to a `pooled_w` x `pooled_h` grid.
    pub fn new(pooled_w: usize, pooled_h: usize, spatial_scale: f32) -> Self {
        Self {
            pooled_w,
            pooled_h,
            spatial_scale,
        }
    }
}

impl Layer<f32> for RoiPooling {
    fn name(&self) -> &'static str {
        "RoiPooling"
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 2 {
            return Err(OpsError::InvalidInputCount {
                expected: 2,
                actual: inputs.len(),
            });
        }
        let src = if inputs[0].elempack > 1 {
            convert_packing(&inputs[0], 1, &opt.with_workspace_as_blob())?
        } else {
            inputs[0].clone()
        };
        let roi_blob = &inputs[1];
        if roi_blob.total() < 4 {
            return Err(OpsError::Tensor(TensorError::InvalidShape {
                expected: 4,
                actual: roi_blob.total(),
            }));
        }
        let roi = ScaledRoi::from_corners(&roi_blob.as_slice()[..4], self.spatial_scale);
        debug!(
            "roi_pool: window {}x{} at ({}, {})",
            roi.width, roi.height, roi.x1, roi.y1
        );

        let (w, h, channels) = (src.w, src.h, src.c);
        let bin_w = roi.width as f32 / self.pooled_w as f32;
        let bin_h = roi.height as f32 / self.pooled_h as f32;

        let mut out =
            Tensor::create_3d(self.pooled_w, self.pooled_h, channels, 1, &opt.blob_allocator)?;
        let out_cstep = out.cstep;
        let src_ref = &src;
        for_each_plane_mut(out.as_slice_mut(), out_cstep, opt.num_threads, |q, dst| {
            let plane = src_ref.channel_data(q);
            for ph in 0..self.pooled_h {
                for pw in 0..self.pooled_w {
                    let hstart = roi.y1 + (ph as f32 * bin_h).floor() as isize;
                    let hend = roi.y1 + ((ph + 1) as f32 * bin_h).ceil() as isize;
                    let wstart = roi.x1 + (pw as f32 * bin_w).floor() as isize;
                    let wend = roi.x1 + ((pw + 1) as f32 * bin_w).ceil() as isize;

                    let hstart = hstart.clamp(0, h as isize) as usize;
                    let hend = hend.clamp(0, h as isize) as usize;
                    let wstart = wstart.clamp(0, w as isize) as usize;
                    let wend = wend.clamp(0, w as isize) as usize;

                    let empty = hend <= hstart || wend <= wstart;
                    let mut max = if empty { 0.0f32 } else { f32::NEG_INFINITY };
                    for y in hstart..hend {
                        for x in wstart..wend {
                            max = max.max(plane[y * w + x]);
                        }
                    }
                    dst[ph * self.pooled_w + pw] = max;
                }
            }
        });
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packnn_tensor::cpu_allocator;

    fn roi_tensor(corners: [f32; 4]) -> Tensor<f32> {
        Tensor::from_vec_1d(4, 1, corners.to_vec(), &cpu_allocator()).unwrap()
    }

    #[test]
    fn pools_max_per_bin() -> Result<(), OpsError> {
        // 4x4 feature map counting up; pool the full map to 2x2.
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let src = Tensor::from_vec_3d(4, 4, 1, 1, data, &cpu_allocator())?;
        let roi = roi_tensor([0.0, 0.0, 3.0, 3.0]);
        let layer = RoiPooling::new(2, 2, 1.0);
        let out = &layer.forward(&[src, roi], &Options::default())?[0];
        assert_eq!(out.as_slice(), &[5.0, 7.0, 13.0, 15.0]);
        Ok(())
    }

    #[test]
    fn spatial_scale_shrinks_roi() -> Result<(), OpsError> {
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let src = Tensor::from_vec_3d(4, 4, 1, 1, data, &cpu_allocator())?;
        // Image-space corners (0,0)-(7,7) scale onto the map as (0,0)-(4,4),
        // clamped to the 4x4 extent; a 1x1 grid takes the global max.
        let roi = roi_tensor([0.0, 0.0, 7.0, 7.0]);
        let layer = RoiPooling::new(1, 1, 0.5);
        let out = &layer.forward(&[src, roi], &Options::default())?[0];
        assert_eq!(out.as_slice(), &[15.0]);
        Ok(())
    }

    #[test]
    fn degenerate_roi_is_one_cell() -> Result<(), OpsError> {
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let src = Tensor::from_vec_3d(4, 4, 1, 1, data, &cpu_allocator())?;
        // x2 < x1 after rounding still yields a 1x1 window at (2, 2).
        let roi = roi_tensor([2.0, 2.0, 2.0, 2.0]);
        let layer = RoiPooling::new(2, 2, 1.0);
        let out = &layer.forward(&[src, roi], &Options::default())?[0];
        // Every bin of the larger grid re-samples the single cell at (2, 2).
        assert_eq!(out.as_slice(), &[10.0, 10.0, 10.0, 10.0]);
        Ok(())
    }

    #[test]
    fn out_of_bounds_bins_produce_zero() -> Result<(), OpsError> {
        let data = vec![5.0f32; 4];
        let src = Tensor::from_vec_3d(2, 2, 1, 1, data, &cpu_allocator())?;
        // ROI hangs off the right edge; right-hand bins clamp to nothing.
        let roi = roi_tensor([3.0, 0.0, 6.0, 1.0]);
        let layer = RoiPooling::new(2, 1, 1.0);
        let out = &layer.forward(&[src, roi], &Options::default())?[0];
        assert_eq!(out.as_slice(), &[0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn truncated_roi_blob_is_rejected() -> Result<(), OpsError> {
        let src = Tensor::from_vec_3d(2, 2, 1, 1, vec![1.0; 4], &cpu_allocator())?;
        // Three scalars cannot hold [x1, y1, x2, y2].
        let roi = Tensor::from_vec_1d(3, 1, vec![0.0, 0.0, 1.0], &cpu_allocator())?;
        let layer = RoiPooling::new(1, 1, 1.0);
        let err = layer.forward(&[src, roi], &Options::default()).unwrap_err();
        assert!(matches!(
            err,
            OpsError::Tensor(TensorError::InvalidShape {
                expected: 4,
                actual: 3
            })
        ));
        Ok(())
    }

    #[test]
    fn channels_pool_independently() -> Result<(), OpsError> {
        let mut data = vec![1.0f32; 4];
        data.extend(vec![9.0f32; 4]);
        let src = Tensor::from_vec_3d(2, 2, 2, 1, data, &cpu_allocator())?;
        let roi = roi_tensor([0.0, 0.0, 1.0, 1.0]);
        let layer = RoiPooling::new(1, 1, 1.0);
        let out = &layer.forward(&[src, roi], &Options::default())?[0];
        assert_eq!(out.as_slice(), &[1.0, 9.0]);
        Ok(())
    }
}
