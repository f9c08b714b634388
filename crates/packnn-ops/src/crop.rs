//! Crop operator.
//!
//! Dispatch walks the tiers in order: identity alias, aligned packed kernels
//! (including an 8-to-4 lane reduction), repack-to-scalar retry, and the
//! scalar reference path.

use log::debug;
use packnn_tensor::{Tensor, TensorShape};

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::packing::convert_packing;
use crate::region::{CropRegion, Region};

/// Extracts a rectangular window from the input tensor.
///
/// Extra inputs are consulted for their shapes only, to resolve
/// [`CropRegion::Expr`] references and [`CropRegion::Reference`] extents.
pub struct Crop {
    /// How the window is specified.
    pub region: CropRegion,
}

impl Crop {
    /// A crop with the given region description.
    pub fn new(region: CropRegion) -> Self {
        Self { region }
    }
}

impl<T: Copy + Send + Sync + 'static> Layer<T> for Crop {
    fn name(&self) -> &'static str {
        "Crop"
    }

    fn support_packing(&self) -> bool {
        true
    }

    fn forward(&self, inputs: &[Tensor<T>], opt: &Options) -> Result<Vec<Tensor<T>>, OpsError> {
        if inputs.is_empty() {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: 0,
            });
        }
        let src = &inputs[0];
        let shapes: Vec<TensorShape> = inputs.iter().map(Tensor::shape).collect();
        let region = self.region.resolve(&shapes)?;

        if region.is_identity(&shapes[0]) {
            debug!("crop: identity, aliasing input");
            return Ok(vec![src.clone()]);
        }
        if region.is_empty() {
            debug!("crop: empty region {:?}", region);
            return Ok(vec![empty_output(src.dims, &region, opt)?]);
        }

        if src.elempack > 1 && opt.use_packing_layout {
            if let Some(out) = crop_packed(src, &region, opt)? {
                return Ok(vec![out]);
            }
        }
        if src.elempack > 1 {
            debug!("crop: repacking elempack {} to 1", src.elempack);
            let unpacked = convert_packing(src, 1, &opt.with_workspace_as_blob())?;
            return Ok(vec![crop_scalar(&unpacked, &region, opt)?]);
        }
        Ok(vec![crop_scalar(src, &region, opt)?])
    }
}

fn empty_output<T>(dims: usize, region: &Region, opt: &Options) -> Result<Tensor<T>, OpsError> {
    let out = match dims {
        1 => Tensor::create_1d(region.outw, 1, &opt.blob_allocator)?,
        2 => Tensor::create_2d(region.outw, region.outh, 1, &opt.blob_allocator)?,
        3 => Tensor::create_3d(region.outw, region.outh, region.outc, 1, &opt.blob_allocator)?,
        _ => Tensor::create_4d(
            region.outw,
            region.outh,
            region.outd,
            region.outc,
            1,
            &opt.blob_allocator,
        )?,
    };
    Ok(out)
}

/// Aligned packed kernels. Returns `Ok(None)` when no packed tier applies
/// and the caller should fall through to the repack tier.
fn crop_packed<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    region: &Region,
    opt: &Options,
) -> Result<Option<Tensor<T>>, OpsError> {
    let pack = src.elempack;
    match src.dims {
        1 => {
            // 1-D lanes lie in scalar order, so any window is a contiguous
            // copy; only the output width constrains the output factor.
            let out_pack = if region.outw % pack == 0 {
                pack
            } else if pack == 8 && region.outw % 4 == 0 {
                4
            } else {
                return Ok(None);
            };
            debug!("crop: packed 1-d window, out elempack {out_pack}");
            let mut out = Tensor::create_1d(region.outw / out_pack, out_pack, &opt.blob_allocator)?;
            out.as_slice_mut()
                .copy_from_slice(&src.as_slice()[region.woffset..region.woffset + region.outw]);
            Ok(Some(out))
        }
        2 => {
            if region.hoffset % pack != 0 || region.outh % pack != 0 {
                return Ok(None);
            }
            debug!("crop: packed 2-d window, out elempack {pack}");
            let mut out =
                Tensor::create_2d(region.outw, region.outh / pack, pack, &opt.blob_allocator)?;
            let src_data = src.as_slice();
            let w = src.w;
            let row_group = region.outw * pack;
            let hg0 = region.hoffset / pack;
            for (hg, drow) in out.as_slice_mut().chunks_exact_mut(row_group).enumerate() {
                let srow = &src_data[((hg0 + hg) * w + region.woffset) * pack..][..row_group];
                drow.copy_from_slice(srow);
            }
            Ok(Some(out))
        }
        _ => crop_packed_channels(src, region, opt),
    }
}

fn crop_packed_channels<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    region: &Region,
    opt: &Options,
) -> Result<Option<Tensor<T>>, OpsError> {
    let pack = src.elempack;
    let full_spatial = region.woffset == 0
        && region.outw == src.w
        && region.hoffset == 0
        && region.outh == src.h
        && region.doffset == 0
        && region.outd == src.d;

    if region.coffset % pack == 0 && region.outc % pack == 0 {
        let qg0 = region.coffset / pack;
        let outc_g = region.outc / pack;
        if full_spatial {
            debug!("crop: packed channel slice, copying {outc_g} groups");
            let slice = src.channel_range(qg0, outc_g)?;
            let mut out = slice.deep_clone(&opt.blob_allocator)?;
            out.dims = src.dims;
            return Ok(Some(out));
        }
        debug!("crop: packed spatial window, elempack {pack}");
        let mut out = if src.dims == 4 {
            Tensor::create_4d(
                region.outw,
                region.outh,
                region.outd,
                outc_g,
                pack,
                &opt.blob_allocator,
            )?
        } else {
            Tensor::create_3d(region.outw, region.outh, outc_g, pack, &opt.blob_allocator)?
        };
        let out_cstep = out.cstep;
        let w = src.w;
        let h = src.h;
        let row_group = region.outw * pack;
        crate::parallel::with_thread_budget(opt.num_threads, || {
            use rayon::prelude::*;
            let src_ref = &src;
            out.as_slice_mut()
                .par_chunks_exact_mut(out_cstep)
                .enumerate()
                .for_each(|(q, dst)| {
                    let plane = src_ref.channel_data(qg0 + q);
                    for z in 0..region.outd {
                        let z_src = (region.doffset + z) * h;
                        let z_dst = z * region.outh;
                        for y in 0..region.outh {
                            let srow = &plane
                                [((z_src + region.hoffset + y) * w + region.woffset) * pack..]
                                [..row_group];
                            dst[(z_dst + y) * row_group..(z_dst + y + 1) * row_group]
                                .copy_from_slice(srow);
                        }
                    }
                });
        });
        return Ok(Some(out));
    }

    // Lane reduction: a pack-8 source whose window is pack-4 aligned.
    if pack == 8 && src.dims == 3 && region.coffset % 4 == 0 && region.outc % 4 == 0 {
        debug!("crop: reducing elempack 8 window to 4");
        let outc_g = region.outc / 4;
        let mut out = Tensor::create_3d(region.outw, region.outh, outc_g, 4, &opt.blob_allocator)?;
        let out_cstep = out.cstep;
        let w = src.w;
        crate::parallel::with_thread_budget(opt.num_threads, || {
            use rayon::prelude::*;
            let src_ref = &src;
            out.as_slice_mut()
                .par_chunks_exact_mut(out_cstep)
                .enumerate()
                .for_each(|(q, dst)| {
                    for lane in 0..4 {
                        let c = region.coffset + q * 4 + lane;
                        let plane = src_ref.channel_data(c / 8);
                        let sl = c % 8;
                        for y in 0..region.outh {
                            for x in 0..region.outw {
                                dst[(y * region.outw + x) * 4 + lane] = plane
                                    [((region.hoffset + y) * w + region.woffset + x) * 8 + sl];
                            }
                        }
                    }
                });
        });
        return Ok(Some(out));
    }

    Ok(None)
}

/// Scalar reference path over an `elempack == 1` tensor.
fn crop_scalar<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    region: &Region,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    let src_data = src.as_slice();
    match src.dims {
        1 => {
            let mut out = Tensor::create_1d(region.outw, 1, &opt.blob_allocator)?;
            out.as_slice_mut()
                .copy_from_slice(&src_data[region.woffset..region.woffset + region.outw]);
            Ok(out)
        }
        2 => {
            let mut out = Tensor::create_2d(region.outw, region.outh, 1, &opt.blob_allocator)?;
            let w = src.w;
            for (y, drow) in out.as_slice_mut().chunks_exact_mut(region.outw).enumerate() {
                let srow = &src_data[(region.hoffset + y) * w + region.woffset..][..region.outw];
                drow.copy_from_slice(srow);
            }
            Ok(out)
        }
        _ => {
            let mut out = if src.dims == 4 {
                Tensor::create_4d(
                    region.outw,
                    region.outh,
                    region.outd,
                    region.outc,
                    1,
                    &opt.blob_allocator,
                )?
            } else {
                Tensor::create_3d(region.outw, region.outh, region.outc, 1, &opt.blob_allocator)?
            };
            let out_cstep = out.cstep;
            let (w, h) = (src.w, src.h);
            crate::parallel::with_thread_budget(opt.num_threads, || {
                use rayon::prelude::*;
                let src_ref = &src;
                out.as_slice_mut()
                    .par_chunks_exact_mut(out_cstep)
                    .enumerate()
                    .for_each(|(q, dst)| {
                        let plane = src_ref.channel_data(region.coffset + q);
                        for z in 0..region.outd {
                            let z_src = (region.doffset + z) * h;
                            let z_dst = z * region.outh;
                            for y in 0..region.outh {
                                let srow = &plane
                                    [(z_src + region.hoffset + y) * w + region.woffset..]
                                    [..region.outw];
                                dst[(z_dst + y) * region.outw..(z_dst + y + 1) * region.outw]
                                    .copy_from_slice(srow);
                            }
                        }
                    });
            });
            Ok(out)
        }
    }
}
