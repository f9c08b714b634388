//! Packing layout conversion.
//!
//! Repacking moves scalars between interleaved lane layouts without changing
//! the logical shape. The packed axis is `w` for 1-D tensors, `h` for 2-D and
//! `c` for 3-D/4-D. When the logical size along the packed axis is not a
//! multiple of the target factor, the tail group's unused lanes are zero.

use log::trace;
use packnn_tensor::{Tensor, TensorError};

use crate::error::OpsError;
use crate::layer::Options;
use crate::parallel::for_each_plane_mut;

/// Converts `src` to the `out_elempack` layout.
///
/// Same-factor conversion is a refcount share. 1-D conversions between
/// divisible factors are also shares, since lane interleaving along `w` is
/// the natural scalar order. Everything else gathers into a fresh tensor
/// from the per-call blob allocator; nested calls pass
/// [`Options::with_workspace_as_blob`] to keep scratch out of the blob pool.
pub fn convert_packing<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    out_elempack: usize,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    if !matches!(out_elempack, 1 | 4 | 8) {
        return Err(OpsError::Tensor(TensorError::InvalidPacking(out_elempack)));
    }
    if src.elempack == out_elempack {
        return Ok(src.clone());
    }
    trace!(
        "convert_packing dims={} {} -> {}",
        src.dims,
        src.elempack,
        out_elempack
    );
    match src.dims {
        1 => convert_1d(src, out_elempack, opt),
        2 => convert_2d(src, out_elempack, opt),
        _ => convert_channels(src, out_elempack, opt),
    }
}

fn convert_1d<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    out_elempack: usize,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    let total = src.w * src.elempack;
    if total % out_elempack == 0 {
        // Lanes along w are plain scalar order, so the bytes already match.
        let mut out = src.clone();
        out.w = total / out_elempack;
        out.elempack = out_elempack;
        out.cstep = total;
        return Ok(out);
    }
    let outw = total.div_ceil(out_elempack);
    let mut out = Tensor::create_1d(outw, out_elempack, &opt.blob_allocator)?;
    out.as_slice_mut()[..total].copy_from_slice(src.as_slice());
    Ok(out)
}

fn convert_2d<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    out_elempack: usize,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    let w = src.w;
    let rows = src.h * src.elempack;
    let outh = rows.div_ceil(out_elempack);
    let mut out = Tensor::create_2d(w, outh, out_elempack, &opt.blob_allocator)?;

    let src_data = src.as_slice();
    let src_pack = src.elempack;
    let row_group = w * out_elempack;
    for_each_plane_mut(out.as_slice_mut(), row_group, opt.num_threads, |hg, dst| {
        for lane in 0..out_elempack {
            let y = hg * out_elempack + lane;
            if y >= rows {
                break;
            }
            let (sg, sl) = (y / src_pack, y % src_pack);
            for x in 0..w {
                dst[x * out_elempack + lane] = src_data[(sg * w + x) * src_pack + sl];
            }
        }
    });
    Ok(out)
}

fn convert_channels<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    out_elempack: usize,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    let channels = src.c * src.elempack;
    let outc = channels.div_ceil(out_elempack);
    let area = src.w * src.h * src.d;
    let mut out = if src.dims == 4 {
        Tensor::create_4d(src.w, src.h, src.d, outc, out_elempack, &opt.blob_allocator)?
    } else {
        Tensor::create_3d(src.w, src.h, outc, out_elempack, &opt.blob_allocator)?
    };

    let src_data = src.as_slice();
    let src_pack = src.elempack;
    let src_cstep = src.cstep;
    let out_cstep = out.cstep;
    for_each_plane_mut(out.as_slice_mut(), out_cstep, opt.num_threads, |qg, dst| {
        for lane in 0..out_elempack {
            let q = qg * out_elempack + lane;
            if q >= channels {
                break;
            }
            let (sg, sl) = (q / src_pack, q % src_pack);
            let plane = &src_data[sg * src_cstep..];
            for i in 0..area {
                dst[i * out_elempack + lane] = plane[i * src_pack + sl];
            }
        }
    });
    Ok(out)
}
