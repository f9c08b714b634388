//! Spatial border padding and trimming.
//!
//! Both helpers treat one packed group as the unit along `w` and `h`, so
//! they work on any `elempack`; the border value is broadcast to every lane.

use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::Options;
use crate::parallel::for_each_plane_mut;

/// Copies `src` into a larger tensor with a constant border.
///
/// Supports 2-D and 3-D tensors. Output geometry is
/// `(w + left + right) x (h + top + bottom)` per channel.
pub fn copy_make_border<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
    value: T,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    if top == 0 && bottom == 0 && left == 0 && right == 0 {
        return Ok(src.clone());
    }
    let outw = src.w + left + right;
    let outh = src.h + top + bottom;
    let pack = src.elempack;
    let mut out = if src.dims == 2 {
        Tensor::create_2d(outw, outh, pack, &opt.blob_allocator)?
    } else {
        Tensor::create_3d(outw, outh, src.c, pack, &opt.blob_allocator)?
    };

    let src_data = src.as_slice();
    let (w, h, src_plane) = (src.w, src.h, src.cstep.max(src.w * src.h * pack));
    let out_plane = out.cstep;
    for_each_plane_mut(out.as_slice_mut(), out_plane, opt.num_threads, |q, dst| {
        dst.fill(value);
        let plane = &src_data[q * src_plane..q * src_plane + w * h * pack];
        for y in 0..h {
            let drow = &mut dst[((y + top) * outw + left) * pack..][..w * pack];
            drow.copy_from_slice(&plane[y * w * pack..(y + 1) * w * pack]);
        }
    });
    Ok(out)
}

/// Trims a constant-width border off `src`.
///
/// A zero-width trim is a refcount share.
pub fn copy_cut_border<T: Copy + Send + Sync>(
    src: &Tensor<T>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
    opt: &Options,
) -> Result<Tensor<T>, OpsError> {
    if top == 0 && bottom == 0 && left == 0 && right == 0 {
        return Ok(src.clone());
    }
    let outw = src.w - left - right;
    let outh = src.h - top - bottom;
    let pack = src.elempack;
    let mut out = if src.dims == 2 {
        Tensor::create_2d(outw, outh, pack, &opt.blob_allocator)?
    } else {
        Tensor::create_3d(outw, outh, src.c, pack, &opt.blob_allocator)?
    };

    let src_data = src.as_slice();
    let (w, src_plane) = (src.w, src.cstep.max(src.w * src.h * pack));
    let out_plane = out.cstep;
    for_each_plane_mut(out.as_slice_mut(), out_plane, opt.num_threads, |q, dst| {
        let plane = &src_data[q * src_plane..];
        for y in 0..outh {
            let srow = &plane[((y + top) * w + left) * pack..][..outw * pack];
            dst[y * outw * pack..(y + 1) * outw * pack].copy_from_slice(srow);
        }
    });
    Ok(out)
}
