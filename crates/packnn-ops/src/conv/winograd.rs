//! Winograd F(4x4, 3x3) convolution.
//!
//! Trades the 9 multiplies per output of a direct 3x3 for 36 multiplies per
//! 16 outputs, at the cost of transform passes. The pipeline is: pad the
//! input to whole 4x4 tiles, transform each 6x6 input tile into 36
//! coefficients, multiply-accumulate per coefficient across input channels,
//! then inverse-transform each output tile and trim the padding.
//!
//! Numerically this is an approximation; the transform constants amplify
//! rounding, so results match direct convolution to roughly 1e-3 relative.

use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::Options;
use crate::padding::{copy_cut_border, copy_make_border};
use crate::parallel::with_thread_budget;

const G: [[f32; 3]; 6] = [
    [1.0 / 4.0, 0.0, 0.0],
    [-1.0 / 6.0, -1.0 / 6.0, -1.0 / 6.0],
    [-1.0 / 6.0, 1.0 / 6.0, -1.0 / 6.0],
    [1.0 / 24.0, 1.0 / 12.0, 1.0 / 6.0],
    [1.0 / 24.0, -1.0 / 12.0, 1.0 / 6.0],
    [0.0, 0.0, 1.0],
];

const BT: [[f32; 6]; 6] = [
    [4.0, 0.0, -5.0, 0.0, 1.0, 0.0],
    [0.0, -4.0, -4.0, 1.0, 1.0, 0.0],
    [0.0, 4.0, -4.0, -1.0, 1.0, 0.0],
    [0.0, -2.0, -1.0, 2.0, 1.0, 0.0],
    [0.0, 2.0, -1.0, -2.0, 1.0, 0.0],
    [0.0, 4.0, 0.0, -5.0, 0.0, 1.0],
];

const AT: [[f32; 6]; 4] = [
    [1.0, 1.0, 1.0, 1.0, 1.0, 0.0],
    [0.0, 1.0, -1.0, 2.0, -2.0, 0.0],
    [0.0, 1.0, 1.0, 4.0, 4.0, 0.0],
    [0.0, 1.0, -1.0, 8.0, -8.0, 1.0],
];

fn mat_mul<const M: usize, const K: usize, const N: usize>(
    a: &[[f32; K]; M],
    b: &[[f32; N]; K],
) -> [[f32; N]; M] {
    let mut out = [[0.0f32; N]; M];
    for (orow, arow) in out.iter_mut().zip(a) {
        for (k, brow) in b.iter().enumerate() {
            let av = arow[k];
            for (o, &bv) in orow.iter_mut().zip(brow) {
                *o += av * bv;
            }
        }
    }
    out
}

fn transpose<const M: usize, const N: usize>(a: &[[f32; N]; M]) -> [[f32; M]; N] {
    let mut out = [[0.0f32; M]; N];
    for (i, row) in a.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            out[j][i] = v;
        }
    }
    out
}

/// Transforms a `[outch][inch][3][3]` kernel into the 36-coefficient domain.
///
/// The result is a 3-D tensor of `outch` channels, each a 36-row by
/// `inch`-column matrix: row `k` holds coefficient `k` of every input
/// channel's transformed kernel.
pub fn conv3x3s1_winograd43_transform_kernel(
    weights: &[f32],
    inch: usize,
    outch: usize,
    opt: &Options,
) -> Result<Tensor<f32>, OpsError> {
    let mut kernel_tm = Tensor::create_3d(inch, 36, outch, 1, &opt.blob_allocator)?;
    let cstep = kernel_tm.cstep;
    let gt = transpose(&G);
    for (p, dst) in kernel_tm.as_slice_mut().chunks_exact_mut(cstep).enumerate() {
        for q in 0..inch {
            let g0 = &weights[(p * inch + q) * 9..];
            let g = [
                [g0[0], g0[1], g0[2]],
                [g0[3], g0[4], g0[5]],
                [g0[6], g0[7], g0[8]],
            ];
            let u = mat_mul(&mat_mul(&G, &g), &gt);
            for i in 0..6 {
                for j in 0..6 {
                    dst[(i * 6 + j) * inch + q] = u[i][j];
                }
            }
        }
    }
    Ok(kernel_tm)
}

/// 3x3 stride-1 convolution through the F(4x4, 3x3) transform domain.
///
/// `input` must be a scalar-layout 3-D tensor; `kernel_tm` comes from
/// [`conv3x3s1_winograd43_transform_kernel`].
pub fn conv3x3s1_winograd43(
    input: &Tensor<f32>,
    kernel_tm: &Tensor<f32>,
    bias: &[f32],
    outch: usize,
    opt: &Options,
) -> Result<Tensor<f32>, OpsError> {
    let inch = input.c;
    let outw = input.w - 2;
    let outh = input.h - 2;
    let tw = outw.div_ceil(4);
    let th = outh.div_ceil(4);
    let tiles = tw * th;
    let (outw4, outh4) = (tw * 4, th * 4);
    let (padded_w, padded_h) = (outw4 + 2, outh4 + 2);

    let ws_opt = opt.with_workspace_as_blob();
    let bordered = copy_make_border(
        input,
        0,
        padded_h - input.h,
        0,
        padded_w - input.w,
        0.0,
        &ws_opt,
    )?;

    // Pass 1: scatter each 6x6 input tile into 36 coefficient rows.
    let mut v = Tensor::create_3d(tiles, 36, inch, 1, &opt.workspace_allocator)?;
    let v_cstep = v.cstep;
    let b = transpose(&BT);
    with_thread_budget(opt.num_threads, || {
        use rayon::prelude::*;
        let bordered_ref = &bordered;
        v.as_slice_mut()
            .par_chunks_exact_mut(v_cstep)
            .enumerate()
            .for_each(|(q, dst)| {
                let plane = bordered_ref.channel_data(q);
                for ty in 0..th {
                    for tx in 0..tw {
                        let mut d = [[0.0f32; 6]; 6];
                        for (i, drow) in d.iter_mut().enumerate() {
                            let base = (ty * 4 + i) * padded_w + tx * 4;
                            drow.copy_from_slice(&plane[base..base + 6]);
                        }
                        let vt = mat_mul(&mat_mul(&BT, &d), &b);
                        let tile = ty * tw + tx;
                        for i in 0..6 {
                            for j in 0..6 {
                                dst[(i * 6 + j) * tiles + tile] = vt[i][j];
                            }
                        }
                    }
                }
            });
    });

    // Pass 2: per-coefficient channel reduction.
    let mut m = Tensor::create_3d(tiles, 36, outch, 1, &opt.workspace_allocator)?;
    let m_cstep = m.cstep;
    with_thread_budget(opt.num_threads, || {
        use rayon::prelude::*;
        let v_ref = &v;
        let kernel_ref = &kernel_tm;
        m.as_slice_mut()
            .par_chunks_exact_mut(m_cstep)
            .enumerate()
            .for_each(|(p, dst)| {
                let u = kernel_ref.channel_data(p);
                for k in 0..36 {
                    let mrow = &mut dst[k * tiles..(k + 1) * tiles];
                    for q in 0..inch {
                        let coeff = u[k * inch + q];
                        let vrow = &v_ref.channel_data(q)[k * tiles..(k + 1) * tiles];
                        for (o, &x) in mrow.iter_mut().zip(vrow) {
                            *o += coeff * x;
                        }
                    }
                }
            });
    });

    // Pass 3: inverse-transform each tile; write straight into the output
    // blob when no trim is needed.
    let tile_aligned = outw4 == outw && outh4 == outh;
    let out_alloc = if tile_aligned {
        &opt.blob_allocator
    } else {
        &opt.workspace_allocator
    };
    let mut out4 = Tensor::create_3d(outw4, outh4, outch, 1, out_alloc)?;
    let out_cstep = out4.cstep;
    let at_t = transpose(&AT);
    with_thread_budget(opt.num_threads, || {
        use rayon::prelude::*;
        let m_ref = &m;
        out4.as_slice_mut()
            .par_chunks_exact_mut(out_cstep)
            .enumerate()
            .for_each(|(p, dst)| {
                let mplane = m_ref.channel_data(p);
                let bias0 = bias.get(p).copied().unwrap_or(0.0);
                for ty in 0..th {
                    for tx in 0..tw {
                        let tile = ty * tw + tx;
                        let mut mt = [[0.0f32; 6]; 6];
                        for i in 0..6 {
                            for j in 0..6 {
                                mt[i][j] = mplane[(i * 6 + j) * tiles + tile];
                            }
                        }
                        let y = mat_mul(&mat_mul(&AT, &mt), &at_t);
                        for (i, yrow) in y.iter().enumerate() {
                            let base = (ty * 4 + i) * outw4 + tx * 4;
                            for (j, &val) in yrow.iter().enumerate() {
                                dst[base + j] = val + bias0;
                            }
                        }
                    }
                }
            });
    });

    if tile_aligned {
        return Ok(out4);
    }
    copy_cut_border(&out4, 0, outh4 - outh, 0, outw4 - outw, opt)
}
