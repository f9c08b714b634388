//! Elementwise unary math.
//!
//! Every operation has a scalar kernel and a 4-lane kernel working on
//! `[f32; 4]` blocks. Packing is irrelevant to elementwise math, so the
//! in-place path runs the wide kernel over the bulk of each channel plane
//! and finishes the remainder with the scalar kernel.

use packnn_tensor::Tensor;

use crate::error::OpsError;
use crate::layer::{Layer, Options};
use crate::parallel::for_each_plane_mut;

/// The supported elementwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `|x|`
    Abs,
    /// `-x`
    Neg,
    /// Largest integer not above `x`.
    Floor,
    /// Smallest integer not below `x`.
    Ceil,
    /// `x * x`
    Square,
    /// `sqrt(x)`
    Sqrt,
    /// `1 / sqrt(x)`
    Rsqrt,
    /// `e^x`
    Exp,
    /// Natural logarithm.
    Log,
    /// Base-10 logarithm.
    Log10,
    /// `sin(x)`
    Sin,
    /// `cos(x)`
    Cos,
    /// `tan(x)`
    Tan,
    /// `asin(x)`
    Asin,
    /// `acos(x)`
    Acos,
    /// `atan(x)`
    Atan,
    /// `1 / x`
    Reciprocal,
    /// `tanh(x)`
    Tanh,
    /// Round to nearest, ties to even.
    Round,
    /// Round toward zero.
    Trunc,
}

type ScalarFn = fn(f32) -> f32;

/// Lifts a scalar kernel to a 4-lane block kernel.
fn wide_of(f: ScalarFn) -> impl Fn(&mut [f32]) + Send + Sync {
    move |v| {
        for x in v.iter_mut() {
            *x = f(*x);
        }
    }
}

impl UnaryOp {
    fn scalar_kernel(self) -> ScalarFn {
        match self {
            UnaryOp::Abs => f32::abs,
            UnaryOp::Neg => |x| -x,
            UnaryOp::Floor => f32::floor,
            UnaryOp::Ceil => f32::ceil,
            UnaryOp::Square => |x| x * x,
            UnaryOp::Sqrt => f32::sqrt,
            UnaryOp::Rsqrt => |x| 1.0 / x.sqrt(),
            UnaryOp::Exp => f32::exp,
            UnaryOp::Log => f32::ln,
            UnaryOp::Log10 => f32::log10,
            UnaryOp::Sin => f32::sin,
            UnaryOp::Cos => f32::cos,
            UnaryOp::Tan => f32::tan,
            UnaryOp::Asin => f32::asin,
            UnaryOp::Acos => f32::acos,
            UnaryOp::Atan => f32::atan,
            UnaryOp::Reciprocal => |x| 1.0 / x,
            UnaryOp::Tanh => f32::tanh,
            UnaryOp::Round => f32::round_ties_even,
            UnaryOp::Trunc => f32::trunc,
        }
    }
}

/// Applies one [`UnaryOp`] to every scalar of the input, in place.
pub struct Unary {
    /// The operation to apply.
    pub op: UnaryOp,
}

impl Unary {
    /// A unary layer applying `op`.
    pub fn new(op: UnaryOp) -> Self {
        Self { op }
    }
}

impl Layer<f32> for Unary {
    fn name(&self) -> &'static str {
        "Unary"
    }

    fn support_packing(&self) -> bool {
        true
    }

    fn forward(&self, inputs: &[Tensor<f32>], opt: &Options) -> Result<Vec<Tensor<f32>>, OpsError> {
        if inputs.len() != 1 {
            return Err(OpsError::InvalidInputCount {
                expected: 1,
                actual: inputs.len(),
            });
        }
        let mut out = inputs[0].deep_clone(&opt.blob_allocator)?;
        self.forward_inplace(&mut out, opt)?;
        Ok(vec![out])
    }

    fn forward_inplace(&self, blob: &mut Tensor<f32>, opt: &Options) -> Result<(), OpsError> {
        let scalar = self.op.scalar_kernel();
        let wide = wide_of(scalar);
        let plane = blob.cstep;
        for_each_plane_mut(blob.as_slice_mut(), plane, opt.num_threads, |_, data| {
            let mut chunks = data.chunks_exact_mut(4);
            for chunk in &mut chunks {
                wide(chunk);
            }
            for x in chunks.into_remainder() {
                *x = scalar(*x);
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

    fn run(op: UnaryOp, input: Vec<f32>) -> Vec<f32> {
        let w = input.len();
        let mut t = Tensor::from_vec_1d(w, 1, input, &cpu_allocator()).unwrap();
        Unary::new(op)
            .forward_inplace(&mut t, &Options::default())
            .unwrap();
        t.as_slice().to_vec()
    }

    #[test]
    fn abs_neg_square() {
        assert_eq!(run(UnaryOp::Abs, vec![-2.0, 3.0]), vec![2.0, 3.0]);
        assert_eq!(run(UnaryOp::Neg, vec![-2.0, 3.0]), vec![2.0, -3.0]);
        assert_eq!(run(UnaryOp::Square, vec![-2.0, 3.0]), vec![4.0, 9.0]);
    }

    #[test]
    fn round_is_ties_to_even() {
        assert_eq!(
            run(UnaryOp::Round, vec![0.5, 1.5, 2.5, -0.5, -1.5]),
            vec![0.0, 2.0, 2.0, -0.0, -2.0]
        );
    }

    #[test]
    fn transcendentals_match_std() {
        let input: Vec<f32> = vec![0.1, 0.5, 0.9, 1.3, 1.7];
        for (op, reference) in [
            (UnaryOp::Exp, f32::exp as fn(f32) -> f32),
            (UnaryOp::Log, f32::ln),
            (UnaryOp::Sin, f32::sin),
            (UnaryOp::Tanh, f32::tanh),
            (UnaryOp::Rsqrt, |x: f32| 1.0 / x.sqrt()),
        ] {
            let got = run(op, input.clone());
            for (g, &x) in got.iter().zip(&input) {
                assert_relative_eq!(*g, reference(x), max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn wide_and_tail_lanes_agree() {
        // 7 elements: one full 4-lane block plus a 3-element scalar tail.
        let input: Vec<f32> = (0..7).map(|x| x as f32 * 0.3 - 1.0).collect();
        let got = run(UnaryOp::Tanh, input.clone());
        for (g, x) in got.iter().zip(&input) {
            assert_relative_eq!(*g, x.tanh(), max_relative = 1e-6);
        }
    }

    #[test]
    fn packed_input_is_transparent() {
        let data: Vec<f32> = (0..16).map(|x| x as f32 - 8.0).collect();
        let mut t = Tensor::from_vec_3d(2, 2, 1, 4, data.clone(), &cpu_allocator()).unwrap();
        Unary::new(UnaryOp::Abs)
            .forward_inplace(&mut t, &Options::default())
            .unwrap();
        let expect: Vec<f32> = data.iter().map(|x| x.abs()).collect();
        assert_eq!(t.as_slice(), &expect[..]);
    }

    #[test]
    fn forward_does_not_touch_input() {
        let data = vec![-1.0f32, -2.0, -3.0, -4.0];
        let t = Tensor::from_vec_1d(4, 1, data.clone(), &cpu_allocator()).unwrap();
        let out = &Unary::new(UnaryOp::Abs)
            .forward(&[t.clone()], &Options::default())
            .unwrap()[0];
        assert_eq!(t.as_slice(), &data[..]);
        assert_eq!(out.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
