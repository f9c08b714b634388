//! Crop region resolution.
//!
//! A crop is described per axis by a start and an end in the logical
//! (unpacked) coordinate system. Negative values count from the end of the
//! axis, ONNX-slice style, and everything clamps into `[0, dim]` so a region
//! can never escape the tensor. Ends may also be given as arithmetic
//! expressions over the shapes of the operator inputs, resolved at call time.

use packnn_tensor::TensorShape;
use thiserror::Error;

/// Errors from region resolution.
#[derive(Error, Debug, PartialEq)]
pub enum RegionError {
    /// An axis expression could not be parsed.
    #[error("invalid region expression {expr:?}: {reason}")]
    InvalidExpression {
        /// The offending expression text.
        expr: String,
        /// What went wrong.
        reason: String,
    },

    /// An expression referenced an input that was not supplied.
    #[error("expression references input {index}, but only {count} inputs were given")]
    MissingInput {
        /// Referenced input index.
        index: usize,
        /// Number of inputs supplied.
        count: usize,
    },

    /// The number of per-axis values does not match the tensor rank.
    #[error("expected {expected} axis values, got {actual}")]
    AxisCountMismatch {
        /// Axes in the tensor.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },
}

/// End-of-axis marker for static regions: clamps to the axis size.
pub const TO_END: i64 = i64::MAX;

/// How the crop window is specified. Axis order is `[w, h, d, c]`; axes
/// beyond the tensor rank are ignored.
#[derive(Debug, Clone)]
pub enum CropRegion {
    /// Fixed per-axis starts and ends, resolved against the input shape.
    Static {
        /// Start coordinate per axis; negative counts from the end.
        starts: [i64; 4],
        /// End coordinate per axis (exclusive); [`TO_END`] takes the rest.
        ends: [i64; 4],
    },
    /// Starts and ends given as comma-separated expressions over the shapes
    /// of the operator inputs, e.g. `"1,0"` and `"0w-1,1c"`.
    Expr {
        /// Per-axis start expressions.
        starts: String,
        /// Per-axis end expressions.
        ends: String,
    },
    /// Starts are fixed; extents come from the shape of a second input.
    Reference {
        /// Start coordinate per axis; negative counts from the end.
        starts: [i64; 4],
    },
}

/// A fully resolved crop window in logical coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Start along w.
    pub woffset: usize,
    /// Start along h.
    pub hoffset: usize,
    /// Start along d.
    pub doffset: usize,
    /// Start along c.
    pub coffset: usize,
    /// Output width.
    pub outw: usize,
    /// Output height.
    pub outh: usize,
    /// Output depth.
    pub outd: usize,
    /// Output channels.
    pub outc: usize,
}

impl Region {
    /// Whether the region covers `shape` entirely, making the crop an identity.
    pub fn is_identity(&self, shape: &TensorShape) -> bool {
        self.woffset == 0
            && self.hoffset == 0
            && self.doffset == 0
            && self.coffset == 0
            && self.outw == shape.w
            && self.outh == shape.h
            && self.outd == shape.d
            && self.outc == shape.c
    }

    /// Whether any axis resolved to a zero extent.
    pub fn is_empty(&self) -> bool {
        self.outw == 0 || self.outh == 0 || self.outd == 0 || self.outc == 0
    }
}

fn normalize(v: i64, dim: usize) -> usize {
    let dim_i = dim as i64;
    let v = if v < 0 { v.saturating_add(dim_i) } else { v };
    v.clamp(0, dim_i) as usize
}

fn resolve_axis(start: i64, end: i64, dim: usize) -> (usize, usize) {
    let s = normalize(start, dim);
    let e = normalize(end, dim);
    (s, e.saturating_sub(s))
}

impl CropRegion {
    /// Resolves this region against the shapes of the operator inputs.
    ///
    /// `shapes[0]` is the tensor being cropped; further entries back
    /// expression references and the [`CropRegion::Reference`] extents.
    pub fn resolve(&self, shapes: &[TensorShape]) -> Result<Region, RegionError> {
        let shape = shapes[0];
        let (starts, ends) = match self {
            CropRegion::Static { starts, ends } => (*starts, *ends),
            CropRegion::Expr { starts, ends } => {
                let s = eval_axis_list(starts, shapes, shape.dims, 0)?;
                let e = eval_axis_list(ends, shapes, shape.dims, TO_END)?;
                (s, e)
            }
            CropRegion::Reference { starts } => {
                let reference = shapes.get(1).ok_or(RegionError::MissingInput {
                    index: 1,
                    count: shapes.len(),
                })?;
                let mut ends = [0i64; 4];
                for axis in 0..4 {
                    let s = normalize(starts[axis], shape.axis(axis)) as i64;
                    ends[axis] = s + reference.axis(axis) as i64;
                }
                (*starts, ends)
            }
        };

        let (woffset, outw) = resolve_axis(starts[0], ends[0], shape.w);
        let (hoffset, outh) = resolve_axis(starts[1], ends[1], shape.h);
        let (doffset, outd) = resolve_axis(starts[2], ends[2], shape.d);
        let (coffset, outc) = resolve_axis(starts[3], ends[3], shape.c);

        Ok(Region {
            woffset,
            hoffset,
            doffset,
            coffset,
            outw: if shape.dims >= 1 { outw } else { 1 },
            outh: if shape.dims >= 2 { outh } else { 1 },
            outd: if shape.dims >= 3 { outd } else { 1 },
            outc: if shape.dims >= 3 { outc } else { 1 },
        })
    }
}

/// Evaluates a comma-separated list of axis expressions over the tensor's
/// logical axes: `[w]`, `[w, h]`, `[w, h, c]` or `[w, h, d, c]` depending on
/// rank. Missing or empty entries take `default` (0 for starts, [`TO_END`]
/// for ends).
fn eval_axis_list(
    text: &str,
    shapes: &[TensorShape],
    dims: usize,
    default: i64,
) -> Result<[i64; 4], RegionError> {
    let parts: Vec<&str> = if text.trim().is_empty() {
        Vec::new()
    } else {
        text.split(',').map(str::trim).collect()
    };
    if parts.len() > dims {
        return Err(RegionError::AxisCountMismatch {
            expected: dims,
            actual: parts.len(),
        });
    }
    let mut out = [default; 4];
    for (i, part) in parts.iter().enumerate() {
        // A 3-D tensor has no depth axis; its third entry is the channel.
        let axis = if dims == 3 && i == 2 { 3 } else { i };
        if part.is_empty() {
            continue;
        }
        out[axis] = eval_expr(part, shapes)?;
    }
    Ok(out)
}

/// Evaluates a single axis expression.
///
/// Grammar:
///
/// ```text
/// expr    := term (('+' | '-') term)*
/// term    := unary (('*' | '/') unary)*
/// unary   := '-' unary | primary
/// primary := INT | REF | '(' expr ')' | ('min' | 'max') '(' expr ',' expr ')'
/// REF     := INT ('w' | 'h' | 'd' | 'c')
/// ```
///
/// A reference like `0w` or `1c` reads that axis from the shape of the
/// numbered operator input.
pub fn eval_expr(text: &str, shapes: &[TensorShape]) -> Result<i64, RegionError> {
    let mut parser = ExprParser {
        bytes: text.as_bytes(),
        pos: 0,
        text,
        shapes,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.bytes.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct ExprParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    text: &'a str,
    shapes: &'a [TensorShape],
}

impl<'a> ExprParser<'a> {
    fn error(&self, reason: &str) -> RegionError {
        RegionError::InvalidExpression {
            expr: self.text.to_owned(),
            reason: reason.to_owned(),
        }
    }

    fn skip_ws(&mut self) {
        while self.bytes.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<i64, RegionError> {
        let mut value = self.term()?;
        loop {
            if self.eat(b'+') {
                value += self.term()?;
            } else if self.eat(b'-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<i64, RegionError> {
        let mut value = self.unary()?;
        loop {
            if self.eat(b'*') {
                value *= self.unary()?;
            } else if self.eat(b'/') {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(self.error("division by zero"));
                }
                value /= rhs;
            } else {
                return Ok(value);
            }
        }
    }

    fn unary(&mut self) -> Result<i64, RegionError> {
        if self.eat(b'-') {
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, RegionError> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                if !self.eat(b')') {
                    return Err(self.error("expected ')'"));
                }
                Ok(value)
            }
            Some(b'0'..=b'9') => self.number_or_ref(),
            Some(b'm') => self.min_max(),
            _ => Err(self.error("expected a number, reference or '('")),
        }
    }

    fn number_or_ref(&mut self) -> Result<i64, RegionError> {
        let start = self.pos;
        while matches!(self.bytes.get(self.pos), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let digits: i64 = self.text[start..self.pos]
            .parse()
            .map_err(|_| self.error("number out of range"))?;
        let axis = match self.bytes.get(self.pos) {
            Some(b'w') => 0,
            Some(b'h') => 1,
            Some(b'd') => 2,
            Some(b'c') => 3,
            _ => return Ok(digits),
        };
        self.pos += 1;
        let index = digits as usize;
        let shape = self.shapes.get(index).ok_or(RegionError::MissingInput {
            index,
            count: self.shapes.len(),
        })?;
        Ok(shape.axis(axis) as i64)
    }

    fn min_max(&mut self) -> Result<i64, RegionError> {
        let rest = &self.text[self.pos..];
        let is_min = rest.starts_with("min");
        if !is_min && !rest.starts_with("max") {
            return Err(self.error("expected 'min' or 'max'"));
        }
        self.pos += 3;
        if !self.eat(b'(') {
            return Err(self.error("expected '(' after min/max"));
        }
        let a = self.expr()?;
        if !self.eat(b',') {
            return Err(self.error("expected ',' in min/max"));
        }
        let b = self.expr()?;
        if !self.eat(b')') {
            return Err(self.error("expected ')' in min/max"));
        }
        Ok(if is_min { a.min(b) } else { a.max(b) })
    }
}

/// An ROI rectangle scaled from image to feature-map coordinates.
///
/// Built from a 4-scalar `[x1, y1, x2, y2]` tensor; coordinates are rounded
/// after scaling and the window is never smaller than 1×1.
#[derive(Debug, Clone, Copy)]
pub struct ScaledRoi {
    /// Left edge on the feature map.
    pub x1: isize,
    /// Top edge on the feature map.
    pub y1: isize,
    /// Window width, at least 1.
    pub width: usize,
    /// Window height, at least 1.
    pub height: usize,
}

impl ScaledRoi {
    /// Scales the image-space corners by `spatial_scale` and rounds.
    pub fn from_corners(corners: &[f32], spatial_scale: f32) -> Self {
        let x1 = (corners[0] * spatial_scale).round() as isize;
        let y1 = (corners[1] * spatial_scale).round() as isize;
        let x2 = (corners[2] * spatial_scale).round() as isize;
        let y2 = (corners[3] * spatial_scale).round() as isize;
        Self {
            x1,
            y1,
            width: (x2 - x1 + 1).max(1) as usize,
            height: (y2 - y1 + 1).max(1) as usize,
        }
    }
}
