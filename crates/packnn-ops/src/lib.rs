#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// convolution operators module.
pub mod conv;

/// crop operator module.
pub mod crop;

/// dequantization module.
pub mod dequantize;

/// operator error module.
pub mod error;

/// bicubic resize module.
pub mod interp;

/// layer contract and per-call options module.
pub mod layer;

/// packing conversion module.
pub mod packing;

/// border padding module.
pub mod padding;

/// parallel helpers module.
pub mod parallel;

/// crop region resolution module.
pub mod region;

/// roi pooling module.
pub mod roi_pool;

/// softmax module.
pub mod softmax;

/// elementwise unary math module.
pub mod unary;

pub use crate::conv::{ConvParams, Convolution, Deconvolution};
pub use crate::crop::Crop;
pub use crate::dequantize::Dequantize;
pub use crate::error::OpsError;
pub use crate::interp::Interp;
pub use crate::layer::{Layer, Options};
pub use crate::packing::convert_packing;
pub use crate::region::{CropRegion, Region, RegionError, ScaledRoi, TO_END};
pub use crate::roi_pool::RoiPooling;
pub use crate::softmax::Softmax;
pub use crate::unary::{Unary, UnaryOp};
