use packnn_tensor::TensorError;
use thiserror::Error;

use crate::region::RegionError;

/// Errors that can occur while running an operator.
#[derive(Error, Debug)]
pub enum OpsError {
    /// A tensor operation failed; allocation failures travel through this
    /// variant and are propagated immediately, never retried.
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// A crop/slice region could not be resolved.
    #[error("region error: {0}")]
    Region(#[from] RegionError),

    /// The operator received the wrong number of inputs.
    #[error("expected {expected} inputs, got {actual}")]
    InvalidInputCount {
        /// Inputs required by the operator.
        expected: usize,
        /// Inputs actually supplied.
        actual: usize,
    },

    /// The operator does not implement the requested configuration.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}
