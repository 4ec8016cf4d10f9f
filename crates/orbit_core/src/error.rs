//! Structural errors raised by the core layers.
//!
//! Numerical trouble (a singular block, GMRES hitting its cap) is never an
//! error here; it travels as a `converged` flag instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrbitError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("periodic orbits need at least 2 time slices, got {0}")]
    TooFewSlices(usize),

    #[error("period must be positive and finite, got {0}")]
    InvalidPeriod(f64),

    #[error("sparsity pattern changed: entry ({row}, {col}) is not part of the preallocated jacobian")]
    PatternMismatch { row: usize, col: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

pub type Result<T> = std::result::Result<T, OrbitError>;

pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(OrbitError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
