//! Trapezoidal discretization of periodic orbits.
//!
//! A periodic orbit of x' = F(x, p) is represented by M time slices and the
//! period T. The functional ([`PeriodicOrbitProblem`]) couples consecutive
//! slices with the trapezoidal rule, closes the cycle and pins the phase.
//! Its Jacobian is available as sparse matrices ([`JacobianKind`]) or as the
//! structured [`BorderedJacobian`], which only needs solves with the cyclic
//! operator [`CyclicOperator`].

mod bordered;
mod cyclic;
mod jacobian;
mod orbit;
mod problem;

pub use bordered::BorderedJacobian;
pub use cyclic::{CyclicInverse, CyclicMode, CyclicOperator};
pub use jacobian::CyclicBlocks;
pub use orbit::OrbitVector;
pub use problem::{PeriodicOrbitProblem, DEFAULT_PERIOD_STEP};

use serde::{Deserialize, Serialize};

/// Which sparse form of the Jacobian to build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum JacobianKind {
    /// The full (N·M+1)² matrix.
    #[default]
    FullSparse,
    /// The full matrix, refreshed by overwriting the values of an existing
    /// matrix with the same pattern.
    FullSparseInplace,
    /// The N·(M-1) square cyclic core.
    CyclicSparse,
    /// The diagonal blocks of the cyclic core.
    BlockDiagonalSparse,
}
