pub mod autodiff;
pub mod bordering;
pub mod continuation;
pub mod error;
pub mod linalg;
pub mod periodic;
pub mod solvers;
/// The `orbit_core` crate computes periodic orbits of autonomous ODEs with a
/// trapezoidal discretization and structured (bordered) linear algebra.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `DynamicalSystem` (scalar-generic
///   vector fields) and `VectorField` (the F / dF·dx / d²F oracle).
/// - **Periodic**: the trapezoidal functional, its sparse Jacobians, the cyclic operator Aγ
///   and the bordered Jacobian adapter.
/// - **Bordering**: solvers for `[J a; bᵀ c]` systems around any linear operator.
/// - **Linalg**: the operator/solver contract, direct LU, restarted GMRES, block-Jacobi.
/// - **Autodiff**: Dual numbers and the `ForwardDiff` oracle.
/// - **Solvers**: RK4 and trajectory sampling for initial guesses.
/// - **Continuation**: Newton and pseudo-arclength drivers.
pub mod traits;

pub use error::{OrbitError, Result};
