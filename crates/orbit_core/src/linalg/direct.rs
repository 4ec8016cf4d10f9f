use super::{LinearOperator, LinearSolver, SolveOutcome};
use crate::error::{check_len, Result};
use nalgebra::{DMatrix, DVector};

/// LU factorization of the assembled operator.
///
/// Meant for small systems and for validating the structured solvers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

impl<Op: LinearOperator + ?Sized> LinearSolver<Op> for DirectSolver {
    fn solve(&self, op: &Op, rhs: &DVector<f64>) -> Result<SolveOutcome> {
        let dim = op.dim();
        check_len("right-hand side", dim, rhs.len())?;
        let matrix = op.to_sparse()?;
        check_len("operator columns", dim, matrix.ncols())?;

        match DMatrix::from(&matrix).lu().solve(rhs) {
            Some(solution) if solution.iter().all(|v| v.is_finite()) => Ok(SolveOutcome {
                solution,
                converged: true,
                iterations: 1,
            }),
            _ => {
                log::warn!("direct solve failed: matrix of size {dim} is singular");
                Ok(SolveOutcome::failed(dim, 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrbitError;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn solves_simple_system() {
        // 2x + y = 5
        // x + 3y = 6
        let a = dmatrix![2.0, 1.0; 1.0, 3.0];
        let outcome = DirectSolver.solve(&a, &dvector![5.0, 6.0]).unwrap();
        assert!(outcome.converged);
        assert!((outcome.solution[0] - 1.8).abs() < 1e-12);
        assert!((outcome.solution[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported_not_raised() {
        let a = dmatrix![1.0, 2.0; 2.0, 4.0];
        let outcome = DirectSolver.solve(&a, &dvector![1.0, 2.0]).unwrap();
        assert!(!outcome.converged);
    }

    #[test]
    fn rhs_length_mismatch_is_structural() {
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let err = DirectSolver.solve(&a, &dvector![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, OrbitError::DimensionMismatch { .. }));
    }
}
