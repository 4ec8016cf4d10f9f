//! Linear operators and the solver contract shared by every layer.
//!
//! A solver takes an operator and a right-hand side and returns
//! `(solution, converged, iterations)`. Numerical failure is reported through
//! the flag; only structural problems (wrong lengths, an operator that cannot
//! be assembled) surface as errors.

mod direct;
mod gmres;
mod precond;

pub use direct::DirectSolver;
pub use gmres::{Gmres, GmresConfig};
pub use precond::{BlockJacobi, Preconditioner};

use crate::bordering::BorderingOptions;
use crate::error::{OrbitError, Result};
use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use nalgebra_sparse::CscMatrix;
use serde::{Deserialize, Serialize};

/// A square linear map y = A x.
pub trait LinearOperator {
    fn dim(&self) -> usize;

    /// Apply the operator: y = A * x. Both slices have length `dim()`.
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// Materialize the operator. Matrix-free operators refuse.
    fn to_sparse(&self) -> Result<CscMatrix<f64>> {
        Err(OrbitError::Unsupported(
            "operator has no assembled representation".to_string(),
        ))
    }
}

/// Outcome of one linear solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub solution: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

impl SolveOutcome {
    pub(crate) fn failed(dim: usize, iterations: usize) -> Self {
        Self {
            solution: DVector::zeros(dim),
            converged: false,
            iterations,
        }
    }
}

/// `solve(operator, rhs) -> (solution, converged, iterations)`.
pub trait LinearSolver<Op: ?Sized> {
    fn solve(&self, op: &Op, rhs: &DVector<f64>) -> Result<SolveOutcome>;
}

/// Solver configuration threaded explicitly through update/solve calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverContext {
    #[serde(default)]
    pub gmres: GmresConfig,
    #[serde(default)]
    pub bordering: BorderingOptions,
}

/// A matrix-free operator defined by a closure.
pub struct FnOperator<G> {
    dim: usize,
    map: G,
}

impl<G: Fn(&[f64], &mut [f64])> FnOperator<G> {
    pub fn new(dim: usize, map: G) -> Self {
        Self { dim, map }
    }
}

impl<G: Fn(&[f64], &mut [f64])> LinearOperator for FnOperator<G> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        (self.map)(x, y)
    }
}

impl LinearOperator for CscMatrix<f64> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let product = self * &DVector::from_column_slice(x);
        y.copy_from_slice(product.as_slice());
    }

    fn to_sparse(&self) -> Result<CscMatrix<f64>> {
        Ok(self.clone())
    }
}

impl LinearOperator for DMatrix<f64> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let mut out = DVectorViewMut::from_slice(y, self.nrows());
        out.gemv(1.0, self, &DVectorView::from_slice(x, self.ncols()), 0.0);
    }

    fn to_sparse(&self) -> Result<CscMatrix<f64>> {
        Ok(CscMatrix::from(self))
    }
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    #[test]
    fn sparse_and_dense_operators_agree() {
        let dense = dmatrix![2.0, 0.0, 1.0; 0.0, 3.0, 0.0; -1.0, 0.0, 4.0];
        let sparse = dense.to_sparse().expect("dense matrices assemble");
        assert_eq!(sparse.nnz(), 5);

        let x = [1.0, -2.0, 0.5];
        let mut y_dense = [0.0; 3];
        let mut y_sparse = [0.0; 3];
        dense.apply(&x, &mut y_dense);
        sparse.apply(&x, &mut y_sparse);
        for i in 0..3 {
            assert!((y_dense[i] - y_sparse[i]).abs() < 1e-15);
        }
        assert_eq!(DMatrix::from(&sparse), dense);
    }

    #[test]
    fn closure_operators_cannot_be_assembled() {
        let op = FnOperator::new(2, |x: &[f64], y: &mut [f64]| {
            y[0] = x[1];
            y[1] = x[0];
        });
        let mut y = [0.0; 2];
        op.apply(&[3.0, 4.0], &mut y);
        assert_eq!(y, [4.0, 3.0]);
        assert!(matches!(op.to_sparse(), Err(OrbitError::Unsupported(_))));
    }
}
