//! The cyclic operator Aγ: the state block of the trapezoidal Jacobian.
//!
//! ```text
//! [ D_0   0   ...  γS_0  0 ] [x_0    ]
//! [ S_1  D_1  ...   0    0 ] [x_1    ]
//! [ ...                    ] [...    ]
//! [  0   ...  S_K  D_K   0 ] [x_{K-1}]
//! [ -γI   0   ...   0    I ] [x_last ]
//! ```
//!
//! With γ = 1 this is exactly the leading N·M block of the full Jacobian.
//! Inverting it only requires solving the cyclic core; the closure block
//! recovers `x_last = γ x_0 + r_last`.

use super::jacobian::CyclicBlocks;
use super::orbit::OrbitVector;
use super::problem::PeriodicOrbitProblem;
use crate::error::{check_len, OrbitError, Result};
use crate::linalg::{
    BlockJacobi, FnOperator, Gmres, LinearOperator, LinearSolver, Preconditioner, SolveOutcome,
    SolverContext,
};
use crate::traits::VectorField;
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CyclicMode {
    /// Assemble the blocks and factor them.
    #[default]
    Matrix,
    /// Only Jacobian actions; inverted with preconditioned GMRES.
    MatrixFree,
}

/// Factorization of the cyclic core, built on first use.
enum CyclicFactorization {
    /// Block elimination around the cycle: every slice is expressed in terms
    /// of the last one, `x_i = p_i + Q_i x_{K-1}`, which leaves one N×N
    /// system `(I - Q_{K-1}) x_{K-1} = p_{K-1}`.
    Condensed {
        diag: Vec<LU<f64, Dyn, Dyn>>,
        sub: Vec<DMatrix<f64>>,
        transfer: Vec<DMatrix<f64>>,
        closing: LU<f64, Dyn, Dyn>,
    },
    /// LU of the assembled core, used when condensation breaks down.
    Dense(LU<f64, Dyn, Dyn>),
    Singular,
}

impl CyclicFactorization {
    fn build(blocks: &CyclicBlocks, matrix: &CscMatrix<f64>) -> Self {
        if blocks.len() > 1 {
            if let Some(condensed) = Self::condense(blocks) {
                return condensed;
            }
            log::debug!("cyclic condensation hit a singular block, using dense LU");
        }
        let lu = DMatrix::from(matrix).lu();
        if lu.is_invertible() {
            Self::Dense(lu)
        } else {
            log::warn!("cyclic core of size {} is singular", matrix.nrows());
            Self::Singular
        }
    }

    fn condense(blocks: &CyclicBlocks) -> Option<Self> {
        let n = blocks.dim();
        let k = blocks.len();
        let mut diag = Vec::with_capacity(k);
        let mut transfer: Vec<DMatrix<f64>> = Vec::with_capacity(k);
        for i in 0..k {
            let lu = blocks.diag[i].clone().lu();
            if !lu.is_invertible() {
                return None;
            }
            // Q_0 = -D_0⁻¹ S_0, Q_i = -D_i⁻¹ S_i Q_{i-1}
            let coupling = match transfer.last() {
                None => -&blocks.sub[i],
                Some(q) => -(&blocks.sub[i] * q),
            };
            transfer.push(lu.solve(&coupling)?);
            diag.push(lu);
        }
        let closing = (DMatrix::<f64>::identity(n, n) - &transfer[k - 1]).lu();
        if !closing.is_invertible() {
            return None;
        }
        Some(Self::Condensed {
            diag,
            sub: blocks.sub.clone(),
            transfer,
            closing,
        })
    }

    fn solve(&self, n: usize, rhs: &[f64]) -> Option<Vec<f64>> {
        match self {
            Self::Condensed {
                diag,
                sub,
                transfer,
                closing,
            } => {
                let k = diag.len();
                let mut particular: Vec<DVector<f64>> = Vec::with_capacity(k);
                for i in 0..k {
                    let mut r = DVector::from_column_slice(&rhs[i * n..(i + 1) * n]);
                    if let Some(p) = particular.last() {
                        r -= &sub[i] * p;
                    }
                    particular.push(diag[i].solve(&r)?);
                }
                let tail = closing.solve(&particular[k - 1])?;
                let mut x = vec![0.0; n * k];
                for i in 0..k {
                    let xi = if i == k - 1 {
                        tail.clone()
                    } else {
                        &particular[i] + &transfer[i] * &tail
                    };
                    x[i * n..(i + 1) * n].copy_from_slice(xi.as_slice());
                }
                Some(x)
            }
            Self::Dense(lu) => lu
                .solve(&DVector::from_column_slice(rhs))
                .map(|v| v.as_slice().to_vec()),
            Self::Singular => None,
        }
    }
}

/// Aγ linearized at a base orbit vector.
pub struct CyclicOperator<'a, F> {
    problem: &'a PeriodicOrbitProblem<F>,
    base: OrbitVector,
    gamma: f64,
    mode: CyclicMode,
    blocks: Option<CyclicBlocks>,
    matrix: Option<CscMatrix<f64>>,
    factorization: RefCell<Option<CyclicFactorization>>,
    preconditioner: RefCell<Option<BlockJacobi>>,
}

impl<'a, F: VectorField> CyclicOperator<'a, F> {
    pub fn new(
        problem: &'a PeriodicOrbitProblem<F>,
        base: &OrbitVector,
        mode: CyclicMode,
        gamma: f64,
    ) -> Result<Self> {
        let mut op = Self {
            problem,
            base: base.clone(),
            gamma,
            mode,
            blocks: None,
            matrix: None,
            factorization: RefCell::new(None),
            preconditioner: RefCell::new(None),
        };
        op.update(problem, base)?;
        Ok(op)
    }

    /// Move to a new base point. Cached factorizations are dropped and
    /// rebuilt on the next inverse.
    pub fn update(&mut self, problem: &'a PeriodicOrbitProblem<F>, base: &OrbitVector) -> Result<()> {
        problem.check_orbit(base)?;
        self.problem = problem;
        self.base = base.clone();
        self.factorization.replace(None);
        self.preconditioner.replace(None);
        if self.mode == CyclicMode::Matrix {
            let blocks = problem.cyclic_blocks(base, self.gamma)?;
            self.matrix = Some(blocks.to_sparse());
            self.blocks = Some(blocks);
        }
        Ok(())
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn mode(&self) -> CyclicMode {
        self.mode
    }

    pub fn base(&self) -> &OrbitVector {
        &self.base
    }

    pub fn problem(&self) -> &'a PeriodicOrbitProblem<F> {
        self.problem
    }

    fn cyclic_len(&self) -> usize {
        self.problem.dim() * self.problem.cyclic_slices()
    }

    /// Solve Aγ x = rhs for a right-hand side of length N·M.
    pub fn apply_inverse(&self, rhs: &DVector<f64>, ctx: &SolverContext) -> Result<SolveOutcome> {
        let n = self.problem.dim();
        let len = self.cyclic_len();
        check_len("cyclic right-hand side", len + n, rhs.len())?;
        let rhs_cyclic = &rhs.as_slice()[..len];

        let (cyclic, converged, iterations) = match (&self.blocks, &self.matrix) {
            (Some(blocks), Some(matrix)) => {
                let mut cache = self.factorization.borrow_mut();
                let factorization =
                    cache.get_or_insert_with(|| CyclicFactorization::build(blocks, matrix));
                match factorization.solve(n, rhs_cyclic) {
                    Some(x) if x.iter().all(|v| v.is_finite()) => (x, true, 1),
                    _ => (vec![0.0; len], false, 1),
                }
            }
            _ => {
                let outcome = self.solve_matrix_free(rhs_cyclic, ctx)?;
                (
                    outcome.solution.as_slice().to_vec(),
                    outcome.converged,
                    outcome.iterations,
                )
            }
        };
        if !converged {
            log::warn!(
                "cyclic inverse ({:?}) failed after {} iterations",
                self.mode,
                iterations
            );
        }

        let mut solution = DVector::zeros(len + n);
        solution.as_mut_slice()[..len].copy_from_slice(&cyclic);
        for j in 0..n {
            solution[len + j] = self.gamma * cyclic[j] + rhs[len + j];
        }
        Ok(SolveOutcome {
            solution,
            converged,
            iterations,
        })
    }

    fn solve_matrix_free(&self, rhs: &[f64], ctx: &SolverContext) -> Result<SolveOutcome> {
        let mut cache = self.preconditioner.borrow_mut();
        if cache.is_none() {
            let diagonal = self
                .problem
                .cyclic_blocks(&self.base, self.gamma)?
                .block_diagonal();
            *cache = Some(BlockJacobi::from_block_diagonal(&diagonal, self.problem.dim())?);
        }
        let operator = FnOperator::new(self.cyclic_len(), |x: &[f64], y: &mut [f64]| {
            self.problem
                .apply_cyclic_unchecked(&self.base, x, self.gamma, y)
        });
        let precond = cache.as_ref().map(|p| p as &dyn Preconditioner);
        Ok(Gmres::new(ctx.gmres).solve_with(&operator, rhs, precond))
    }
}

impl<F: VectorField> LinearOperator for CyclicOperator<'_, F> {
    fn dim(&self) -> usize {
        self.problem.dim() * self.problem.mesh()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let n = self.problem.dim();
        let len = self.cyclic_len();
        match &self.matrix {
            Some(matrix) => matrix.apply(&x[..len], &mut y[..len]),
            None => self
                .problem
                .apply_cyclic_unchecked(&self.base, &x[..len], self.gamma, &mut y[..len]),
        }
        for j in 0..n {
            y[len + j] = x[len + j] - self.gamma * x[j];
        }
    }

    /// Matrix mode only.
    fn to_sparse(&self) -> Result<CscMatrix<f64>> {
        let matrix = self.matrix.as_ref().ok_or_else(|| {
            OrbitError::Unsupported(
                "matrix-free cyclic operator has no assembled form".to_string(),
            )
        })?;
        let n = self.problem.dim();
        let len = self.cyclic_len();
        let mut coo = CooMatrix::new(len + n, len + n);
        for (i, j, v) in matrix.triplet_iter() {
            coo.push(i, j, *v);
        }
        for j in 0..n {
            coo.push(len + j, len + j, 1.0);
            coo.push(len + j, j, -self.gamma);
        }
        Ok(CscMatrix::from(&coo))
    }
}

/// [`LinearSolver`] adapter that inverts a cyclic operator with its own
/// structured solve.
pub struct CyclicInverse<'c> {
    pub ctx: &'c SolverContext,
}

impl<F: VectorField> LinearSolver<CyclicOperator<'_, F>> for CyclicInverse<'_> {
    fn solve(&self, op: &CyclicOperator<'_, F>, rhs: &DVector<f64>) -> Result<SolveOutcome> {
        op.apply_inverse(rhs, self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{DirectSolver, GmresConfig};
    use crate::periodic::JacobianKind;
    use crate::traits::FnField;

    fn field() -> impl VectorField + Clone {
        // Lienard-type oscillator with a non-symmetric Jacobian
        FnField::new(
            2,
            |x: &[f64], p: &[f64], out: &mut [f64]| {
                out[0] = x[1];
                out[1] = -x[0] + p[0] * (1.0 - x[0] * x[0]) * x[1];
            },
            |x: &[f64], p: &[f64], dx: &[f64], out: &mut [f64]| {
                out[0] = dx[1];
                out[1] = (-1.0 - 2.0 * p[0] * x[0] * x[1]) * dx[0]
                    + p[0] * (1.0 - x[0] * x[0]) * dx[1];
            },
        )
    }

    fn setup(mesh: usize) -> (PeriodicOrbitProblem<impl VectorField + Clone>, OrbitVector) {
        let problem =
            PeriodicOrbitProblem::new(field(), vec![0.7], mesh, vec![2.0, 0.0], vec![1.0, 0.0])
                .unwrap();
        let states: Vec<Vec<f64>> = (0..mesh)
            .map(|i| {
                let th = i as f64 * 0.6;
                vec![2.0 * th.cos() + 0.1, -1.7 * th.sin()]
            })
            .collect();
        (problem, OrbitVector::from_slices(&states, 3.3).unwrap())
    }

    fn rhs(len: usize) -> DVector<f64> {
        DVector::from_fn(len, |i, _| (i as f64 * 0.37).sin() + 0.2)
    }

    fn residual(op: &impl LinearOperator, x: &DVector<f64>, b: &DVector<f64>) -> f64 {
        let mut y = vec![0.0; op.dim()];
        op.apply(x.as_slice(), &mut y);
        (DVector::from_vec(y) - b).amax()
    }

    #[test]
    fn gamma_one_matches_leading_block_of_full_jacobian() {
        let (problem, u) = setup(6);
        let op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 1.0).unwrap();
        let full = DMatrix::from(&problem.jacobian(&u, JacobianKind::FullSparse).unwrap());
        let dense = DMatrix::from(&op.to_sparse().unwrap());
        let size = op.dim();
        assert!((full.view((0, 0), (size, size)) - dense).amax() < 1e-15);
    }

    #[test]
    fn condensed_inverse_solves_the_operator() {
        for gamma in [1.0, 0.5, -2.0] {
            let (problem, u) = setup(9);
            let op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, gamma).unwrap();
            let b = rhs(op.dim());
            let outcome = op.apply_inverse(&b, &SolverContext::default()).unwrap();
            assert!(outcome.converged);
            assert!(residual(&op, &outcome.solution, &b) < 1e-10, "gamma {gamma}");
            assert!(matches!(
                op.factorization.borrow().as_ref(),
                Some(CyclicFactorization::Condensed { .. })
            ));
        }
    }

    #[test]
    fn single_cyclic_slice_uses_dense_factorization() {
        let (problem, u) = setup(2);
        let op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 1.0).unwrap();
        let b = rhs(4);
        let outcome = op.apply_inverse(&b, &SolverContext::default()).unwrap();
        assert!(outcome.converged);
        assert!(residual(&op, &outcome.solution, &b) < 1e-12);
        assert!(matches!(
            op.factorization.borrow().as_ref(),
            Some(CyclicFactorization::Dense(_))
        ));
    }

    #[test]
    fn matrix_free_inverse_agrees_with_matrix_mode() {
        let (problem, u) = setup(8);
        let ctx = SolverContext {
            gmres: GmresConfig {
                max_iter: 300,
                tol: 1e-13,
                restart: 30,
            },
            ..Default::default()
        };
        let matrix = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 1.0).unwrap();
        let free = CyclicOperator::new(&problem, &u, CyclicMode::MatrixFree, 1.0).unwrap();
        let b = rhs(matrix.dim());

        let mut y_matrix = vec![0.0; b.len()];
        let mut y_free = vec![0.0; b.len()];
        matrix.apply(b.as_slice(), &mut y_matrix);
        free.apply(b.as_slice(), &mut y_free);
        for i in 0..b.len() {
            assert!((y_matrix[i] - y_free[i]).abs() < 1e-13);
        }

        let exact = matrix.apply_inverse(&b, &ctx).unwrap();
        let iterative = free.apply_inverse(&b, &ctx).unwrap();
        assert!(iterative.converged);
        assert!(iterative.iterations > 0);
        assert!((&exact.solution - &iterative.solution).amax() < 1e-8);
        assert!(matches!(free.to_sparse(), Err(OrbitError::Unsupported(_))));
    }

    #[test]
    fn inverse_agrees_with_direct_solve() {
        let (problem, u) = setup(5);
        let op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 0.8).unwrap();
        let b = rhs(op.dim());
        let ctx = SolverContext::default();
        let structured = CyclicInverse { ctx: &ctx }.solve(&op, &b).unwrap();
        let direct = DirectSolver.solve(&op, &b).unwrap();
        assert!((&structured.solution - &direct.solution).amax() < 1e-10);
    }

    #[test]
    fn update_discards_cached_factorization() {
        let (problem, u) = setup(5);
        let mut op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 1.0).unwrap();
        let b = rhs(op.dim());
        op.apply_inverse(&b, &SolverContext::default()).unwrap();
        assert!(op.factorization.borrow().is_some());

        let moved = u.with_values(u.as_vector() * 0.9).unwrap();
        op.update(&problem, &moved).unwrap();
        assert!(op.factorization.borrow().is_none());
        let outcome = op.apply_inverse(&b, &SolverContext::default()).unwrap();
        assert!(residual(&op, &outcome.solution, &b) < 1e-10);
    }

    #[test]
    fn wrong_rhs_length_is_structural() {
        let (problem, u) = setup(4);
        let op = CyclicOperator::new(&problem, &u, CyclicMode::Matrix, 1.0).unwrap();
        let err = op
            .apply_inverse(&DVector::zeros(3), &SolverContext::default())
            .unwrap_err();
        assert!(matches!(err, OrbitError::DimensionMismatch { .. }));
    }
}
