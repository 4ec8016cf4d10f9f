//! Solvers for bordered systems
//!
//! ```text
//! [ J      a    ] [dX]   [R]
//! [ ξu·bᵀ  ξp·c ] [dl] = [n]
//! ```
//!
//! where J is any [`LinearOperator`]. The weights (ξu, ξp) default to one;
//! pseudo-arclength correctors use (θ, 1-θ) to balance state-space distance
//! against parameter distance.

use crate::error::{check_len, OrbitError, Result};
use crate::linalg::{
    dot, DirectSolver, Gmres, GmresConfig, LinearOperator, LinearSolver, SolveOutcome,
};
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BorderingMode {
    /// Two inner solves with J followed by scalar elimination.
    #[default]
    Bordering,
    /// Assemble the (n+1)×(n+1) matrix and factor it once.
    FullAssembly,
    /// Hand the augmented map to GMRES without forming J.
    MatrixFree,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BorderingOptions {
    pub mode: BorderingMode,
    /// Weight on the bordering row b.
    pub xi_u: f64,
    /// Weight on the corner entry c.
    pub xi_p: f64,
}

impl Default for BorderingOptions {
    fn default() -> Self {
        Self {
            mode: BorderingMode::Bordering,
            xi_u: 1.0,
            xi_p: 1.0,
        }
    }
}

impl BorderingOptions {
    /// Weights (θ, 1-θ) for a θ-weighted arclength constraint.
    pub fn arclength(mode: BorderingMode, theta: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&theta) {
            return Err(OrbitError::InvalidSetting(format!(
                "arclength weight theta must lie in [0, 1], got {theta}"
            )));
        }
        Ok(Self {
            mode,
            xi_u: theta,
            xi_p: 1.0 - theta,
        })
    }
}

/// The borders and right-hand side of one augmented solve.
#[derive(Debug, Clone, Copy)]
pub struct AugmentedSystem<'a> {
    pub a: &'a DVector<f64>,
    pub b: &'a DVector<f64>,
    pub c: f64,
    pub rhs: &'a DVector<f64>,
    pub n: f64,
}

#[derive(Debug, Clone)]
pub struct BorderedSolution {
    pub dx: DVector<f64>,
    pub dl: f64,
    pub converged: bool,
    /// Iterations of the two inner solves (the second is zero for the
    /// single-solve modes).
    pub iterations: (usize, usize),
}

impl BorderedSolution {
    pub fn total_iterations(&self) -> usize {
        self.iterations.0 + self.iterations.1
    }

    /// The concatenated vector (dX, dl).
    pub fn into_vector(self) -> DVector<f64> {
        let n = self.dx.len();
        let mut full = self.dx.resize_vertically(n + 1, 0.0);
        full[n] = self.dl;
        full
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BorderingSolver {
    pub options: BorderingOptions,
    pub gmres: GmresConfig,
}

impl BorderingSolver {
    pub fn new(options: BorderingOptions, gmres: GmresConfig) -> Self {
        Self { options, gmres }
    }

    /// Solve the augmented system. `inner` is used for the solves with J in
    /// bordering mode; the other modes bring their own solver.
    pub fn solve<Op, S>(
        &self,
        inner: &S,
        op: &Op,
        system: &AugmentedSystem<'_>,
    ) -> Result<BorderedSolution>
    where
        Op: LinearOperator + ?Sized,
        S: LinearSolver<Op> + ?Sized,
    {
        let dim = op.dim();
        check_len("bordering column a", dim, system.a.len())?;
        check_len("bordering row b", dim, system.b.len())?;
        check_len("bordered right-hand side", dim, system.rhs.len())?;

        let solution = match self.options.mode {
            BorderingMode::Bordering => self.solve_bordering(inner, op, system)?,
            BorderingMode::FullAssembly => self.solve_assembled(op, system)?,
            BorderingMode::MatrixFree => self.solve_matrix_free(op, system),
        };
        if !solution.converged {
            log::warn!(
                "bordered solve ({:?}) did not converge after {:?} inner iterations",
                self.options.mode,
                solution.iterations
            );
        }
        Ok(solution)
    }

    fn solve_bordering<Op, S>(
        &self,
        inner: &S,
        op: &Op,
        system: &AugmentedSystem<'_>,
    ) -> Result<BorderedSolution>
    where
        Op: LinearOperator + ?Sized,
        S: LinearSolver<Op> + ?Sized,
    {
        let BorderingOptions { xi_u, xi_p, .. } = self.options;
        let x1 = inner.solve(op, system.rhs)?;
        let x2 = inner.solve(op, system.a)?;

        let denom = xi_p * system.c - xi_u * dot(system.b.as_slice(), x2.solution.as_slice());
        let dl = (system.n - xi_u * dot(system.b.as_slice(), x1.solution.as_slice())) / denom;
        let dx = &x1.solution - &x2.solution * dl;
        let converged = x1.converged && x2.converged && dl.is_finite();

        Ok(BorderedSolution {
            dx,
            dl,
            converged,
            iterations: (x1.iterations, x2.iterations),
        })
    }

    fn solve_assembled<Op>(&self, op: &Op, system: &AugmentedSystem<'_>) -> Result<BorderedSolution>
    where
        Op: LinearOperator + ?Sized,
    {
        let dim = op.dim();
        let matrix = assemble_bordered(&op.to_sparse()?, system, &self.options)?;
        let mut rhs = system.rhs.clone().resize_vertically(dim + 1, 0.0);
        rhs[dim] = system.n;
        let outcome = DirectSolver.solve(&matrix, &rhs)?;
        Ok(split(outcome, dim))
    }

    fn solve_matrix_free<Op>(&self, op: &Op, system: &AugmentedSystem<'_>) -> BorderedSolution
    where
        Op: LinearOperator + ?Sized,
    {
        let dim = op.dim();
        let augmented = AugmentedOperator {
            op,
            system,
            options: &self.options,
        };
        let mut rhs = system.rhs.clone().resize_vertically(dim + 1, 0.0);
        rhs[dim] = system.n;
        let outcome = Gmres::new(self.gmres).solve_with(&augmented, rhs.as_slice(), None);
        split(outcome, dim)
    }
}

/// The literal (n+1)×(n+1) bordered matrix.
pub fn assemble_bordered(
    j: &CscMatrix<f64>,
    system: &AugmentedSystem<'_>,
    options: &BorderingOptions,
) -> Result<CscMatrix<f64>> {
    let dim = j.nrows();
    check_len("operator columns", dim, j.ncols())?;
    let mut coo = CooMatrix::new(dim + 1, dim + 1);
    for (i, col, v) in j.triplet_iter() {
        coo.push(i, col, *v);
    }
    for i in 0..dim {
        coo.push(i, dim, system.a[i]);
        coo.push(dim, i, options.xi_u * system.b[i]);
    }
    coo.push(dim, dim, options.xi_p * system.c);
    Ok(CscMatrix::from(&coo))
}

fn split(outcome: SolveOutcome, dim: usize) -> BorderedSolution {
    let dl = outcome.solution[dim];
    BorderedSolution {
        dx: outcome.solution.rows(0, dim).into_owned(),
        dl,
        converged: outcome.converged && dl.is_finite(),
        iterations: (outcome.iterations, 0),
    }
}

struct AugmentedOperator<'s, Op: ?Sized> {
    op: &'s Op,
    system: &'s AugmentedSystem<'s>,
    options: &'s BorderingOptions,
}

impl<Op: LinearOperator + ?Sized> LinearOperator for AugmentedOperator<'_, Op> {
    fn dim(&self) -> usize {
        self.op.dim() + 1
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let n = self.op.dim();
        let dl = x[n];
        self.op.apply(&x[..n], &mut y[..n]);
        for i in 0..n {
            y[i] += self.system.a[i] * dl;
        }
        y[n] = self.options.xi_u * dot(self.system.b.as_slice(), &x[..n])
            + self.options.xi_p * self.system.c * dl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::FnOperator;
    use nalgebra::DMatrix;

    fn test_matrix(n: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                3.0 + i as f64 * 0.1
            } else {
                ((i * 7 + j * 3) % 5) as f64 * 0.1 - 0.2
            }
        })
    }

    fn borders(n: usize) -> (DVector<f64>, DVector<f64>, DVector<f64>) {
        let a = DVector::from_fn(n, |i, _| (i as f64 * 0.7).cos());
        let b = DVector::from_fn(n, |i, _| 1.0 / (1.0 + i as f64));
        let rhs = DVector::from_fn(n, |i, _| (i as f64).sin() + 0.5);
        (a, b, rhs)
    }

    fn solver(mode: BorderingMode) -> BorderingSolver {
        BorderingSolver::new(
            BorderingOptions {
                mode,
                ..Default::default()
            },
            GmresConfig {
                max_iter: 200,
                tol: 1e-13,
                restart: 40,
            },
        )
    }

    #[test]
    fn bordering_agrees_with_full_assembly_for_sparse_matrix() {
        let n = 12;
        let j = test_matrix(n).to_sparse().unwrap();
        let (a, b, rhs) = borders(n);
        let system = AugmentedSystem {
            a: &a,
            b: &b,
            c: 0.3,
            rhs: &rhs,
            n: -0.4,
        };
        let bordering = solver(BorderingMode::Bordering)
            .solve(&DirectSolver, &j, &system)
            .unwrap();
        let assembled = solver(BorderingMode::FullAssembly)
            .solve(&DirectSolver, &j, &system)
            .unwrap();
        assert!(bordering.converged && assembled.converged);
        assert!((&bordering.dx - &assembled.dx).amax() < 1e-10);
        assert!((bordering.dl - assembled.dl).abs() < 1e-10);
    }

    #[test]
    fn matrix_free_operator_agrees_with_full_assembly() {
        let n = 15;
        let dense = test_matrix(n);
        let (a, b, rhs) = borders(n);
        let system = AugmentedSystem {
            a: &a,
            b: &b,
            c: 1.1,
            rhs: &rhs,
            n: 0.25,
        };
        let reference = solver(BorderingMode::FullAssembly)
            .solve(&DirectSolver, &dense, &system)
            .unwrap();

        let closure = FnOperator::new(n, |x: &[f64], y: &mut [f64]| dense.apply(x, y));
        let gmres = Gmres::new(GmresConfig {
            max_iter: 200,
            tol: 1e-13,
            restart: 40,
        });
        let bordering = solver(BorderingMode::Bordering)
            .solve(&gmres, &closure, &system)
            .unwrap();
        let matrix_free = solver(BorderingMode::MatrixFree)
            .solve(&gmres, &closure, &system)
            .unwrap();

        for candidate in [&bordering, &matrix_free] {
            assert!(candidate.converged);
            assert!((&candidate.dx - &reference.dx).amax() < 1e-9);
            assert!((candidate.dl - reference.dl).abs() < 1e-9);
        }
        assert!(bordering.iterations.0 > 0 && bordering.iterations.1 > 0);
    }

    #[test]
    fn full_assembly_of_closure_is_unsupported() {
        let n = 3;
        let closure = FnOperator::new(n, |x: &[f64], y: &mut [f64]| y.copy_from_slice(x));
        let (a, b, rhs) = borders(n);
        let system = AugmentedSystem {
            a: &a,
            b: &b,
            c: 1.0,
            rhs: &rhs,
            n: 0.0,
        };
        let result = solver(BorderingMode::FullAssembly).solve(&DirectSolver, &closure, &system);
        assert!(matches!(result, Err(OrbitError::Unsupported(_))));
    }

    #[test]
    fn arclength_weights_scale_border_row_and_corner() {
        let n = 4;
        let j = test_matrix(n).to_sparse().unwrap();
        let (a, b, rhs) = borders(n);
        let system = AugmentedSystem {
            a: &a,
            b: &b,
            c: 2.0,
            rhs: &rhs,
            n: 1.0,
        };
        let options = BorderingOptions::arclength(BorderingMode::Bordering, 0.25).unwrap();
        let assembled = DMatrix::from(&assemble_bordered(&j, &system, &options).unwrap());
        assert!((assembled[(n, 0)] - 0.25 * b[0]).abs() < 1e-15);
        assert!((assembled[(n, n)] - 0.75 * 2.0).abs() < 1e-15);

        let weighted = BorderingSolver::new(options, GmresConfig::default())
            .solve(&DirectSolver, &j, &system)
            .unwrap();
        let x = weighted.clone().into_vector();
        let mut residual = vec![0.0; n + 1];
        assembled.apply(x.as_slice(), &mut residual);
        for i in 0..n {
            assert!((residual[i] - rhs[i]).abs() < 1e-10);
        }
        assert!((residual[n] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn arclength_rejects_theta_outside_unit_interval() {
        assert!(BorderingOptions::arclength(BorderingMode::Bordering, 1.5).is_err());
    }

    #[test]
    fn mismatched_border_length_is_structural() {
        let j = test_matrix(3).to_sparse().unwrap();
        let (a, _, rhs) = borders(3);
        let short = DVector::zeros(2);
        let system = AugmentedSystem {
            a: &a,
            b: &short,
            c: 1.0,
            rhs: &rhs,
            n: 0.0,
        };
        let result = solver(BorderingMode::Bordering).solve(&DirectSolver, &j, &system);
        assert!(matches!(result, Err(OrbitError::DimensionMismatch { .. })));
    }
}
