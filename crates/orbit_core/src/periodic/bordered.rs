use super::cyclic::{CyclicInverse, CyclicMode, CyclicOperator};
use super::orbit::OrbitVector;
use super::problem::PeriodicOrbitProblem;
use crate::bordering::{assemble_bordered, AugmentedSystem, BorderingSolver};
use crate::error::{check_len, Result};
use crate::linalg::{LinearOperator, SolveOutcome, SolverContext};
use crate::traits::VectorField;
use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;

/// The full Jacobian of the functional seen as Aγ bordered by the period
/// column and the phase row:
///
/// ```text
/// [ Aγ        ∂T[..NM] ]
/// [ ϕ, 0...   ∂T[NM]   ]
/// ```
pub struct BorderedJacobian<'a, F> {
    problem: &'a PeriodicOrbitProblem<F>,
    cyclic: CyclicOperator<'a, F>,
    period_derivative: DVector<f64>,
    phase_row: DVector<f64>,
    base: OrbitVector,
}

impl<'a, F: VectorField> BorderedJacobian<'a, F> {
    pub fn new(
        problem: &'a PeriodicOrbitProblem<F>,
        u: &OrbitVector,
        mode: CyclicMode,
        gamma: f64,
    ) -> Result<Self> {
        let cyclic = CyclicOperator::new(problem, u, mode, gamma)?;
        let mut phase_row = DVector::zeros(problem.dim() * problem.mesh());
        phase_row
            .rows_mut(0, problem.dim())
            .copy_from_slice(problem.phase_direction());
        Ok(Self {
            problem,
            cyclic,
            period_derivative: problem.period_derivative(u)?,
            phase_row,
            base: u.clone(),
        })
    }

    /// Refresh base point, period column and Aγ. Called once per Newton step.
    pub fn update(&mut self, u: &OrbitVector) -> Result<()> {
        self.period_derivative = self.problem.period_derivative(u)?;
        self.cyclic.update(self.problem, u)?;
        self.base = u.clone();
        Ok(())
    }

    pub fn base(&self) -> &OrbitVector {
        &self.base
    }

    pub fn cyclic(&self) -> &CyclicOperator<'a, F> {
        &self.cyclic
    }

    pub fn period_derivative(&self) -> &DVector<f64> {
        &self.period_derivative
    }

    /// Solve J (dX, dl) = rhs with the bordering configured in `ctx`; inner
    /// solves go through the cyclic inverse. The returned iteration count
    /// sums both inner solves.
    pub fn solve(&self, rhs: &DVector<f64>, ctx: &SolverContext) -> Result<SolveOutcome> {
        let len = self.phase_row.len();
        check_len("bordered right-hand side", len + 1, rhs.len())?;
        let a = self.period_derivative.rows(0, len).into_owned();
        let r = rhs.rows(0, len).into_owned();
        let system = AugmentedSystem {
            a: &a,
            b: &self.phase_row,
            c: self.period_derivative[len],
            rhs: &r,
            n: rhs[len],
        };
        let solution = BorderingSolver::new(ctx.bordering, ctx.gmres).solve(
            &CyclicInverse { ctx },
            &self.cyclic,
            &system,
        )?;
        Ok(SolveOutcome {
            converged: solution.converged,
            iterations: solution.total_iterations(),
            solution: solution.into_vector(),
        })
    }
}

impl<F: VectorField> LinearOperator for BorderedJacobian<'_, F> {
    fn dim(&self) -> usize {
        self.phase_row.len() + 1
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let len = self.phase_row.len();
        let dl = x[len];
        self.cyclic.apply(&x[..len], &mut y[..len]);
        for i in 0..len {
            y[i] += self.period_derivative[i] * dl;
        }
        y[len] = self.phase_row.dot(&DVector::from_column_slice(&x[..len]))
            + self.period_derivative[len] * dl;
    }

    fn to_sparse(&self) -> Result<CscMatrix<f64>> {
        let len = self.phase_row.len();
        let a = self.period_derivative.rows(0, len).into_owned();
        let empty = DVector::zeros(len);
        let system = AugmentedSystem {
            a: &a,
            b: &self.phase_row,
            c: self.period_derivative[len],
            rhs: &empty,
            n: 0.0,
        };
        assemble_bordered(&self.cyclic.to_sparse()?, &system, &Default::default())
    }
}
