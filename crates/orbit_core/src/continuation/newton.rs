use super::types::{LinearStrategy, NewtonSettings, PeriodicNewtonResult};
use crate::error::OrbitError;
use crate::linalg::{DirectSolver, LinearSolver, SolveOutcome, SolverContext};
use crate::periodic::{BorderedJacobian, JacobianKind, OrbitVector, PeriodicOrbitProblem};
use crate::traits::VectorField;
use anyhow::{bail, Result};
use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;

/// The Jacobian representation kept alive across Newton steps.
enum NewtonJacobian<'a, F> {
    Bordered(BorderedJacobian<'a, F>),
    Sparse {
        kind: JacobianKind,
        matrix: CscMatrix<f64>,
    },
}

impl<'a, F: VectorField> NewtonJacobian<'a, F> {
    fn new(
        problem: &'a PeriodicOrbitProblem<F>,
        u: &OrbitVector,
        strategy: LinearStrategy,
    ) -> Result<Self> {
        Ok(match strategy {
            LinearStrategy::Bordered(mode) => {
                Self::Bordered(BorderedJacobian::new(problem, u, mode, 1.0)?)
            }
            LinearStrategy::Sparse(kind) => Self::Sparse {
                kind,
                matrix: problem.jacobian(u, kind)?,
            },
        })
    }

    fn update(&mut self, problem: &PeriodicOrbitProblem<F>, u: &OrbitVector) -> Result<()> {
        match self {
            Self::Bordered(jacobian) => jacobian.update(u)?,
            Self::Sparse { kind, matrix } => problem.update_jacobian(u, *kind, matrix)?,
        }
        Ok(())
    }

    fn solve(&self, rhs: &DVector<f64>, ctx: &SolverContext) -> Result<SolveOutcome> {
        Ok(match self {
            Self::Bordered(jacobian) => jacobian.solve(rhs, ctx)?,
            Self::Sparse { matrix, .. } => DirectSolver.solve(matrix, rhs)?,
        })
    }
}

/// Newton's method on the trapezoidal functional starting from `initial`.
///
/// Numerical failure (a linear solve that does not converge, a non-positive
/// or non-finite period, the step cap) ends the iteration with
/// `converged = false`; only invalid settings and structural mismatches are
/// errors.
pub fn solve_periodic_orbit<F: VectorField>(
    problem: &PeriodicOrbitProblem<F>,
    initial: OrbitVector,
    strategy: LinearStrategy,
    settings: &NewtonSettings,
    ctx: &SolverContext,
) -> Result<PeriodicNewtonResult> {
    if settings.max_steps == 0 {
        bail!("max_steps must be greater than zero.");
    }
    if settings.damping <= 0.0 {
        bail!("damping must be positive.");
    }
    if settings.tolerance <= 0.0 {
        bail!("tolerance must be positive.");
    }
    if let LinearStrategy::Sparse(
        kind @ (JacobianKind::CyclicSparse | JacobianKind::BlockDiagonalSparse),
    ) = strategy
    {
        return Err(OrbitError::Unsupported(format!(
            "{kind:?} cannot drive Newton: it is not the Jacobian of all orbit unknowns"
        ))
        .into());
    }
    problem.check_orbit(&initial)?;
    let ctx = &linear_context(ctx, settings);

    let mut state = initial;
    let mut residual = problem.evaluate(&state)?;
    let mut residual_history = vec![residual.norm()];
    let mut jacobian = NewtonJacobian::new(problem, &state, strategy)?;
    let mut iterations = 0usize;
    let mut linear_iterations = 0usize;
    let mut converged = residual.norm() <= settings.tolerance;

    while !converged {
        if iterations >= settings.max_steps {
            log::warn!(
                "Newton did not converge in {} steps (|G(u)| = {:.3e})",
                settings.max_steps,
                residual.norm()
            );
            break;
        }
        if iterations > 0 {
            jacobian.update(problem, &state)?;
        }

        let step = jacobian.solve(&residual, ctx)?;
        linear_iterations += step.iterations;
        if !step.converged {
            log::warn!("Newton step {iterations}: linear solve failed, stopping");
            break;
        }

        let next = state.as_vector() - &step.solution * settings.damping;
        let period = next[next.len() - 1];
        if !next.iter().all(|v| v.is_finite()) || period <= 0.0 {
            log::warn!("Newton step {iterations}: invalid iterate (period {period:.3e}), stopping");
            break;
        }
        state = state.with_values(next)?;
        iterations += 1;

        residual = problem.evaluate(&state)?;
        let norm = residual.norm();
        residual_history.push(norm);
        log::debug!("Newton step {iterations}: |G(u)| = {norm:.3e}, T = {:.6}", state.period());
        if !norm.is_finite() {
            log::warn!("Newton step {iterations}: residual is not finite, stopping");
            break;
        }
        converged = norm <= settings.tolerance;
    }

    Ok(PeriodicNewtonResult {
        solution: state,
        converged,
        iterations,
        linear_iterations,
        residual_history,
    })
}

/// Inner GMRES solves run at least two orders of magnitude below the Newton
/// tolerance.
fn linear_context(ctx: &SolverContext, settings: &NewtonSettings) -> SolverContext {
    let mut inner = ctx.clone();
    inner.gmres.tol = inner.gmres.tol.min(1e-2 * settings.tolerance);
    inner
}
