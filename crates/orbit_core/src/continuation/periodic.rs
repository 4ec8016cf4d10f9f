use super::newton::solve_periodic_orbit;
use super::types::{
    ContinuationSettings, LinearStrategy, NewtonSettings, PeriodicBranch, PeriodicBranchPoint,
};
use crate::bordering::{AugmentedSystem, BorderingOptions, BorderingSolver};
use crate::linalg::{DirectSolver, LinearSolver, SolverContext};
use crate::periodic::{JacobianKind, OrbitVector, PeriodicOrbitProblem};
use crate::traits::VectorField;
use anyhow::{anyhow, bail, Result};
use nalgebra::DVector;

/// A point of the augmented space (u, p).
#[derive(Debug, Clone)]
struct BranchState {
    orbit: OrbitVector,
    param: f64,
}

/// Pseudo-arclength continuation of a periodic orbit in one parameter.
///
/// The corrector solves `G(u, p) = 0` together with the θ-weighted arclength
/// condition `θ τ_u·(u - u_pred) + (1-θ) τ_p (p - p_pred) = 0` using the
/// bordering solver on the full sparse Jacobian. The phase section is moved
/// to the newest orbit after every accepted step.
pub fn continue_periodic_orbit<F: VectorField + Clone>(
    problem: &PeriodicOrbitProblem<F>,
    initial: OrbitVector,
    param_index: usize,
    settings: &ContinuationSettings,
    ctx: &SolverContext,
    forward: bool,
) -> Result<PeriodicBranch> {
    validate_settings(settings)?;
    let param = *problem
        .params()
        .get(param_index)
        .ok_or_else(|| anyhow!("Parameter index {} out of range", param_index))?;

    let newton = NewtonSettings {
        max_steps: settings.corrector_steps.max(10),
        damping: 1.0,
        tolerance: settings.corrector_tolerance,
    };
    let start = solve_periodic_orbit(
        problem,
        initial,
        LinearStrategy::Sparse(JacobianKind::FullSparse),
        &newton,
        ctx,
    )?;
    if !start.converged {
        bail!(
            "Initial periodic orbit did not converge (|G| = {:.3e})",
            start.residual_norm()
        );
    }

    let mut base = problem.with_parameter(param_index, param)?;
    base.recenter(&start.solution)?;
    let mut current = BranchState {
        orbit: start.solution,
        param,
    };
    let mut tangent = initial_tangent(&base, &current, param_index, forward)?;
    let mut step_size = settings.step_size;

    let mut branch = PeriodicBranch {
        param_index,
        mesh_points: problem.mesh(),
        points: vec![branch_point(&current, start.iterations)],
    };

    for step in 0..settings.max_steps {
        let predicted = advance(&current, &tangent, step_size)?;
        let corrected = match predicted {
            Some(prediction) => correct(&base, &prediction, &tangent, param_index, settings, ctx)?,
            None => None,
        };

        let Some((next, iterations)) = corrected else {
            step_size *= 0.5;
            log::debug!("continuation step {step}: corrector failed, step size {step_size:.3e}");
            if step_size < settings.min_step_size {
                log::warn!("continuation stopped: step size fell below {:.3e}", settings.min_step_size);
                break;
            }
            continue;
        };

        tangent = secant(&current, &next);
        if iterations <= 3 {
            step_size = (step_size * 1.5).min(settings.max_step_size);
        }
        log::debug!(
            "continuation step {step}: p = {:.6}, T = {:.6}, {iterations} corrector iterations",
            next.param,
            next.orbit.period()
        );

        base = base.with_parameter(param_index, next.param)?;
        base.recenter(&next.orbit)?;
        branch.points.push(branch_point(&next, iterations));
        current = next;
    }

    Ok(branch)
}

fn validate_settings(settings: &ContinuationSettings) -> Result<()> {
    if settings.step_size <= 0.0 {
        bail!("Step size must be positive");
    }
    if settings.min_step_size <= 0.0 || settings.min_step_size > settings.step_size {
        bail!("Minimum step size must be positive and not exceed the step size");
    }
    if settings.max_step_size < settings.step_size {
        bail!("Maximum step size must not be smaller than the step size");
    }
    if settings.corrector_steps == 0 {
        bail!("Corrector steps must be greater than zero");
    }
    if settings.corrector_tolerance <= 0.0 {
        bail!("Corrector tolerance must be positive");
    }
    if !(0.0..=1.0).contains(&settings.theta) {
        bail!("Arclength weight theta must lie in [0, 1]");
    }
    Ok(())
}

/// ∂G/∂p by central differences.
fn param_derivative<F: VectorField + Clone>(
    base: &PeriodicOrbitProblem<F>,
    orbit: &OrbitVector,
    param_index: usize,
    param: f64,
) -> Result<DVector<f64>> {
    let delta = 1e-6 * param.abs().max(1.0);
    let plus = base.with_parameter(param_index, param + delta)?.evaluate(orbit)?;
    let minus = base.with_parameter(param_index, param - delta)?.evaluate(orbit)?;
    Ok((plus - minus) / (2.0 * delta))
}

/// Null vector of [G_u G_p]: τ_u = -G_u⁻¹ G_p τ_p, normalized.
fn initial_tangent<F: VectorField + Clone>(
    base: &PeriodicOrbitProblem<F>,
    state: &BranchState,
    param_index: usize,
    forward: bool,
) -> Result<DVector<f64>> {
    let jacobian = base.jacobian(&state.orbit, JacobianKind::FullSparse)?;
    let g_p = param_derivative(base, &state.orbit, param_index, state.param)?;
    let outcome = DirectSolver.solve(&jacobian, &g_p)?;
    if !outcome.converged {
        bail!("Jacobian is singular at the initial orbit; cannot compute a tangent");
    }
    let n = outcome.solution.len();
    let mut tangent = (-outcome.solution).resize_vertically(n + 1, 1.0);
    tangent.normalize_mut();
    if !forward {
        tangent.neg_mut();
    }
    Ok(tangent)
}

fn advance(state: &BranchState, tangent: &DVector<f64>, step: f64) -> Result<Option<BranchState>> {
    let n = state.orbit.len();
    let values = state.orbit.as_vector() + tangent.rows(0, n) * step;
    if !values[n - 1].is_finite() || values[n - 1] <= 0.0 {
        return Ok(None);
    }
    Ok(Some(BranchState {
        orbit: state.orbit.with_values(values)?,
        param: state.param + tangent[n] * step,
    }))
}

fn secant(from: &BranchState, to: &BranchState) -> DVector<f64> {
    let n = from.orbit.len();
    let mut diff = (to.orbit.as_vector() - from.orbit.as_vector()).resize_vertically(n + 1, 0.0);
    diff[n] = to.param - from.param;
    diff.normalize()
}

fn correct<F: VectorField + Clone>(
    base: &PeriodicOrbitProblem<F>,
    prediction: &BranchState,
    tangent: &DVector<f64>,
    param_index: usize,
    settings: &ContinuationSettings,
    ctx: &SolverContext,
) -> Result<Option<(BranchState, usize)>> {
    let n = prediction.orbit.len();
    let theta = settings.theta;
    let tangent_u = tangent.rows(0, n).into_owned();
    let tangent_p = tangent[n];
    let solver =
        BorderingSolver::new(BorderingOptions::arclength(ctx.bordering.mode, theta)?, ctx.gmres);
    let mut state = prediction.clone();

    // The last pass only measures the residual of the final update.
    for iteration in 0..=settings.corrector_steps {
        let problem = base.with_parameter(param_index, state.param)?;
        let residual = problem.evaluate(&state.orbit)?;
        let constraint = theta
            * tangent_u.dot(&(state.orbit.as_vector() - prediction.orbit.as_vector()))
            + (1.0 - theta) * tangent_p * (state.param - prediction.param);
        let norm = residual.norm().hypot(constraint);
        if norm < settings.corrector_tolerance {
            return Ok(Some((state, iteration)));
        }
        if iteration == settings.corrector_steps {
            break;
        }

        let jacobian = problem.jacobian(&state.orbit, JacobianKind::FullSparse)?;
        let g_p = param_derivative(base, &state.orbit, param_index, state.param)?;
        let system = AugmentedSystem {
            a: &g_p,
            b: &tangent_u,
            c: tangent_p,
            rhs: &residual,
            n: constraint,
        };
        let delta = solver.solve(&DirectSolver, &jacobian, &system)?;
        if !delta.converged {
            return Ok(None);
        }

        let values = state.orbit.as_vector() - &delta.dx;
        if !values.iter().all(|v| v.is_finite()) || values[n - 1] <= 0.0 || !delta.dl.is_finite() {
            return Ok(None);
        }
        state = BranchState {
            orbit: state.orbit.with_values(values)?,
            param: state.param - delta.dl,
        };
        if delta.dx.norm().hypot(delta.dl) < settings.step_tolerance {
            let problem = base.with_parameter(param_index, state.param)?;
            if problem.evaluate(&state.orbit)?.norm() < settings.corrector_tolerance {
                return Ok(Some((state, iteration + 1)));
            }
        }
    }
    Ok(None)
}

fn branch_point(state: &BranchState, iterations: usize) -> PeriodicBranchPoint {
    PeriodicBranchPoint {
        param_value: state.param,
        period: state.orbit.period(),
        state: state.orbit.as_slice().to_vec(),
        corrector_iterations: iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnField;
    use std::f64::consts::PI;

    /// Hopf normal form: cycles r² = p with unit angular speed.
    fn hopf() -> impl VectorField + Clone {
        FnField::new(
            2,
            |x: &[f64], p: &[f64], out: &mut [f64]| {
                let r2 = x[0] * x[0] + x[1] * x[1];
                out[0] = p[0] * x[0] + x[1] - x[0] * r2;
                out[1] = -x[0] + p[0] * x[1] - x[1] * r2;
            },
            |x: &[f64], p: &[f64], dx: &[f64], out: &mut [f64]| {
                let r2 = x[0] * x[0] + x[1] * x[1];
                let dr2 = 2.0 * (x[0] * dx[0] + x[1] * dx[1]);
                out[0] = (p[0] - r2) * dx[0] + dx[1] - x[0] * dr2;
                out[1] = -dx[0] + (p[0] - r2) * dx[1] - x[1] * dr2;
            },
        )
    }

    fn circle(mesh: usize, radius: f64, period: f64) -> OrbitVector {
        let k = mesh - 1;
        let mut states: Vec<Vec<f64>> = (0..k)
            .map(|i| {
                let th = 2.0 * PI * i as f64 / k as f64;
                vec![radius * th.cos(), -radius * th.sin()]
            })
            .collect();
        states.push(states[0].clone());
        OrbitVector::from_slices(&states, period).unwrap()
    }

    fn settings() -> ContinuationSettings {
        ContinuationSettings {
            step_size: 0.05,
            min_step_size: 1e-4,
            max_step_size: 0.1,
            max_steps: 6,
            corrector_steps: 10,
            corrector_tolerance: 1e-9,
            step_tolerance: 1e-12,
            theta: 0.5,
        }
    }

    #[test]
    fn follows_hopf_cycles_at_constant_period() {
        let mesh = 16;
        let p0 = 0.5;
        let problem = PeriodicOrbitProblem::new(
            hopf(),
            vec![p0],
            mesh,
            vec![p0.sqrt(), 0.0],
            vec![0.0, -1.0],
        )
        .unwrap();
        let branch = continue_periodic_orbit(
            &problem,
            circle(mesh, 0.8, 6.5),
            0,
            &settings(),
            &SolverContext::default(),
            true,
        )
        .unwrap();

        assert!(branch.points.len() >= 4, "only {} points", branch.points.len());
        let expected_period = mesh as f64 * 2.0 * (PI / (mesh - 1) as f64).tan();
        for pair in branch.points.windows(2) {
            assert!(pair[1].param_value > pair[0].param_value);
        }
        for point in &branch.points {
            assert!((point.period - expected_period).abs() < 1e-6);
            for slice in point.state[..2 * mesh].chunks(2) {
                let r2 = slice[0] * slice[0] + slice[1] * slice[1];
                assert!((r2 - point.param_value).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn corrector_accepts_convergence_on_its_last_iteration() {
        let mesh = 12;
        let problem =
            PeriodicOrbitProblem::new(hopf(), vec![1.0], mesh, vec![1.0, 0.0], vec![0.0, -1.0])
                .unwrap();
        let ctx = SolverContext::default();
        let start = solve_periodic_orbit(
            &problem,
            circle(mesh, 1.0, 6.4),
            LinearStrategy::Sparse(JacobianKind::FullSparse),
            &NewtonSettings::default(),
            &ctx,
        )
        .unwrap();
        let mut base = problem.with_parameter(0, 1.0).unwrap();
        base.recenter(&start.solution).unwrap();
        let current = BranchState {
            orbit: start.solution,
            param: 1.0,
        };
        let tangent = initial_tangent(&base, &current, 0, true).unwrap();
        let prediction = advance(&current, &tangent, 0.1).unwrap().unwrap();

        let mut settings = settings();
        settings.step_tolerance = 0.0;
        settings.corrector_steps = 20;
        let (_, needed) = correct(&base, &prediction, &tangent, 0, &settings, &ctx)
            .unwrap()
            .unwrap();
        assert!(needed >= 1);

        settings.corrector_steps = needed;
        let (_, used) = correct(&base, &prediction, &tangent, 0, &settings, &ctx)
            .unwrap()
            .expect("converged on the final corrector iteration");
        assert_eq!(used, needed);
    }

    #[test]
    fn backward_direction_decreases_parameter() {
        let mesh = 12;
        let problem =
            PeriodicOrbitProblem::new(hopf(), vec![1.0], mesh, vec![1.0, 0.0], vec![0.0, -1.0])
                .unwrap();
        let mut settings = settings();
        settings.max_steps = 3;
        let branch = continue_periodic_orbit(
            &problem,
            circle(mesh, 1.0, 6.4),
            0,
            &settings,
            &SolverContext::default(),
            false,
        )
        .unwrap();
        assert!(branch.points.len() > 1);
        assert!(branch.points.last().unwrap().param_value < 1.0);
    }

    #[test]
    fn rejects_invalid_settings() {
        let problem =
            PeriodicOrbitProblem::new(hopf(), vec![1.0], 8, vec![1.0, 0.0], vec![0.0, -1.0])
                .unwrap();
        let mut bad = settings();
        bad.theta = 1.5;
        let result = continue_periodic_orbit(
            &problem,
            circle(8, 1.0, 6.0),
            0,
            &bad,
            &SolverContext::default(),
            true,
        );
        assert!(result.is_err());
        let result = continue_periodic_orbit(
            &problem,
            circle(8, 1.0, 6.0),
            4,
            &settings(),
            &SolverContext::default(),
            true,
        );
        assert!(result.is_err());
    }
}
