//! Settings and result types shared by the periodic-orbit drivers.

use crate::error::Result as OrbitResult;
use crate::periodic::{CyclicMode, JacobianKind, OrbitVector, PeriodicOrbitProblem};
use crate::traits::VectorField;
use serde::{Deserialize, Serialize};

/// Settings for the Newton iteration on the periodic-orbit functional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

/// Settings controlling the pseudo-arclength continuation algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    pub max_steps: usize,
    pub corrector_steps: usize,
    pub corrector_tolerance: f64,
    pub step_tolerance: f64,
    /// Weight of the state part of the arclength constraint; the parameter
    /// gets `1 - theta`.
    #[serde(default = "default_theta")]
    pub theta: f64,
}

fn default_theta() -> f64 {
    0.5
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            min_step_size: 1e-5,
            max_step_size: 0.1,
            max_steps: 50,
            corrector_steps: 8,
            corrector_tolerance: 1e-8,
            step_tolerance: 1e-10,
            theta: default_theta(),
        }
    }
}

/// How the Newton correction is computed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinearStrategy {
    /// Bordered Jacobian around the cyclic operator (γ = 1).
    Bordered(CyclicMode),
    /// Direct solve with an assembled sparse Jacobian. Only the full kinds
    /// are square in the unknowns.
    Sparse(JacobianKind),
}

impl Default for LinearStrategy {
    fn default() -> Self {
        LinearStrategy::Bordered(CyclicMode::Matrix)
    }
}

/// Mesh and phase section of a trapezoidal periodic-orbit problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapezoidConfig {
    pub mesh_points: usize,
    pub phase_anchor: Vec<f64>,
    pub phase_direction: Vec<f64>,
}

impl TrapezoidConfig {
    pub fn problem<F: VectorField>(
        &self,
        field: F,
        params: Vec<f64>,
    ) -> OrbitResult<PeriodicOrbitProblem<F>> {
        PeriodicOrbitProblem::new(
            field,
            params,
            self.mesh_points,
            self.phase_anchor.clone(),
            self.phase_direction.clone(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PeriodicNewtonResult {
    pub solution: OrbitVector,
    pub converged: bool,
    pub iterations: usize,
    /// Inner iterations summed over all linear solves.
    pub linear_iterations: usize,
    /// ‖G(u)‖ before the first and after every Newton step.
    pub residual_history: Vec<f64>,
}

impl PeriodicNewtonResult {
    pub fn residual_norm(&self) -> f64 {
        self.residual_history.last().copied().unwrap_or(f64::INFINITY)
    }
}

/// A converged orbit on a periodic branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicBranchPoint {
    pub param_value: f64,
    pub period: f64,
    /// Slices followed by the period, as in the orbit vector.
    pub state: Vec<f64>,
    pub corrector_iterations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicBranch {
    pub param_index: usize,
    pub mesh_points: usize,
    pub points: Vec<PeriodicBranchPoint>,
}
