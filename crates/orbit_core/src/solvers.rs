use crate::error::{check_len, OrbitError, Result};
use crate::periodic::OrbitVector;
use crate::traits::VectorField;

/// Classic Runge-Kutta 4th order solver for autonomous fields.
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    pub fn step(&mut self, field: &impl VectorField, params: &[f64], state: &mut [f64], dt: f64) {
        let n = state.len();

        // k1 = f(y)
        field.apply(state, params, &mut self.k1);

        // k2 = f(y + dt*k1/2)
        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        field.apply(&self.tmp, params, &mut self.k2);

        // k3 = f(y + dt*k2/2)
        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        field.apply(&self.tmp, params, &mut self.k3);

        // k4 = f(y + dt*k3)
        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        field.apply(&self.tmp, params, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..n {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
    }

    /// Advance `state` by `duration` in `steps` equal steps.
    pub fn integrate(
        &mut self,
        field: &impl VectorField,
        params: &[f64],
        state: &mut [f64],
        duration: f64,
        steps: usize,
    ) {
        let dt = duration / steps.max(1) as f64;
        for _ in 0..steps.max(1) {
            self.step(field, params, state, dt);
        }
    }
}

/// Sample a trajectory into an orbit vector with `mesh` slices.
///
/// The M-1 cyclic slices are spaced `period / (M-1)` apart starting at
/// `start`, the last slice repeats the first, and the stored period is
/// rescaled to `period · M / (M-1)` so that h = T/M equals the sample
/// spacing.
pub fn sample_periodic_guess(
    field: &impl VectorField,
    params: &[f64],
    start: &[f64],
    period: f64,
    mesh: usize,
    substeps: usize,
) -> Result<OrbitVector> {
    if mesh < 2 {
        return Err(OrbitError::TooFewSlices(mesh));
    }
    if !(period.is_finite() && period > 0.0) {
        return Err(OrbitError::InvalidPeriod(period));
    }
    let dim = field.dimension();
    check_len("initial state", dim, start.len())?;

    let k = mesh - 1;
    let spacing = period / k as f64;
    let mut rk4 = Rk4::new(dim);
    let mut state = start.to_vec();
    let mut states = Vec::with_capacity(mesh);
    for _ in 0..k {
        states.push(state.clone());
        rk4.integrate(field, params, &mut state, spacing, substeps);
    }
    states.push(start.to_vec());
    OrbitVector::from_slices(&states, period * mesh as f64 / k as f64)
}
