use super::orbit::OrbitVector;
use crate::error::{check_len, OrbitError, Result};
use crate::linalg::dot;
use crate::traits::VectorField;
use nalgebra::DVector;

/// Default forward-difference step for the period column.
pub const DEFAULT_PERIOD_STEP: f64 = 1e-9;

/// The trapezoidal periodic-orbit functional G(u) for a vector field F.
///
/// For an orbit vector u = (x_0, ..., x_{M-1}, T) with h = T/M and the
/// K = M-1 cyclic slices wrapping around (the predecessor of slice 0 is
/// slice K-1), the residual is
///
/// ```text
/// G_i   = x_i - x_prev(i) - h/2 (F(x_i) + F(x_prev(i)))    i = 0..K
/// G_K   = x_{M-1} - x_0
/// G_ph  = <x_0 - xπ, ϕ>
/// ```
#[derive(Debug, Clone)]
pub struct PeriodicOrbitProblem<F> {
    field: F,
    params: Vec<f64>,
    dim: usize,
    mesh: usize,
    phase_anchor: Vec<f64>,
    phase_direction: Vec<f64>,
    period_step: f64,
}

impl<F: VectorField> PeriodicOrbitProblem<F> {
    pub fn new(
        field: F,
        params: Vec<f64>,
        mesh: usize,
        phase_anchor: Vec<f64>,
        phase_direction: Vec<f64>,
    ) -> Result<Self> {
        if mesh < 2 {
            return Err(OrbitError::TooFewSlices(mesh));
        }
        let dim = field.dimension();
        if dim == 0 {
            return Err(OrbitError::InvalidSetting(
                "vector field has zero dimension".to_string(),
            ));
        }
        validate_phase(dim, &phase_anchor, &phase_direction)?;
        Ok(Self {
            field,
            params,
            dim,
            mesh,
            phase_anchor,
            phase_direction,
            period_step: DEFAULT_PERIOD_STEP,
        })
    }

    pub fn with_period_step(mut self, step: f64) -> Result<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(OrbitError::InvalidSetting(format!(
                "period step must be positive, got {step}"
            )));
        }
        self.period_step = step;
        Ok(self)
    }

    pub fn field(&self) -> &F {
        &self.field
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// State dimension N.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of time slices M.
    pub fn mesh(&self) -> usize {
        self.mesh
    }

    /// Number of slices in the cyclic core, M-1.
    pub fn cyclic_slices(&self) -> usize {
        self.mesh - 1
    }

    /// Length of an orbit vector, N·M+1.
    pub fn unknowns(&self) -> usize {
        self.dim * self.mesh + 1
    }

    pub fn period_step(&self) -> f64 {
        self.period_step
    }

    pub fn phase_anchor(&self) -> &[f64] {
        &self.phase_anchor
    }

    pub fn phase_direction(&self) -> &[f64] {
        &self.phase_direction
    }

    /// Cyclic predecessor of slice `i`.
    pub fn prev(&self, i: usize) -> usize {
        if i == 0 {
            self.cyclic_slices() - 1
        } else {
            i - 1
        }
    }

    pub fn set_phase_reference(&mut self, anchor: Vec<f64>, direction: Vec<f64>) -> Result<()> {
        validate_phase(self.dim, &anchor, &direction)?;
        self.phase_anchor = anchor;
        self.phase_direction = direction;
        Ok(())
    }

    /// Move the phase section to the current first slice: xπ = x_0 and
    /// ϕ = F(x_0).
    pub fn recenter(&mut self, u: &OrbitVector) -> Result<()> {
        self.check_orbit(u)?;
        let anchor = u.slice(0).to_vec();
        let mut direction = vec![0.0; self.dim];
        self.field.apply(&anchor, &self.params, &mut direction);
        self.set_phase_reference(anchor, direction)
    }

    pub fn check_orbit(&self, u: &OrbitVector) -> Result<()> {
        check_len("orbit slice dimension", self.dim, u.dim())?;
        check_len("orbit slice count", self.mesh, u.slices())
    }

    /// h = T/M.
    pub fn step(&self, u: &OrbitVector) -> f64 {
        u.period() / self.mesh as f64
    }

    /// <x_0 - xπ, ϕ>
    pub fn phase(&self, u: &OrbitVector) -> f64 {
        u.slice(0)
            .iter()
            .zip(&self.phase_anchor)
            .zip(&self.phase_direction)
            .map(|((x, a), d)| (x - a) * d)
            .sum()
    }

    pub fn evaluate(&self, u: &OrbitVector) -> Result<DVector<f64>> {
        let mut out = DVector::zeros(self.unknowns());
        self.evaluate_into(u, out.as_mut_slice())?;
        Ok(out)
    }

    pub fn evaluate_into(&self, u: &OrbitVector, out: &mut [f64]) -> Result<()> {
        self.check_orbit(u)?;
        check_len("residual buffer", self.unknowns(), out.len())?;
        let n = self.dim;
        let half_h = 0.5 * self.step(u);

        self.sweep(u, |i, prev, f_i, f_prev| {
            let (x_i, x_prev) = (u.slice(i), u.slice(prev));
            for j in 0..n {
                out[i * n + j] = x_i[j] - x_prev[j] - half_h * (f_i[j] + f_prev[j]);
            }
        });
        self.write_closure(u.as_slice(), out);
        out[n * self.mesh] = self.phase(u);
        Ok(())
    }

    /// dG(u) · du
    pub fn directional_derivative(&self, u: &OrbitVector, du: &[f64]) -> Result<DVector<f64>> {
        self.check_orbit(u)?;
        check_len("orbit direction", self.unknowns(), du.len())?;
        let n = self.dim;
        let m = self.mesh;
        let half_h = 0.5 * self.step(u);
        let half_dh = 0.5 * du[n * m] / m as f64;
        let jdx = self.slice_jvps(u, du);

        let mut out = DVector::zeros(self.unknowns());
        let out_slice = out.as_mut_slice();
        self.sweep(u, |i, prev, f_i, f_prev| {
            for j in 0..n {
                out_slice[i * n + j] = du[i * n + j]
                    - du[prev * n + j]
                    - half_h * (jdx[i * n + j] + jdx[prev * n + j])
                    - half_dh * (f_i[j] + f_prev[j]);
            }
        });
        self.write_closure(du, out_slice);
        out_slice[n * m] = dot(&du[..n], &self.phase_direction);
        Ok(out)
    }

    /// d²G(u) · (du1, du2). Closure and phase rows are linear and vanish.
    pub fn second_derivative(
        &self,
        u: &OrbitVector,
        du1: &[f64],
        du2: &[f64],
    ) -> Result<DVector<f64>> {
        self.check_orbit(u)?;
        check_len("first orbit direction", self.unknowns(), du1.len())?;
        check_len("second orbit direction", self.unknowns(), du2.len())?;
        let n = self.dim;
        let m = self.mesh;
        let k = self.cyclic_slices();
        let half_h = 0.5 * self.step(u);
        let half_dt1 = 0.5 * du1[n * m] / m as f64;
        let half_dt2 = 0.5 * du2[n * m] / m as f64;

        let jdx1 = self.slice_jvps(u, du1);
        let jdx2 = self.slice_jvps(u, du2);
        let mut hess = vec![0.0; n * k];
        for i in 0..k {
            let range = i * n..(i + 1) * n;
            self.field.apply_hessian(
                u.slice(i),
                &self.params,
                &du1[range.clone()],
                &du2[range.clone()],
                &mut hess[range],
            );
        }

        let mut out = DVector::zeros(self.unknowns());
        for i in 0..k {
            let prev = self.prev(i);
            for j in 0..n {
                let (a, b) = (i * n + j, prev * n + j);
                out[a] = -half_h * (hess[a] + hess[b])
                    - half_dt2 * (jdx1[a] + jdx1[b])
                    - half_dt1 * (jdx2[a] + jdx2[b]);
            }
        }
        Ok(out)
    }

    /// ∂G/∂T by a forward difference with the configured period step.
    pub fn period_derivative(&self, u: &OrbitVector) -> Result<DVector<f64>> {
        let base = self.evaluate(u)?;
        let mut shifted = u.clone();
        shifted.set_period(u.period() + self.period_step)?;
        let step = shifted.period() - u.period();
        let mut column = (self.evaluate(&shifted)? - base) / step;
        column[self.dim * self.mesh] = 0.0;
        Ok(column)
    }

    /// Action of the cyclic core on `dx` (length N·(M-1)), with the wrap block
    /// of slice 0 scaled by `gamma`.
    pub fn apply_cyclic(
        &self,
        u: &OrbitVector,
        dx: &[f64],
        gamma: f64,
        out: &mut [f64],
    ) -> Result<()> {
        self.check_orbit(u)?;
        let len = self.dim * self.cyclic_slices();
        check_len("cyclic direction", len, dx.len())?;
        check_len("cyclic output", len, out.len())?;
        self.apply_cyclic_unchecked(u, dx, gamma, out);
        Ok(())
    }

    pub(crate) fn apply_cyclic_unchecked(
        &self,
        u: &OrbitVector,
        dx: &[f64],
        gamma: f64,
        out: &mut [f64],
    ) {
        let n = self.dim;
        let half_h = 0.5 * self.step(u);
        let jdx = self.slice_jvps(u, dx);
        for i in 0..self.cyclic_slices() {
            let prev = self.prev(i);
            let scale = if i == 0 { gamma } else { 1.0 };
            for j in 0..n {
                let (a, b) = (i * n + j, prev * n + j);
                out[a] = dx[a] - half_h * jdx[a] - scale * (dx[b] + half_h * jdx[b]);
            }
        }
    }

    /// J(x_i)·dx_i for each cyclic slice; one Jacobian action per slice.
    fn slice_jvps(&self, u: &OrbitVector, dx: &[f64]) -> Vec<f64> {
        let n = self.dim;
        let k = self.cyclic_slices();
        let mut jdx = vec![0.0; n * k];
        for i in 0..k {
            let range = i * n..(i + 1) * n;
            self.field
                .apply_jacobian(u.slice(i), &self.params, &dx[range.clone()], &mut jdx[range]);
        }
        jdx
    }

    /// Visit every cyclic slice with F at the slice and at its predecessor.
    /// F is evaluated once per slice; the predecessor value is carried over.
    fn sweep<V>(&self, u: &OrbitVector, mut visit: V)
    where
        V: FnMut(usize, usize, &[f64], &[f64]),
    {
        let n = self.dim;
        let k = self.cyclic_slices();
        let mut f_last = vec![0.0; n];
        self.field.apply(u.slice(k - 1), &self.params, &mut f_last);
        let mut f_prev = f_last.clone();
        let mut f_cur = vec![0.0; n];
        for i in 0..k {
            if i == k - 1 {
                f_cur.copy_from_slice(&f_last);
            } else {
                self.field.apply(u.slice(i), &self.params, &mut f_cur);
            }
            visit(i, self.prev(i), &f_cur, &f_prev);
            std::mem::swap(&mut f_prev, &mut f_cur);
        }
    }

    /// Closure rows `v_{M-1} - v_0`.
    fn write_closure(&self, v: &[f64], out: &mut [f64]) {
        let n = self.dim;
        let last = self.cyclic_slices() * n;
        for j in 0..n {
            out[last + j] = v[last + j] - v[j];
        }
    }
}

impl<F: VectorField + Clone> PeriodicOrbitProblem<F> {
    /// The same problem with one parameter replaced.
    pub fn with_parameter(&self, index: usize, value: f64) -> Result<Self> {
        if index >= self.params.len() {
            return Err(OrbitError::InvalidSetting(format!(
                "parameter index {index} out of range for {} parameters",
                self.params.len()
            )));
        }
        let mut problem = self.clone();
        problem.params[index] = value;
        Ok(problem)
    }
}

fn validate_phase(dim: usize, anchor: &[f64], direction: &[f64]) -> Result<()> {
    check_len("phase anchor", dim, anchor.len())?;
    check_len("phase direction", dim, direction.len())?;
    if direction.iter().all(|v| *v == 0.0) {
        return Err(OrbitError::InvalidSetting(
            "phase direction must be non-zero".to_string(),
        ));
    }
    Ok(())
}
