//! Restarted GMRES for real operators, with optional right preconditioning.

use super::{dot, norm, LinearOperator, LinearSolver, Preconditioner, SolveOutcome};
use crate::error::{check_len, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// GMRES solver configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GmresConfig {
    /// Maximum number of inner iterations across all restarts.
    pub max_iter: usize,
    /// Convergence tolerance (relative residual). Newton drivers tighten it
    /// to a hundredth of their own tolerance.
    pub tol: f64,
    /// Krylov subspace dimension before restart.
    pub restart: usize,
}

impl Default for GmresConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            tol: 1e-10,
            restart: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Gmres {
    pub config: GmresConfig,
}

impl Gmres {
    pub fn new(config: GmresConfig) -> Self {
        Self { config }
    }

    /// Solve A x = b. With a preconditioner M the iteration runs on A M⁻¹.
    pub fn solve_with<Op: LinearOperator + ?Sized>(
        &self,
        op: &Op,
        b: &[f64],
        precond: Option<&dyn Preconditioner>,
    ) -> SolveOutcome {
        let n = op.dim();
        let config = &self.config;
        let b_norm = norm(b);
        if b_norm == 0.0 {
            return SolveOutcome {
                solution: DVector::zeros(n),
                converged: true,
                iterations: 0,
            };
        }

        let mut x = vec![0.0; n];
        let mut ax = vec![0.0; n];
        let mut z = vec![0.0; n];
        let mut total_iter = 0;

        loop {
            op.apply(&x, &mut ax);
            let mut r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();
            let r_norm = norm(&r);

            if r_norm / b_norm <= config.tol {
                return SolveOutcome {
                    solution: DVector::from_vec(x),
                    converged: true,
                    iterations: total_iter,
                };
            }
            if total_iter >= config.max_iter {
                log::warn!(
                    "GMRES stopped after {} iterations with relative residual {:.3e}",
                    total_iter,
                    r_norm / b_norm
                );
                return SolveOutcome {
                    solution: DVector::from_vec(x),
                    converged: false,
                    iterations: total_iter,
                };
            }

            // Arnoldi with modified Gram-Schmidt
            let m = config.restart.clamp(1, n.max(1));
            let mut v: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
            let mut h = vec![vec![0.0; m + 1]; m];
            let mut g = vec![0.0; m + 1];
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];

            r.iter_mut().for_each(|ri| *ri /= r_norm);
            v.push(r);
            g[0] = r_norm;

            let mut k = 0;
            while k < m && total_iter < config.max_iter {
                total_iter += 1;

                let mut w = vec![0.0; n];
                match precond {
                    Some(p) => {
                        p.apply(&v[k], &mut z);
                        op.apply(&z, &mut w);
                    }
                    None => op.apply(&v[k], &mut w),
                }

                for j in 0..=k {
                    let hjk = dot(&v[j], &w);
                    h[k][j] = hjk;
                    for (wi, vi) in w.iter_mut().zip(&v[j]) {
                        *wi -= hjk * vi;
                    }
                }
                let w_norm = norm(&w);
                h[k][k + 1] = w_norm;
                let breakdown = w_norm <= f64::EPSILON * r_norm;
                if !breakdown {
                    w.iter_mut().for_each(|wi| *wi /= w_norm);
                    v.push(w);
                }

                for j in 0..k {
                    let temp = cs[j] * h[k][j] + sn[j] * h[k][j + 1];
                    h[k][j + 1] = -sn[j] * h[k][j] + cs[j] * h[k][j + 1];
                    h[k][j] = temp;
                }
                let (c, s) = givens_rotation(h[k][k], h[k][k + 1]);
                cs[k] = c;
                sn[k] = s;
                h[k][k] = c * h[k][k] + s * h[k][k + 1];
                h[k][k + 1] = 0.0;
                g[k + 1] = -s * g[k];
                g[k] *= c;

                k += 1;
                if breakdown || g[k].abs() / b_norm <= config.tol {
                    break;
                }
            }

            // Back-substitution H y = g
            let mut y = vec![0.0; k];
            for i in (0..k).rev() {
                let mut sum = g[i];
                for j in (i + 1)..k {
                    sum -= h[j][i] * y[j];
                }
                if h[i][i].abs() > 0.0 {
                    y[i] = sum / h[i][i];
                }
            }

            let mut update = vec![0.0; n];
            for (yi, vi) in y.iter().zip(&v) {
                for (u, vij) in update.iter_mut().zip(vi) {
                    *u += yi * vij;
                }
            }
            match precond {
                Some(p) => {
                    p.apply(&update, &mut z);
                    x.iter_mut().zip(&z).for_each(|(xi, zi)| *xi += zi);
                }
                None => x.iter_mut().zip(&update).for_each(|(xi, ui)| *xi += ui),
            }
        }
    }
}

impl<Op: LinearOperator + ?Sized> LinearSolver<Op> for Gmres {
    fn solve(&self, op: &Op, rhs: &DVector<f64>) -> Result<SolveOutcome> {
        check_len("right-hand side", op.dim(), rhs.len())?;
        Ok(self.solve_with(op, rhs.as_slice(), None))
    }
}

fn givens_rotation(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        return (1.0, 0.0);
    }
    let r = a.hypot(b);
    (a / r, b / r)
}
