use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our vector fields.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A vector field written once for any scalar type.
///
/// Implementing this for every `T: Scalar` lets [`crate::autodiff::ForwardDiff`]
/// derive directional derivatives from dual numbers.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates F(x, p) into `out`.
    fn apply(&self, x: &[T], params: &[T], out: &mut [T]);
}

/// The oracle consumed by the periodic-orbit functional.
///
/// Only the action of the Jacobian on a direction is required; how it is
/// produced (analytic callback, dual numbers, finite differences) is up to
/// the implementor.
pub trait VectorField {
    fn dimension(&self) -> usize;

    /// out = F(x, p)
    fn apply(&self, x: &[f64], params: &[f64], out: &mut [f64]);

    /// out = dF(x, p) · dx
    fn apply_jacobian(&self, x: &[f64], params: &[f64], dx: &[f64], out: &mut [f64]);

    /// out = d²F(x, p) · (dx1, dx2)
    ///
    /// The default takes a central difference of [`VectorField::apply_jacobian`]
    /// along `dx2`.
    fn apply_hessian(
        &self,
        x: &[f64],
        params: &[f64],
        dx1: &[f64],
        dx2: &[f64],
        out: &mut [f64],
    ) {
        let n = x.len();
        let scale = dx2.iter().map(|v| v * v).sum::<f64>().sqrt();
        if scale == 0.0 {
            out.iter_mut().for_each(|v| *v = 0.0);
            return;
        }
        let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        let eps = 1e-5 * (1.0 + x_norm) / scale;
        let mut shifted = vec![0.0; n];
        let mut plus = vec![0.0; n];
        let mut minus = vec![0.0; n];
        for i in 0..n {
            shifted[i] = x[i] + eps * dx2[i];
        }
        self.apply_jacobian(&shifted, params, dx1, &mut plus);
        for i in 0..n {
            shifted[i] = x[i] - eps * dx2[i];
        }
        self.apply_jacobian(&shifted, params, dx1, &mut minus);
        for i in 0..n {
            out[i] = (plus[i] - minus[i]) / (2.0 * eps);
        }
    }

    /// Dense Jacobian at x, assembled column by column from directional derivatives.
    fn jacobian_matrix(&self, x: &[f64], params: &[f64]) -> DMatrix<f64> {
        let n = self.dimension();
        let mut jac = DMatrix::zeros(n, n);
        let mut unit = vec![0.0; n];
        let mut column = vec![0.0; n];
        for j in 0..n {
            unit[j] = 1.0;
            self.apply_jacobian(x, params, &unit, &mut column);
            for i in 0..n {
                jac[(i, j)] = column[i];
            }
            unit[j] = 0.0;
        }
        jac
    }
}

impl<V: VectorField + ?Sized> VectorField for &V {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn apply(&self, x: &[f64], params: &[f64], out: &mut [f64]) {
        (**self).apply(x, params, out)
    }

    fn apply_jacobian(&self, x: &[f64], params: &[f64], dx: &[f64], out: &mut [f64]) {
        (**self).apply_jacobian(x, params, dx, out)
    }

    fn apply_hessian(
        &self,
        x: &[f64],
        params: &[f64],
        dx1: &[f64],
        dx2: &[f64],
        out: &mut [f64],
    ) {
        (**self).apply_hessian(x, params, dx1, dx2, out)
    }

    fn jacobian_matrix(&self, x: &[f64], params: &[f64]) -> DMatrix<f64> {
        (**self).jacobian_matrix(x, params)
    }
}

/// A vector field given by analytic closures for F and dF·dx.
#[derive(Clone)]
pub struct FnField<F, J> {
    dimension: usize,
    field: F,
    jacobian: J,
}

impl<F, J> FnField<F, J>
where
    F: Fn(&[f64], &[f64], &mut [f64]),
    J: Fn(&[f64], &[f64], &[f64], &mut [f64]),
{
    pub fn new(dimension: usize, field: F, jacobian: J) -> Self {
        Self {
            dimension,
            field,
            jacobian,
        }
    }
}

impl<F, J> VectorField for FnField<F, J>
where
    F: Fn(&[f64], &[f64], &mut [f64]),
    J: Fn(&[f64], &[f64], &[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, x: &[f64], params: &[f64], out: &mut [f64]) {
        (self.field)(x, params, out)
    }

    fn apply_jacobian(&self, x: &[f64], params: &[f64], dx: &[f64], out: &mut [f64]) {
        (self.jacobian)(x, params, dx, out)
    }
}
