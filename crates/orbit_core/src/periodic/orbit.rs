use crate::error::{check_len, OrbitError, Result};
use nalgebra::DVector;

/// Unknowns of the trapezoidal functional: M time slices of dimension N
/// stored back to back, followed by the period T.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitVector {
    data: DVector<f64>,
    dim: usize,
    slices: usize,
}

impl OrbitVector {
    /// Wrap a flat vector of length `dim * slices + 1`.
    pub fn from_vector(data: DVector<f64>, dim: usize, slices: usize) -> Result<Self> {
        if slices < 2 {
            return Err(OrbitError::TooFewSlices(slices));
        }
        if dim == 0 {
            return Err(OrbitError::InvalidSetting(
                "state dimension must be positive".to_string(),
            ));
        }
        check_len("orbit vector", dim * slices + 1, data.len())?;
        let period = data[dim * slices];
        if !(period.is_finite() && period > 0.0) {
            return Err(OrbitError::InvalidPeriod(period));
        }
        Ok(Self { data, dim, slices })
    }

    /// Build from one state per slice.
    pub fn from_slices(states: &[Vec<f64>], period: f64) -> Result<Self> {
        let dim = states.first().map_or(0, Vec::len);
        let slices = states.len();
        let mut data = DVector::zeros(dim * slices + 1);
        for (i, state) in states.iter().enumerate() {
            check_len("orbit slice", dim, state.len())?;
            data.rows_mut(i * dim, dim).copy_from_slice(state);
        }
        data[dim * slices] = period;
        Self::from_vector(data, dim, slices)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn slices(&self) -> usize {
        self.slices
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slice(&self, i: usize) -> &[f64] {
        &self.data.as_slice()[i * self.dim..(i + 1) * self.dim]
    }

    pub fn slice_mut(&mut self, i: usize) -> &mut [f64] {
        let dim = self.dim;
        &mut self.data.as_mut_slice()[i * dim..(i + 1) * dim]
    }

    /// All slice entries without the period.
    pub fn states(&self) -> &[f64] {
        &self.data.as_slice()[..self.dim * self.slices]
    }

    pub fn period(&self) -> f64 {
        self.data[self.dim * self.slices]
    }

    pub fn set_period(&mut self, period: f64) -> Result<()> {
        if !(period.is_finite() && period > 0.0) {
            return Err(OrbitError::InvalidPeriod(period));
        }
        let idx = self.dim * self.slices;
        self.data[idx] = period;
        Ok(())
    }

    pub fn as_vector(&self) -> &DVector<f64> {
        &self.data
    }

    pub fn as_slice(&self) -> &[f64] {
        self.data.as_slice()
    }

    pub fn into_vector(self) -> DVector<f64> {
        self.data
    }

    /// The same layout with different values; the period is validated again.
    pub fn with_values(&self, data: DVector<f64>) -> Result<Self> {
        Self::from_vector(data, self.dim, self.slices)
    }

    /// Largest distance between the first and last slice.
    pub fn closure_gap(&self) -> f64 {
        self.slice(0)
            .iter()
            .zip(self.slice(self.slices - 1))
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_follow_flat_layout() {
        let states = vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let mut orbit = OrbitVector::from_slices(&states, 2.5).unwrap();
        assert_eq!(orbit.len(), 7);
        assert_eq!(orbit.slice(1), &[3.0, 4.0]);
        assert_eq!(orbit.period(), 2.5);
        orbit.slice_mut(2)[0] = -1.0;
        assert_eq!(orbit.as_slice()[4], -1.0);
        assert_eq!(orbit.states().len(), 6);
    }

    #[test]
    fn rejects_non_positive_period() {
        let err = OrbitVector::from_slices(&[vec![0.0], vec![0.0]], 0.0).unwrap_err();
        assert!(matches!(err, OrbitError::InvalidPeriod(_)));

        let mut orbit = OrbitVector::from_slices(&[vec![0.0], vec![0.0]], 1.0).unwrap();
        assert!(orbit.set_period(f64::NAN).is_err());
        assert_eq!(orbit.period(), 1.0);
    }

    #[test]
    fn rejects_single_slice_and_wrong_length() {
        let err = OrbitVector::from_vector(DVector::from_element(3, 1.0), 2, 1).unwrap_err();
        assert!(matches!(err, OrbitError::TooFewSlices(1)));
        let err = OrbitVector::from_vector(DVector::from_element(6, 1.0), 2, 3).unwrap_err();
        assert!(matches!(err, OrbitError::DimensionMismatch { .. }));
    }

    #[test]
    fn closure_gap_measures_first_against_last() {
        let orbit =
            OrbitVector::from_slices(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.25]], 1.0)
                .unwrap();
        assert_eq!(orbit.closure_gap(), 0.25);
    }
}
