//! Sparse materializations of the functional's Jacobian.
//!
//! Every dense N×N block and every entry of the period column is stored,
//! zeros included, so the pattern depends only on (N, M) and the matrix
//! can be refreshed in place between Newton iterations.

use super::orbit::OrbitVector;
use super::problem::PeriodicOrbitProblem;
use super::JacobianKind;
use crate::error::{check_len, OrbitError, Result};
use crate::traits::VectorField;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};

/// Dense blocks of the cyclic core.
///
/// Block row i holds `diag[i] = I - h/2 J(x_i)` at block column i and
/// `sub[i] = -I - h/2 J(x_prev(i))` at block column prev(i); `sub[0]` carries
/// the closure coefficient γ.
#[derive(Debug, Clone)]
pub struct CyclicBlocks {
    dim: usize,
    pub diag: Vec<DMatrix<f64>>,
    pub sub: Vec<DMatrix<f64>>,
}

impl CyclicBlocks {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    pub fn prev(&self, i: usize) -> usize {
        if i == 0 {
            self.len() - 1
        } else {
            i - 1
        }
    }

    /// The N·K square cyclic core.
    pub fn to_sparse(&self) -> CscMatrix<f64> {
        let n = self.dim;
        let size = n * self.len();
        let mut coo = CooMatrix::new(size, size);
        for i in 0..self.len() {
            push_block(&mut coo, i * n, i * n, &self.diag[i]);
            push_block(&mut coo, i * n, self.prev(i) * n, &self.sub[i]);
        }
        CscMatrix::from(&coo)
    }

    /// The diagonal blocks only; a wrap block that lands on the diagonal
    /// (a single cyclic slice) is included.
    pub fn block_diagonal(&self) -> CscMatrix<f64> {
        let n = self.dim;
        let size = n * self.len();
        let mut coo = CooMatrix::new(size, size);
        for i in 0..self.len() {
            push_block(&mut coo, i * n, i * n, &self.diag[i]);
            if self.prev(i) == i {
                push_block(&mut coo, i * n, i * n, &self.sub[i]);
            }
        }
        CscMatrix::from(&coo)
    }

    pub(crate) fn emit<S>(&self, sink: &mut S) -> Result<()>
    where
        S: FnMut(usize, usize, f64) -> Result<()>,
    {
        let n = self.dim;
        for i in 0..self.len() {
            let prev = self.prev(i);
            emit_block(sink, i * n, i * n, &self.diag[i])?;
            emit_block(sink, i * n, prev * n, &self.sub[i])?;
        }
        Ok(())
    }
}

impl<F: VectorField> PeriodicOrbitProblem<F> {
    /// D_i and S_i for every cyclic slice. J is formed once per slice.
    pub fn cyclic_blocks(&self, u: &OrbitVector, gamma: f64) -> Result<CyclicBlocks> {
        self.check_orbit(u)?;
        let n = self.dim();
        let k = self.cyclic_slices();
        let half_h = 0.5 * self.step(u);
        let identity = DMatrix::<f64>::identity(n, n);

        let jacobians: Vec<DMatrix<f64>> = (0..k)
            .map(|i| self.field().jacobian_matrix(u.slice(i), self.params()))
            .collect();
        let diag = jacobians.iter().map(|j| &identity - j * half_h).collect();
        let sub = (0..k)
            .map(|i| {
                let block = -&identity - &jacobians[self.prev(i)] * half_h;
                if i == 0 {
                    block * gamma
                } else {
                    block
                }
            })
            .collect();
        Ok(CyclicBlocks { dim: n, diag, sub })
    }

    pub fn jacobian(&self, u: &OrbitVector, kind: JacobianKind) -> Result<CscMatrix<f64>> {
        match kind {
            JacobianKind::FullSparse | JacobianKind::FullSparseInplace => {
                let size = self.unknowns();
                let mut coo = CooMatrix::new(size, size);
                self.emit_full(u, &mut |row, col, value| {
                    coo.push(row, col, value);
                    Ok(())
                })?;
                Ok(CscMatrix::from(&coo))
            }
            JacobianKind::CyclicSparse => Ok(self.cyclic_blocks(u, 1.0)?.to_sparse()),
            JacobianKind::BlockDiagonalSparse => Ok(self.cyclic_blocks(u, 1.0)?.block_diagonal()),
        }
    }

    /// Refresh `matrix` for a new base point. `FullSparseInplace` overwrites
    /// the stored values and requires the pattern produced by
    /// [`JacobianKind::FullSparse`]; the other kinds rebuild the matrix.
    pub fn update_jacobian(
        &self,
        u: &OrbitVector,
        kind: JacobianKind,
        matrix: &mut CscMatrix<f64>,
    ) -> Result<()> {
        if kind != JacobianKind::FullSparseInplace {
            *matrix = self.jacobian(u, kind)?;
            return Ok(());
        }

        let size = self.unknowns();
        check_len("jacobian rows", size, matrix.nrows())?;
        check_len("jacobian columns", size, matrix.ncols())?;

        let mut entries = Vec::with_capacity(matrix.nnz());
        self.emit_full(u, &mut |row, col, value| {
            entries.push((row, col, value));
            Ok(())
        })?;

        // Resolve every entry to a stored slot and require each slot to be
        // hit before any value is touched.
        let offsets = matrix.col_offsets();
        let rows = matrix.row_indices();
        let mut slots = Vec::with_capacity(entries.len());
        let mut covered = vec![false; matrix.nnz()];
        for &(row, col, value) in &entries {
            let start = offsets[col];
            let pos = rows[start..offsets[col + 1]]
                .binary_search(&row)
                .map_err(|_| OrbitError::PatternMismatch { row, col })?;
            covered[start + pos] = true;
            slots.push((start + pos, value));
        }
        if let Some(extra) = covered.iter().position(|hit| !hit) {
            let col = offsets.partition_point(|&offset| offset <= extra) - 1;
            return Err(OrbitError::PatternMismatch {
                row: rows[extra],
                col,
            });
        }

        let values = matrix.values_mut();
        values.iter_mut().for_each(|v| *v = 0.0);
        for (slot, value) in slots {
            values[slot] += value;
        }
        Ok(())
    }

    /// Every entry of the full (N·M+1)² Jacobian, duplicates to be summed.
    fn emit_full<S>(&self, u: &OrbitVector, sink: &mut S) -> Result<()>
    where
        S: FnMut(usize, usize, f64) -> Result<()>,
    {
        let n = self.dim();
        let k = self.cyclic_slices();
        let last = k * n;
        let period_col = self.unknowns() - 1;

        self.cyclic_blocks(u, 1.0)?.emit(sink)?;
        for j in 0..n {
            sink(last + j, last + j, 1.0)?;
            sink(last + j, j, -1.0)?;
        }
        for (row, value) in self.period_derivative(u)?.iter().enumerate() {
            sink(row, period_col, *value)?;
        }
        for (col, value) in self.phase_direction().iter().enumerate() {
            sink(period_col, col, *value)?;
        }
        Ok(())
    }
}

fn emit_block<S>(sink: &mut S, row0: usize, col0: usize, block: &DMatrix<f64>) -> Result<()>
where
    S: FnMut(usize, usize, f64) -> Result<()>,
{
    for c in 0..block.ncols() {
        for r in 0..block.nrows() {
            sink(row0 + r, col0 + c, block[(r, c)])?;
        }
    }
    Ok(())
}

fn push_block(coo: &mut CooMatrix<f64>, row0: usize, col0: usize, block: &DMatrix<f64>) {
    for c in 0..block.ncols() {
        for r in 0..block.nrows() {
            coo.push(row0 + r, col0 + c, block[(r, c)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::LinearOperator;
    use crate::traits::FnField;
    use nalgebra::DVector;

    fn brusselator() -> impl VectorField + Clone {
        FnField::new(
            2,
            |x: &[f64], p: &[f64], out: &mut [f64]| {
                out[0] = p[0] - (p[1] + 1.0) * x[0] + x[0] * x[0] * x[1];
                out[1] = p[1] * x[0] - x[0] * x[0] * x[1];
            },
            |x: &[f64], p: &[f64], dx: &[f64], out: &mut [f64]| {
                out[0] = (-(p[1] + 1.0) + 2.0 * x[0] * x[1]) * dx[0] + x[0] * x[0] * dx[1];
                out[1] = (p[1] - 2.0 * x[0] * x[1]) * dx[0] - x[0] * x[0] * dx[1];
            },
        )
    }

    fn setup(mesh: usize) -> (PeriodicOrbitProblem<impl VectorField + Clone>, OrbitVector) {
        let problem = PeriodicOrbitProblem::new(
            brusselator(),
            vec![1.0, 3.0],
            mesh,
            vec![1.0, 3.0],
            vec![0.3, -1.0],
        )
        .unwrap();
        let states: Vec<Vec<f64>> = (0..mesh)
            .map(|i| {
                let th = i as f64 * 0.9;
                vec![1.0 + 0.8 * th.cos(), 3.0 + 1.1 * th.sin()]
            })
            .collect();
        (problem, OrbitVector::from_slices(&states, 7.2).unwrap())
    }

    #[test]
    fn full_jacobian_columns_match_directional_derivatives() {
        let (problem, u) = setup(6);
        let jac = DMatrix::from(&problem.jacobian(&u, JacobianKind::FullSparse).unwrap());
        let size = problem.unknowns();
        for col in 0..size - 1 {
            let mut e = vec![0.0; size];
            e[col] = 1.0;
            let column = problem.directional_derivative(&u, &e).unwrap();
            for row in 0..size {
                assert!(
                    (jac[(row, col)] - column[row]).abs() < 1e-12,
                    "entry ({row}, {col})"
                );
            }
        }
        let period = problem.period_derivative(&u).unwrap();
        assert!((jac.column(size - 1) - period).amax() < 1e-15);
        assert_eq!(jac[(size - 1, size - 1)], 0.0);
    }

    #[test]
    fn pattern_is_independent_of_values() {
        let (problem, u) = setup(5);
        let jac = problem.jacobian(&u, JacobianKind::FullSparse).unwrap();
        let (n, k) = (2, 4);
        // K diagonal and K wrap blocks, closure ±I, period column, phase row
        let expected = 2 * k * n * n + 2 * n + problem.unknowns() + n;
        assert_eq!(jac.nnz(), expected);
    }

    #[test]
    fn inplace_update_matches_fresh_assembly() {
        let (problem, u) = setup(7);
        let mut matrix = problem.jacobian(&u, JacobianKind::FullSparse).unwrap();

        let moved_values = u.as_vector() * 1.1 + DVector::from_element(u.len(), 0.05);
        let moved = u.with_values(moved_values).unwrap();
        problem
            .update_jacobian(&moved, JacobianKind::FullSparseInplace, &mut matrix)
            .unwrap();
        let fresh = problem.jacobian(&moved, JacobianKind::FullSparse).unwrap();

        assert_eq!(matrix.pattern(), fresh.pattern());
        for (a, b) in matrix.values().iter().zip(fresh.values()) {
            assert!((a - b).abs() < 1e-14);
        }
    }

    #[test]
    fn inplace_update_rejects_foreign_pattern() {
        let (problem, u) = setup(4);
        let size = problem.unknowns();
        let mut identity = nalgebra_sparse::CscMatrix::identity(size);
        let err = problem
            .update_jacobian(&u, JacobianKind::FullSparseInplace, &mut identity)
            .unwrap_err();
        assert!(matches!(err, OrbitError::PatternMismatch { .. }));
    }

    #[test]
    fn inplace_update_rejects_denser_pattern_untouched() {
        let (problem, u) = setup(4);
        let size = problem.unknowns();
        let dense = DMatrix::from_fn(size, size, |r, c| 1.0 + (r * size + c) as f64);
        let mut matrix = CscMatrix::from(&dense);
        assert!(matrix.nnz() > problem.jacobian(&u, JacobianKind::FullSparse).unwrap().nnz());

        let err = problem
            .update_jacobian(&u, JacobianKind::FullSparseInplace, &mut matrix)
            .unwrap_err();
        assert!(matches!(err, OrbitError::PatternMismatch { .. }));
        assert_eq!(DMatrix::from(&matrix), dense);
    }

    #[test]
    fn two_slice_mesh_sums_coincident_blocks() {
        let (problem, u) = setup(2);
        let jac = DMatrix::from(&problem.jacobian(&u, JacobianKind::FullSparse).unwrap());
        let mut e = vec![0.0; 5];
        e[1] = 1.0;
        let column = problem.directional_derivative(&u, &e).unwrap();
        for row in 0..5 {
            assert!((jac[(row, 1)] - column[row]).abs() < 1e-12);
        }

        let mut matrix = problem.jacobian(&u, JacobianKind::FullSparse).unwrap();
        problem
            .update_jacobian(&u, JacobianKind::FullSparseInplace, &mut matrix)
            .unwrap();
        assert!((DMatrix::from(&matrix) - jac).amax() < 1e-15);
    }

    #[test]
    fn cyclic_only_is_the_principal_block() {
        let (problem, u) = setup(6);
        let full = DMatrix::from(&problem.jacobian(&u, JacobianKind::FullSparse).unwrap());
        let cyclic = DMatrix::from(&problem.jacobian(&u, JacobianKind::CyclicSparse).unwrap());
        let size = problem.dim() * problem.cyclic_slices();
        assert_eq!(cyclic.nrows(), size);
        assert!((full.view((0, 0), (size, size)) - &cyclic).amax() < 1e-15);
    }

    #[test]
    fn block_diagonal_keeps_only_diagonal_blocks() {
        let (problem, u) = setup(5);
        let cyclic = DMatrix::from(&problem.jacobian(&u, JacobianKind::CyclicSparse).unwrap());
        let diag =
            DMatrix::from(&problem.jacobian(&u, JacobianKind::BlockDiagonalSparse).unwrap());
        let n = problem.dim();
        for r in 0..cyclic.nrows() {
            for c in 0..cyclic.ncols() {
                let expected = if r / n == c / n { cyclic[(r, c)] } else { 0.0 };
                assert!((diag[(r, c)] - expected).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn gamma_scales_only_the_wrap_block() {
        let (problem, u) = setup(5);
        let plain = problem.cyclic_blocks(&u, 1.0).unwrap();
        let scaled = problem.cyclic_blocks(&u, 0.5).unwrap();
        assert!((&scaled.sub[0] - &plain.sub[0] * 0.5).amax() < 1e-15);
        assert_eq!(scaled.sub[1], plain.sub[1]);
        assert_eq!(scaled.diag[0], plain.diag[0]);

        let x: Vec<f64> = (0..8).map(|i| i as f64 * 0.25 - 1.0).collect();
        let mut via_blocks = vec![0.0; 8];
        scaled.to_sparse().apply(&x, &mut via_blocks);
        let mut via_problem = vec![0.0; 8];
        problem.apply_cyclic(&u, &x, 0.5, &mut via_problem).unwrap();
        for i in 0..8 {
            assert!((via_blocks[i] - via_problem[i]).abs() < 1e-13);
        }
    }
}
