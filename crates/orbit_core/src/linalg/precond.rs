use crate::error::{OrbitError, Result};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::CscMatrix;

/// z = M⁻¹ r for some approximation M of the operator.
pub trait Preconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]);
}

/// Block-Jacobi preconditioner: LU factors of the diagonal blocks.
pub struct BlockJacobi {
    block_size: usize,
    blocks: Vec<Option<LU<f64, Dyn, Dyn>>>,
}

impl BlockJacobi {
    /// Factor the diagonal blocks of `matrix`. Entries outside the diagonal
    /// blocks are ignored; a singular block acts as the identity.
    pub fn from_block_diagonal(matrix: &CscMatrix<f64>, block_size: usize) -> Result<Self> {
        if block_size == 0 || matrix.nrows() % block_size != 0 {
            return Err(OrbitError::InvalidSetting(format!(
                "block size {} does not divide matrix size {}",
                block_size,
                matrix.nrows()
            )));
        }
        let count = matrix.nrows() / block_size;
        let mut dense = vec![DMatrix::zeros(block_size, block_size); count];
        for (i, j, v) in matrix.triplet_iter() {
            let block = i / block_size;
            if block == j / block_size {
                dense[block][(i % block_size, j % block_size)] += *v;
            }
        }

        let blocks = dense
            .into_iter()
            .enumerate()
            .map(|(idx, block)| {
                let lu = block.lu();
                if lu.is_invertible() {
                    Some(lu)
                } else {
                    log::warn!("block-Jacobi: diagonal block {idx} is singular, using identity");
                    None
                }
            })
            .collect();

        Ok(Self { block_size, blocks })
    }
}

impl Preconditioner for BlockJacobi {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        let n = self.block_size;
        for (idx, block) in self.blocks.iter().enumerate() {
            let range = idx * n..(idx + 1) * n;
            let rhs = DVector::from_column_slice(&r[range.clone()]);
            match block.as_ref().and_then(|lu| lu.solve(&rhs)) {
                Some(sol) => z[range].copy_from_slice(sol.as_slice()),
                None => z[range].copy_from_slice(rhs.as_slice()),
            }
        }
    }
}
