/*!
# Dense Linear-Algebra Primitives.

Cholesky factorization, triangular solves and symmetric eigendecomposition
for the metric and Gram matrices used by the system families. The crate keeps
its data in [`ndarray`] containers; this module bridges them to
[`nalgebra`]'s factorizations through the extension traits [`MatrixOps`] and
[`TriangularOps`], so call sites read as plain method calls on `Array2<f64>`.

Factorization failures are reported through [`SystemError`]: a non-positive-
definite input surfaces as [`SystemError::NotPositiveDefinite`] at the call
site that named the matrix, and a zero diagonal in a triangular factor as
[`SystemError::Singular`]. Nothing here retries or regularizes.
*/

use crate::errors::SystemError;
use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use ndarray::{Array1, Array2};
use std::cmp::Ordering;

fn to_na(m: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_row_iterator(m.nrows(), m.ncols(), m.iter().copied())
}

fn from_na(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn vec_to_na(v: &Array1<f64>) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().copied())
}

fn vec_from_na(v: &DVector<f64>) -> Array1<f64> {
    Array1::from_iter(v.iter().copied())
}

/// Factorizations of symmetric matrices.
pub trait MatrixOps {
    /// Lower-triangular Cholesky factor `L` with `L·Lᵗ = self`.
    ///
    /// Returns `None` when the matrix is not positive definite; callers name
    /// the offending matrix in the [`SystemError::NotPositiveDefinite`] they
    /// raise.
    fn cholesky_lower(&self) -> Option<Array2<f64>>;

    /// Symmetric eigendecomposition: eigenvalues ascending, orthonormal
    /// eigenvectors in matching columns.
    fn eigh(&self) -> (Array1<f64>, Array2<f64>);
}

impl MatrixOps for Array2<f64> {
    fn cholesky_lower(&self) -> Option<Array2<f64>> {
        Cholesky::new(to_na(self)).map(|c| from_na(&c.l()))
    }

    fn eigh(&self) -> (Array1<f64>, Array2<f64>) {
        let eig = SymmetricEigen::new(to_na(self));
        let n = eig.eigenvalues.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eig.eigenvalues[a]
                .partial_cmp(&eig.eigenvalues[b])
                .unwrap_or(Ordering::Equal)
        });
        let eigvals = Array1::from_iter(order.iter().map(|&i| eig.eigenvalues[i]));
        let eigvecs = Array2::from_shape_fn((n, n), |(i, j)| eig.eigenvectors[(i, order[j])]);
        (eigvals, eigvecs)
    }
}

/// Solves against a lower-triangular Cholesky factor.
///
/// `self` is always the lower factor `L`; the `cho_*` methods solve the full
/// system `L·Lᵗ·x = b` through a forward and a backward substitution.
pub trait TriangularOps {
    /// Solves `L·x = b`.
    fn solve_lower(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError>;

    /// Solves `Lᵗ·x = b`.
    fn solve_lower_transpose(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError>;

    /// Solves `L·X = B` column-wise for a matrix right-hand side.
    fn solve_lower_mat(&self, b: &Array2<f64>) -> Result<Array2<f64>, SystemError>;

    /// Solves `L·Lᵗ·x = b`.
    fn cho_solve(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError>;

    /// Solves `L·Lᵗ·X = B` for a matrix right-hand side.
    fn cho_solve_mat(&self, b: &Array2<f64>) -> Result<Array2<f64>, SystemError>;
}

impl TriangularOps for Array2<f64> {
    fn solve_lower(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError> {
        to_na(self)
            .solve_lower_triangular(&vec_to_na(b))
            .map(|x| vec_from_na(&x))
            .ok_or(SystemError::Singular {
                operation: "forward substitution",
            })
    }

    fn solve_lower_transpose(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError> {
        to_na(self)
            .tr_solve_lower_triangular(&vec_to_na(b))
            .map(|x| vec_from_na(&x))
            .ok_or(SystemError::Singular {
                operation: "backward substitution",
            })
    }

    fn solve_lower_mat(&self, b: &Array2<f64>) -> Result<Array2<f64>, SystemError> {
        to_na(self)
            .solve_lower_triangular(&to_na(b))
            .map(|x| from_na(&x))
            .ok_or(SystemError::Singular {
                operation: "forward substitution",
            })
    }

    fn cho_solve(&self, b: &Array1<f64>) -> Result<Array1<f64>, SystemError> {
        let y = self.solve_lower(b)?;
        self.solve_lower_transpose(&y)
    }

    fn cho_solve_mat(&self, b: &Array2<f64>) -> Result<Array2<f64>, SystemError> {
        let l = to_na(self);
        let y = l
            .solve_lower_triangular(&to_na(b))
            .ok_or(SystemError::Singular {
                operation: "forward substitution",
            })?;
        l.tr_solve_lower_triangular(&y)
            .map(|x| from_na(&x))
            .ok_or(SystemError::Singular {
                operation: "backward substitution",
            })
    }
}

/// Outer product `a·bᵗ` of two vectors.
pub(crate) fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i] * b[j])
}

/// Sum of the natural logs of a square matrix's diagonal.
pub(crate) fn log_diag_sum(m: &Array2<f64>) -> f64 {
    m.diag().mapv(f64::ln).sum()
}
