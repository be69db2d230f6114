//! Error types shared across the Hamiltonian system families.

use thiserror::Error;

/// Canonical error type for system construction and evaluation.
///
/// Construction-time configuration problems and numerical linear-algebra
/// failures both surface through this enum; there are no retries anywhere in
/// the crate, every failure is returned to the caller immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SystemError {
    /// A required derivative was neither supplied explicitly nor derivable
    /// because no differentiation collaborator was given at construction.
    #[error("no differentiation collaborator available, `{name}` must be provided")]
    MissingDerivative {
        /// Name of the missing derivative function.
        name: &'static str,
    },

    /// Cholesky factorization was attempted on a matrix that is not positive
    /// definite (e.g. a rank-deficient constraint Gram matrix).
    #[error("{operation} is not positive definite")]
    NotPositiveDefinite {
        /// Which matrix the factorization was applied to.
        operation: &'static str,
    },

    /// A triangular solve hit a factor with a zero diagonal entry.
    #[error("singular triangular factor in {operation}")]
    Singular {
        /// Which solve failed.
        operation: &'static str,
    },
}
