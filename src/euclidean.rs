/*!
# Euclidean Metric Family.

Separable Hamiltonian systems whose kinetic term uses a fixed,
position-independent metric (the momentum covariance): identity, diagonal, or
dense with a construction-time Cholesky factor. The covariance structure is a
capability object implementing [`EuclideanMetric`]; a system is the
composition of a resolved potential with one of these metrics,
[`EuclideanMetricSystem`]. The constrained families in
[`crate::constrained`] inject the same metric objects, which is how "dense
metric, constrained" exists without any inheritance diamond.

The Hamiltonian splits as `h = pot_energy(pos) + kin_energy(mom)`; kinetic
quantities are cached on the momentum only, so a position update (the common
case along a trajectory) leaves them valid.

# Example

```
use geometric_mcmc::euclidean::{EuclideanMetricSystem, IsotropicMetric};
use geometric_mcmc::hamiltonian::{HamiltonianSystem, Potential};
use geometric_mcmc::state::ChainState;
use ndarray::arr1;

let potential = Potential::new(|q: &ndarray::Array1<f64>| 0.5 * q.dot(q))
    .with_grad(|q: &ndarray::Array1<f64>| (q.clone(), 0.5 * q.dot(q)));
let system = EuclideanMetricSystem::new(potential, IsotropicMetric, None).unwrap();

let mut state = ChainState::new(arr1(&[1.0, 2.0]), arr1(&[0.5, -0.5]));
assert_eq!(system.pot_energy(&mut state).unwrap(), 2.5);
assert_eq!(system.h(&mut state).unwrap(), 2.75);
```
*/

use crate::diff::Differentiator;
use crate::errors::SystemError;
use crate::hamiltonian::{draw_standard_normal, HamiltonianSystem, Potential, ResolvedPotential};
use crate::linalg::{MatrixOps, TriangularOps};
use crate::state::{cached, CachedValue, ChainState, Deps};
use log::warn;
use ndarray::{Array1, Array2, Axis};
use rand::RngCore;

/// A fixed positive-definite momentum covariance and the operations the
/// system families need from it.
///
/// Dimension agreement between the metric and the vectors it is applied to is
/// a documented precondition, not a runtime check.
pub trait EuclideanMetric: Send + Sync {
    /// Kinetic energy `½·mom·M⁻¹·mom`.
    fn kin_energy(&self, mom: &Array1<f64>) -> f64;

    /// Gradient of the kinetic energy, `M⁻¹·mom`.
    fn grad_kin_energy(&self, mom: &Array1<f64>) -> Array1<f64>;

    /// Draws momentum from the zero-mean Gaussian with covariance `M`.
    fn sample_momentum(&self, n_dim: usize, rng: &mut dyn RngCore) -> Array1<f64>;

    /// `M·rhs`.
    fn mult_metric(&self, rhs: &Array1<f64>) -> Array1<f64>;

    /// `M⁻¹·rhs`.
    fn mult_inv_metric(&self, rhs: &Array1<f64>) -> Array1<f64>;

    /// `M·rhs` for a matrix right-hand side.
    fn mult_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64>;

    /// `M⁻¹·rhs` for a matrix right-hand side.
    fn mult_inv_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64>;
}

/// Identity metric: momenta are independent standard normals.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsotropicMetric;

impl EuclideanMetric for IsotropicMetric {
    fn kin_energy(&self, mom: &Array1<f64>) -> f64 {
        0.5 * mom.dot(mom)
    }

    fn grad_kin_energy(&self, mom: &Array1<f64>) -> Array1<f64> {
        mom.clone()
    }

    fn sample_momentum(&self, n_dim: usize, rng: &mut dyn RngCore) -> Array1<f64> {
        draw_standard_normal(n_dim, rng)
    }

    fn mult_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        rhs.clone()
    }

    fn mult_inv_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        rhs.clone()
    }

    fn mult_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        rhs.clone()
    }

    fn mult_inv_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        rhs.clone()
    }
}

/// Diagonal metric, stored as the diagonal of the covariance.
#[derive(Debug, Clone)]
pub struct DiagonalMetric {
    diagonal: Array1<f64>,
}

impl DiagonalMetric {
    /// Metric from its diagonal. Entries must be strictly positive.
    pub fn new(diagonal: Array1<f64>) -> Self {
        Self { diagonal }
    }

    /// Metric from a full matrix, retaining only its diagonal.
    ///
    /// Off-diagonal entries are discarded with a warning rather than
    /// rejected, so an adapted dense covariance degrades gracefully when
    /// handed to a diagonal system.
    pub fn from_matrix(metric: &Array2<f64>) -> Self {
        warn!("off-diagonal metric entries ignored for DiagonalMetric");
        Self {
            diagonal: metric.diag().to_owned(),
        }
    }

    /// The stored diagonal.
    pub fn diagonal(&self) -> &Array1<f64> {
        &self.diagonal
    }
}

impl EuclideanMetric for DiagonalMetric {
    fn kin_energy(&self, mom: &Array1<f64>) -> f64 {
        0.5 * (mom * mom / &self.diagonal).sum()
    }

    fn grad_kin_energy(&self, mom: &Array1<f64>) -> Array1<f64> {
        mom / &self.diagonal
    }

    fn sample_momentum(&self, n_dim: usize, rng: &mut dyn RngCore) -> Array1<f64> {
        self.diagonal.mapv(f64::sqrt) * draw_standard_normal(n_dim, rng)
    }

    fn mult_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        rhs * &self.diagonal
    }

    fn mult_inv_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        rhs / &self.diagonal
    }

    fn mult_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        rhs * &self.diagonal.view().insert_axis(Axis(1))
    }

    fn mult_inv_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        rhs / &self.diagonal.view().insert_axis(Axis(1))
    }
}

/// Dense metric, factorized once at construction.
#[derive(Debug, Clone)]
pub struct DenseMetric {
    metric: Array2<f64>,
    chol: Array2<f64>,
}

impl DenseMetric {
    /// Factorizes the covariance; fails if it is not positive definite.
    pub fn new(metric: Array2<f64>) -> Result<Self, SystemError> {
        let chol = metric
            .cholesky_lower()
            .ok_or(SystemError::NotPositiveDefinite {
                operation: "Euclidean metric",
            })?;
        Ok(Self { metric, chol })
    }

    /// The covariance matrix.
    pub fn metric(&self) -> &Array2<f64> {
        &self.metric
    }

    /// Lower Cholesky factor of the covariance.
    pub fn chol_metric(&self) -> &Array2<f64> {
        &self.chol
    }
}

impl EuclideanMetric for DenseMetric {
    fn kin_energy(&self, mom: &Array1<f64>) -> f64 {
        0.5 * mom.dot(&self.grad_kin_energy(mom))
    }

    fn grad_kin_energy(&self, mom: &Array1<f64>) -> Array1<f64> {
        // The factor has strictly positive diagonal by construction.
        self.chol
            .cho_solve(mom)
            .expect("Cholesky factor of a positive definite metric is nonsingular")
    }

    fn sample_momentum(&self, n_dim: usize, rng: &mut dyn RngCore) -> Array1<f64> {
        self.chol.dot(&draw_standard_normal(n_dim, rng))
    }

    fn mult_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        self.metric.dot(rhs)
    }

    fn mult_inv_metric(&self, rhs: &Array1<f64>) -> Array1<f64> {
        self.chol
            .cho_solve(rhs)
            .expect("Cholesky factor of a positive definite metric is nonsingular")
    }

    fn mult_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        self.metric.dot(rhs)
    }

    fn mult_inv_metric_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        self.chol
            .cho_solve_mat(rhs)
            .expect("Cholesky factor of a positive definite metric is nonsingular")
    }
}

/// Separable Hamiltonian system with a fixed Euclidean metric.
#[derive(Debug)]
pub struct EuclideanMetricSystem<M: EuclideanMetric> {
    potential: ResolvedPotential,
    metric: M,
}

/// Identity-covariance system.
pub type IsotropicEuclideanMetricSystem = EuclideanMetricSystem<IsotropicMetric>;
/// Diagonal-covariance system.
pub type DiagonalEuclideanMetricSystem = EuclideanMetricSystem<DiagonalMetric>;
/// Dense-covariance system.
pub type DenseEuclideanMetricSystem = EuclideanMetricSystem<DenseMetric>;

impl<M: EuclideanMetric> EuclideanMetricSystem<M> {
    /// Composes a potential with a metric, resolving the potential gradient
    /// against the optional differentiation collaborator.
    pub fn new(
        potential: Potential,
        metric: M,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        Ok(Self {
            potential: potential.resolve(diff)?,
            metric,
        })
    }

    /// The injected metric.
    pub fn metric(&self) -> &M {
        &self.metric
    }

    pub(crate) fn potential(&self) -> &ResolvedPotential {
        &self.potential
    }

    /// Kinetic energy, cached on the momentum.
    pub fn kin_energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Mom, "kin_energy", |s| {
            Ok(CachedValue::Scalar(self.metric.kin_energy(s.mom())))
        })
        .map(CachedValue::into_scalar)
    }

    /// Gradient of the kinetic energy, cached on the momentum.
    pub fn grad_kin_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Mom, "grad_kin_energy", |s| {
            Ok(CachedValue::Vector(self.metric.grad_kin_energy(s.mom())))
        })
        .map(CachedValue::into_vector)
    }

    /// Maps a position velocity `dh_dmom` back to the momentum generating it.
    pub fn solve_dh_dmom_for_mom(&self, dpos_dt: &Array1<f64>) -> Array1<f64> {
        self.metric.mult_metric(dpos_dt)
    }
}

impl<M: EuclideanMetric> HamiltonianSystem for EuclideanMetricSystem<M> {
    fn pot_energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        self.potential.energy(state)
    }

    fn grad_pot_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.potential.grad(state)
    }

    fn h(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        Ok(self.pot_energy(state)? + self.kin_energy(state)?)
    }

    fn dh_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.grad_pot_energy(state)
    }

    fn dh_dmom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.grad_kin_energy(state)
    }

    fn sample_momentum(
        &self,
        state: &mut ChainState,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, SystemError> {
        Ok(self.metric.sample_momentum(state.n_dim(), rng))
    }
}
