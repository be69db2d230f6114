/*!
# Riemannian Metric Family.

Non-separable Hamiltonian systems whose metric depends on the position. The
total energy splits as `h = h1 + h2` with

- `h1 = pot_energy + log_det_sqrt_metric`, the position-only term including
  the metric volume correction, and
- `h2 = ½·mom·M(pos)⁻¹·mom`, the quadratic momentum term.

The position-dependent geometry is a capability object implementing
[`RiemannianGeometry`]; [`RiemannianMetricSystem`] composes it with a
resolved potential and derives the energy/derivative surface from the five
geometric quantities. Two Cholesky-based geometries live here — the metric
given as a dense matrix function of position ([`DenseMetricGeometry`]) and
the metric given directly through its lower Cholesky factor
([`CholeskyMetricGeometry`]) — while the SoftAbs eigen-regularized geometry
is in [`crate::softabs`].

Position-gradients of the metric terms are obtained through a
vector-Jacobian product of the metric (or factor) function, supplied
explicitly or derived by the differentiation collaborator.
*/

use crate::diff::{resolve, Differentiator, MatrixValuedFn, VjpFn};
use crate::errors::SystemError;
use crate::hamiltonian::{draw_standard_normal, HamiltonianSystem, Potential};
use crate::linalg::{log_diag_sum, outer, MatrixOps, TriangularOps};
use crate::state::{cached, CachedValue, ChainState, Deps};
use ndarray::{Array1, Array2};
use rand::RngCore;
use std::sync::Arc;

/// Position-dependent metric capability: the five derived quantities the
/// system contract is built from. All of them memoize in the passed state.
pub trait RiemannianGeometry: Send + Sync {
    /// A square root `S` of the metric with `S·Sᵗ = M(pos)`, used to color
    /// momentum draws.
    fn sqrt_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError>;

    /// `log √det M(pos)`.
    fn log_det_sqrt_metric(&self, state: &mut ChainState) -> Result<f64, SystemError>;

    /// Position-gradient of [`RiemannianGeometry::log_det_sqrt_metric`].
    fn grad_log_det_sqrt_metric(&self, state: &mut ChainState)
        -> Result<Array1<f64>, SystemError>;

    /// `M(pos)⁻¹·mom`.
    fn inv_metric_mom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError>;

    /// Position-gradient of the quadratic form `mom·M(pos)⁻¹·mom`.
    fn grad_mom_inv_metric_mom(&self, state: &mut ChainState)
        -> Result<Array1<f64>, SystemError>;
}

/// A metric (or metric Cholesky factor) as a function of position, plus an
/// optional explicit vector-Jacobian product of that function.
pub struct MetricFunction {
    f: MatrixValuedFn,
    vjp: Option<VjpFn>,
}

impl MetricFunction {
    /// Wraps the matrix-valued closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Array1<f64>) -> Array2<f64> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            vjp: None,
        }
    }

    /// Supplies the explicit VJP: `vjp(pos, c)[k] = Σᵢⱼ c[i,j]·∂m[i,j]/∂pos[k]`.
    pub fn with_vjp<F>(mut self, vjp: F) -> Self
    where
        F: Fn(&Array1<f64>, &Array2<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        self.vjp = Some(Box::new(vjp));
        self
    }

    fn resolve(
        self,
        diff: Option<&dyn Differentiator>,
        name: &'static str,
    ) -> Result<(MatrixValuedFn, VjpFn), SystemError> {
        let f = self.f;
        let vjp = resolve(self.vjp, diff, name, |d| d.vjp_matrix(f.clone()))?;
        Ok((f, vjp))
    }
}

/// Hamiltonian system over an injected Riemannian geometry.
pub struct RiemannianMetricSystem<G: RiemannianGeometry> {
    potential: crate::hamiltonian::ResolvedPotential,
    geometry: G,
}

/// Dense position-dependent metric system.
pub type DenseRiemannianMetricSystem = RiemannianMetricSystem<DenseMetricGeometry>;
/// System whose metric is supplied through its Cholesky factor.
pub type CholeskyFactoredRiemannianMetricSystem = RiemannianMetricSystem<CholeskyMetricGeometry>;

impl<G: RiemannianGeometry> RiemannianMetricSystem<G> {
    pub(crate) fn from_parts(
        potential: crate::hamiltonian::ResolvedPotential,
        geometry: G,
    ) -> Self {
        Self {
            potential,
            geometry,
        }
    }

    /// The injected geometry.
    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    /// Position-only energy term: potential plus metric volume correction.
    pub fn h1(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        Ok(self.potential.energy(state)? + self.geometry.log_det_sqrt_metric(state)?)
    }

    /// Quadratic momentum term `½·mom·M⁻¹·mom`.
    pub fn h2(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        let inv_metric_mom = self.geometry.inv_metric_mom(state)?;
        Ok(0.5 * state.mom().dot(&inv_metric_mom))
    }

    /// Position-gradient of [`RiemannianMetricSystem::h1`].
    pub fn dh1_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        Ok(self.potential.grad(state)? + self.geometry.grad_log_det_sqrt_metric(state)?)
    }

    /// Position-gradient of [`RiemannianMetricSystem::h2`].
    pub fn dh2_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        Ok(0.5 * self.geometry.grad_mom_inv_metric_mom(state)?)
    }
}

impl<G: RiemannianGeometry> HamiltonianSystem for RiemannianMetricSystem<G> {
    fn pot_energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        self.potential.energy(state)
    }

    fn grad_pot_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.potential.grad(state)
    }

    fn h(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        Ok(self.h1(state)? + self.h2(state)?)
    }

    fn dh_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        Ok(self.dh1_dpos(state)? + self.dh2_dpos(state)?)
    }

    fn dh_dmom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.geometry.inv_metric_mom(state)
    }

    fn sample_momentum(
        &self,
        state: &mut ChainState,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, SystemError> {
        let sqrt_metric = self.geometry.sqrt_metric(state)?;
        let noise = draw_standard_normal(state.n_dim(), rng);
        Ok(sqrt_metric.dot(&noise))
    }
}

/// Geometry for a dense metric given as a matrix function of position.
///
/// The Cholesky factor of the metric is cached on the position and shared by
/// the log-determinant, the momentum solve, and the inverse used in the
/// volume-correction gradient.
pub struct DenseMetricGeometry {
    metric: MatrixValuedFn,
    vjp_metric: VjpFn,
}

impl DenseMetricGeometry {
    fn chol_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "chol_metric", |s| {
            let metric = cached(s, Deps::Pos, "metric", |s| {
                Ok(CachedValue::Matrix((self.metric)(s.pos())))
            })?
            .into_matrix();
            let chol = metric
                .cholesky_lower()
                .ok_or(SystemError::NotPositiveDefinite {
                    operation: "Riemannian metric",
                })?;
            Ok(CachedValue::Matrix(chol))
        })
        .map(CachedValue::into_matrix)
    }

    fn inv_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "inv_metric", |s| {
            let chol = self.chol_metric(s)?;
            let eye = Array2::<f64>::eye(s.n_dim());
            Ok(CachedValue::Matrix(chol.cho_solve_mat(&eye)?))
        })
        .map(CachedValue::into_matrix)
    }
}

impl RiemannianMetricSystem<DenseMetricGeometry> {
    /// Composes a potential with a dense position-dependent metric.
    pub fn new(
        potential: Potential,
        metric: MetricFunction,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        let (metric, vjp_metric) = metric.resolve(diff, "vjp_metric")?;
        Ok(Self::from_parts(
            potential.resolve(diff)?,
            DenseMetricGeometry { metric, vjp_metric },
        ))
    }
}

impl RiemannianGeometry for DenseMetricGeometry {
    fn sqrt_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        self.chol_metric(state)
    }

    fn log_det_sqrt_metric(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Pos, "log_det_sqrt_metric", |s| {
            let chol = self.chol_metric(s)?;
            Ok(CachedValue::Scalar(log_diag_sum(&chol)))
        })
        .map(CachedValue::into_scalar)
    }

    fn grad_log_det_sqrt_metric(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "grad_log_det_sqrt_metric", |s| {
            let inv_metric = self.inv_metric(s)?;
            let grad = 0.5 * (self.vjp_metric)(s.pos(), &inv_metric);
            Ok(CachedValue::Vector(grad))
        })
        .map(CachedValue::into_vector)
    }

    fn inv_metric_mom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "inv_metric_mom", |s| {
            let chol = self.chol_metric(s)?;
            Ok(CachedValue::Vector(chol.cho_solve(s.mom())?))
        })
        .map(CachedValue::into_vector)
    }

    fn grad_mom_inv_metric_mom(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "grad_mom_inv_metric_mom", |s| {
            let inv_metric_mom = self.inv_metric_mom(s)?;
            let cotangent = outer(&inv_metric_mom, &inv_metric_mom);
            Ok(CachedValue::Vector(-(self.vjp_metric)(s.pos(), &cotangent)))
        })
        .map(CachedValue::into_vector)
    }
}

/// Geometry for a metric supplied directly through its lower Cholesky factor
/// as a function of position.
pub struct CholeskyMetricGeometry {
    chol_metric: MatrixValuedFn,
    vjp_chol_metric: VjpFn,
}

impl CholeskyMetricGeometry {
    fn chol_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "chol_metric", |s| {
            Ok(CachedValue::Matrix((self.chol_metric)(s.pos())))
        })
        .map(CachedValue::into_matrix)
    }

    fn inv_chol_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "inv_chol_metric", |s| {
            let chol = self.chol_metric(s)?;
            let eye = Array2::<f64>::eye(s.n_dim());
            Ok(CachedValue::Matrix(chol.solve_lower_mat(&eye)?))
        })
        .map(CachedValue::into_matrix)
    }
}

impl RiemannianMetricSystem<CholeskyMetricGeometry> {
    /// Composes a potential with a factor-parameterized metric.
    pub fn new(
        potential: Potential,
        chol_metric: MetricFunction,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        let (chol_metric, vjp_chol_metric) = chol_metric.resolve(diff, "vjp_chol_metric")?;
        Ok(Self::from_parts(
            potential.resolve(diff)?,
            CholeskyMetricGeometry {
                chol_metric,
                vjp_chol_metric,
            },
        ))
    }
}

impl RiemannianGeometry for CholeskyMetricGeometry {
    fn sqrt_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        self.chol_metric(state)
    }

    fn log_det_sqrt_metric(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Pos, "log_det_sqrt_metric", |s| {
            let chol = self.chol_metric(s)?;
            Ok(CachedValue::Scalar(log_diag_sum(&chol)))
        })
        .map(CachedValue::into_scalar)
    }

    fn grad_log_det_sqrt_metric(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "grad_log_det_sqrt_metric", |s| {
            let inv_chol = self.inv_chol_metric(s)?;
            let grad = (self.vjp_chol_metric)(s.pos(), &inv_chol.t().to_owned());
            Ok(CachedValue::Vector(grad))
        })
        .map(CachedValue::into_vector)
    }

    fn inv_metric_mom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "inv_metric_mom", |s| {
            let chol = self.chol_metric(s)?;
            Ok(CachedValue::Vector(chol.cho_solve(s.mom())?))
        })
        .map(CachedValue::into_vector)
    }

    fn grad_mom_inv_metric_mom(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "grad_mom_inv_metric_mom", |s| {
            let chol = self.chol_metric(s)?;
            let inv_chol_metric_mom = chol.solve_lower(s.mom())?;
            let inv_metric_mom = self.inv_metric_mom(s)?;
            let cotangent = outer(&inv_metric_mom, &inv_chol_metric_mom);
            let grad = -2.0 * (self.vjp_chol_metric)(s.pos(), &cotangent);
            Ok(CachedValue::Vector(grad))
        })
        .map(CachedValue::into_vector)
    }
}
