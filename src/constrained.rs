/*!
# Constrained & Observed-Generator Systems.

[`ConstrainedSystem`] wraps a Euclidean-metric system with an equality
constraint `constr(pos) = 0` defining a sub-manifold, and keeps sampled
momenta tangent to it: `project_onto_tangent_space` removes the momentum
component normal to the manifold through the Cholesky-factored Gram matrix
`J·M⁻¹·Jᵗ` of the constraint Jacobian `J`. A rank-deficient Jacobian makes
the Gram matrix non-positive-definite and surfaces as
[`SystemError::NotPositiveDefinite`].

[`ObservedGeneratorSystem`] specializes the constraint to an implicitly
defined observation manifold: a forward `generator(pos)` pinned to a fixed
observed output, so `constr = generator(pos) − observed_output`. Conditioning
on the observation adds `log √det Gram` to the Hamiltonian; its
position-gradient contracts `Gram⁻¹·J` against the generator's second
derivative through the matrix-Hessian-product operator.

Both are compositions over an injected [`EuclideanMetric`] — the metric,
constraint and generator behaviors combine by parameterization, not
inheritance.
*/

use crate::diff::{resolve, Differentiator, JacobFn, MhpFn, VectorValuedFn};
use crate::errors::SystemError;
use crate::euclidean::{EuclideanMetric, EuclideanMetricSystem};
use crate::hamiltonian::{HamiltonianSystem, Potential};
use crate::linalg::{log_diag_sum, MatrixOps, TriangularOps};
use crate::state::{cached, cached_multi, CachedValue, ChainState, Deps};
use ndarray::{Array1, Array2};
use rand::RngCore;
use std::sync::Arc;

/// An equality constraint function plus an optional explicit Jacobian.
pub struct Constraint {
    f: VectorValuedFn,
    jacob: Option<JacobFn>,
}

impl Constraint {
    /// Wraps the constraint closure; it must vanish on the constraint
    /// manifold.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Array1<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            jacob: None,
        }
    }

    /// Supplies the explicit Jacobian, returning `(jacobian, value)`.
    pub fn with_jacob<F>(mut self, jacob: F) -> Self
    where
        F: Fn(&Array1<f64>) -> (Array2<f64>, Array1<f64>) + Send + Sync + 'static,
    {
        self.jacob = Some(Box::new(jacob));
        self
    }
}

/// A forward generator function plus optional explicit Jacobian and
/// matrix-Hessian-product operators.
pub struct Generator {
    f: VectorValuedFn,
    jacob: Option<JacobFn>,
    mhp: Option<MhpFn>,
}

impl Generator {
    /// Wraps the generator closure mapping position to simulated output.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Array1<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            jacob: None,
            mhp: None,
        }
    }

    /// Supplies the explicit Jacobian, returning `(jacobian, value)`.
    pub fn with_jacob<F>(mut self, jacob: F) -> Self
    where
        F: Fn(&Array1<f64>) -> (Array2<f64>, Array1<f64>) + Send + Sync + 'static,
    {
        self.jacob = Some(Box::new(jacob));
        self
    }

    /// Supplies the explicit matrix-Hessian product:
    /// `mhp(pos, m)[k] = Σᵢⱼ m[i,j]·∂jac[i,j]/∂pos[k]`.
    pub fn with_mhp<F>(mut self, mhp: F) -> Self
    where
        F: Fn(&Array1<f64>, &Array2<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        self.mhp = Some(Box::new(mhp));
        self
    }
}

/// Factorizes the Gram matrix `J·M⁻¹·Jᵗ` of a constraint Jacobian.
fn chol_gram_of<M: EuclideanMetric>(
    jacob: &Array2<f64>,
    metric: &M,
) -> Result<Array2<f64>, SystemError> {
    let inv_metric_jacob_t = metric.mult_inv_metric_mat(&jacob.t().to_owned());
    let gram = jacob.dot(&inv_metric_jacob_t);
    gram.cholesky_lower().ok_or(SystemError::NotPositiveDefinite {
        operation: "constraint Gram matrix",
    })
}

/// Removes the momentum component normal to the constraint manifold:
/// `mom -= Jᵗ·Gram⁻¹·J·M⁻¹·mom`.
fn project_momentum<M: EuclideanMetric>(
    mom: &mut Array1<f64>,
    jacob: &Array2<f64>,
    chol_gram: &Array2<f64>,
    metric: &M,
) -> Result<(), SystemError> {
    let jacob_inv_metric_mom = jacob.dot(&metric.mult_inv_metric(mom));
    let coeffs = chol_gram.cho_solve(&jacob_inv_metric_mom)?;
    *mom -= &jacob.t().dot(&coeffs);
    Ok(())
}

/// Euclidean-metric Hamiltonian system restricted to the zero set of an
/// equality constraint.
pub struct ConstrainedSystem<M: EuclideanMetric> {
    base: EuclideanMetricSystem<M>,
    constr: VectorValuedFn,
    jacob_constr: JacobFn,
}

/// Identity-metric constrained system.
pub type IsotropicConstrainedSystem = ConstrainedSystem<crate::euclidean::IsotropicMetric>;
/// Diagonal-metric constrained system.
pub type DiagonalConstrainedSystem = ConstrainedSystem<crate::euclidean::DiagonalMetric>;
/// Dense-metric constrained system.
pub type DenseConstrainedSystem = ConstrainedSystem<crate::euclidean::DenseMetric>;

impl<M: EuclideanMetric> ConstrainedSystem<M> {
    /// Composes a potential, a metric and a constraint, resolving the
    /// missing derivatives against the collaborator.
    pub fn new(
        potential: Potential,
        metric: M,
        constraint: Constraint,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        let base = EuclideanMetricSystem::new(potential, metric, diff)?;
        let Constraint { f, jacob } = constraint;
        let jacob_constr = resolve(jacob, diff, "jacob_constr", |d| {
            d.jacobian_and_value(f.clone())
        })?;
        Ok(Self {
            base,
            constr: f,
            jacob_constr,
        })
    }

    /// The wrapped unconstrained system.
    pub fn base(&self) -> &EuclideanMetricSystem<M> {
        &self.base
    }

    /// Constraint value at the state's position, cached on the position.
    pub fn constr(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "constr", |s| {
            Ok(CachedValue::Vector((self.constr)(s.pos())))
        })
        .map(CachedValue::into_vector)
    }

    /// Constraint Jacobian; the underlying call also fills the constraint
    /// value entry.
    pub fn jacob_constr(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached_multi(state, Deps::Pos, &["jacob_constr", "constr"], |s| {
            let (jacob, value) = (self.jacob_constr)(s.pos());
            Ok(vec![CachedValue::Matrix(jacob), CachedValue::Vector(value)])
        })
        .map(CachedValue::into_matrix)
    }

    /// `M⁻¹·Jᵗ`, cached on the position.
    pub fn inv_metric_jacob_constr_t(
        &self,
        state: &mut ChainState,
    ) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "inv_metric_jacob_constr_t", |s| {
            let jacob = self.jacob_constr(s)?;
            Ok(CachedValue::Matrix(
                self.base.metric().mult_inv_metric_mat(&jacob.t().to_owned()),
            ))
        })
        .map(CachedValue::into_matrix)
    }

    /// Lower Cholesky factor of the Gram matrix `J·M⁻¹·Jᵗ`, cached on the
    /// position.
    pub fn chol_gram(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "chol_gram", |s| {
            let jacob = self.jacob_constr(s)?;
            let inv_metric_jacob_t = self.inv_metric_jacob_constr_t(s)?;
            let gram = jacob.dot(&inv_metric_jacob_t);
            let chol = gram.cholesky_lower().ok_or(SystemError::NotPositiveDefinite {
                operation: "constraint Gram matrix",
            })?;
            Ok(CachedValue::Matrix(chol))
        })
        .map(CachedValue::into_matrix)
    }

    /// Projects `mom` in place onto the tangent space of the constraint
    /// manifold at the state's position; afterwards `J·mom ≈ 0`.
    pub fn project_onto_tangent_space(
        &self,
        mom: &mut Array1<f64>,
        state: &mut ChainState,
    ) -> Result<(), SystemError> {
        let jacob = self.jacob_constr(state)?;
        let chol_gram = self.chol_gram(state)?;
        project_momentum(mom, &jacob, &chol_gram, self.base.metric())
    }

    /// Maps a position velocity back to the momentum generating it.
    pub fn solve_dh_dmom_for_mom(&self, dpos_dt: &Array1<f64>) -> Array1<f64> {
        self.base.solve_dh_dmom_for_mom(dpos_dt)
    }
}

impl<M: EuclideanMetric> HamiltonianSystem for ConstrainedSystem<M> {
    fn pot_energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        self.base.pot_energy(state)
    }

    fn grad_pot_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.base.grad_pot_energy(state)
    }

    fn h(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        self.base.h(state)
    }

    fn dh_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.base.dh_dpos(state)
    }

    fn dh_dmom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.base.dh_dmom(state)
    }

    /// Draws from the unconstrained marginal, then projects onto the tangent
    /// space.
    fn sample_momentum(
        &self,
        state: &mut ChainState,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, SystemError> {
        let mut mom = self.base.sample_momentum(state, rng)?;
        self.project_onto_tangent_space(&mut mom, state)?;
        Ok(mom)
    }
}

/// Constrained system whose manifold is defined implicitly by pinning a
/// forward generator to an observed output.
pub struct ObservedGeneratorSystem<M: EuclideanMetric> {
    base: EuclideanMetricSystem<M>,
    generator: VectorValuedFn,
    jacob_generator: JacobFn,
    mhp_generator: MhpFn,
    obs_output: Array1<f64>,
}

/// Identity-metric observed-generator system.
pub type IsotropicObservedGeneratorSystem =
    ObservedGeneratorSystem<crate::euclidean::IsotropicMetric>;
/// Diagonal-metric observed-generator system.
pub type DiagonalObservedGeneratorSystem =
    ObservedGeneratorSystem<crate::euclidean::DiagonalMetric>;
/// Dense-metric observed-generator system.
pub type DenseObservedGeneratorSystem = ObservedGeneratorSystem<crate::euclidean::DenseMetric>;

impl<M: EuclideanMetric> ObservedGeneratorSystem<M> {
    /// Composes the negative log input density, a metric, a generator and
    /// its observed output.
    pub fn new(
        neg_log_input_density: Potential,
        metric: M,
        generator: Generator,
        obs_output: Array1<f64>,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        let base = EuclideanMetricSystem::new(neg_log_input_density, metric, diff)?;
        let Generator { f, jacob, mhp } = generator;
        let jacob_generator = resolve(jacob, diff, "jacob_generator", |d| {
            d.jacobian_and_value(f.clone())
        })?;
        let mhp_generator = resolve(mhp, diff, "mhp_generator", |d| {
            d.mhp_jacobian(f.clone())
        })?;
        Ok(Self {
            base,
            generator: f,
            jacob_generator,
            mhp_generator,
            obs_output,
        })
    }

    /// The wrapped unconstrained system.
    pub fn base(&self) -> &EuclideanMetricSystem<M> {
        &self.base
    }

    /// The fixed observed output.
    pub fn obs_output(&self) -> &Array1<f64> {
        &self.obs_output
    }

    /// Generator output at the state's position, cached on the position.
    pub fn generator(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "generator", |s| {
            Ok(CachedValue::Vector((self.generator)(s.pos())))
        })
        .map(CachedValue::into_vector)
    }

    /// Generator Jacobian; the underlying call also fills the generator
    /// output entry.
    pub fn jacob_generator(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached_multi(state, Deps::Pos, &["jacob_generator", "generator"], |s| {
            let (jacob, value) = (self.jacob_generator)(s.pos());
            Ok(vec![CachedValue::Matrix(jacob), CachedValue::Vector(value)])
        })
        .map(CachedValue::into_matrix)
    }

    /// Implicit constraint `generator(pos) − observed_output`.
    pub fn constr(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        Ok(self.generator(state)? - &self.obs_output)
    }

    /// Constraint Jacobian: the generator Jacobian.
    pub fn jacob_constr(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        self.jacob_generator(state)
    }

    /// Lower Cholesky factor of the generator Gram matrix, cached on the
    /// position.
    pub fn chol_gram(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "chol_gram", |s| {
            let jacob = self.jacob_generator(s)?;
            Ok(CachedValue::Matrix(chol_gram_of(
                &jacob,
                self.base.metric(),
            )?))
        })
        .map(CachedValue::into_matrix)
    }

    /// `log √det Gram`, the conditioning correction added to the
    /// Hamiltonian, cached on the position.
    pub fn log_det_sqrt_gram(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Pos, "log_det_sqrt_gram", |s| {
            let chol_gram = self.chol_gram(s)?;
            Ok(CachedValue::Scalar(log_diag_sum(&chol_gram)))
        })
        .map(CachedValue::into_scalar)
    }

    /// Position-gradient of [`ObservedGeneratorSystem::log_det_sqrt_gram`],
    /// cached on the position.
    pub fn grad_log_det_sqrt_gram(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "grad_log_det_sqrt_gram", |s| {
            let jacob = self.jacob_generator(s)?;
            let chol_gram = self.chol_gram(s)?;
            let gram_inv_jacob = chol_gram.cho_solve_mat(&jacob)?;
            Ok(CachedValue::Vector((self.mhp_generator)(
                s.pos(),
                &gram_inv_jacob,
            )))
        })
        .map(CachedValue::into_vector)
    }

    /// Projects `mom` in place onto the tangent space of the observation
    /// manifold.
    pub fn project_onto_tangent_space(
        &self,
        mom: &mut Array1<f64>,
        state: &mut ChainState,
    ) -> Result<(), SystemError> {
        let jacob = self.jacob_generator(state)?;
        let chol_gram = self.chol_gram(state)?;
        project_momentum(mom, &jacob, &chol_gram, self.base.metric())
    }

    /// Maps a position velocity back to the momentum generating it.
    pub fn solve_dh_dmom_for_mom(&self, dpos_dt: &Array1<f64>) -> Array1<f64> {
        self.base.solve_dh_dmom_for_mom(dpos_dt)
    }
}

impl<M: EuclideanMetric> HamiltonianSystem for ObservedGeneratorSystem<M> {
    fn pot_energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        self.base.pot_energy(state)
    }

    fn grad_pot_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.base.grad_pot_energy(state)
    }

    /// Total energy including the observation-conditioning correction.
    fn h(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        Ok(self.base.pot_energy(state)?
            + self.log_det_sqrt_gram(state)?
            + self.base.kin_energy(state)?)
    }

    fn dh_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        Ok(self.base.grad_pot_energy(state)? + self.grad_log_det_sqrt_gram(state)?)
    }

    fn dh_dmom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        self.base.dh_dmom(state)
    }

    fn sample_momentum(
        &self,
        state: &mut ChainState,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, SystemError> {
        let mut mom = self.base.sample_momentum(state, rng)?;
        self.project_onto_tangent_space(&mut mom, state)?;
        Ok(mom)
    }
}
