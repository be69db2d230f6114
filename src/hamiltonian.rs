/*!
# Hamiltonian System Contract.

A Hamiltonian system evaluates a total energy `h` over a [`ChainState`]'s
position and momentum, the partial derivatives `dh_dpos` / `dh_dmom` consumed
by the outer integrator, and draws momentum from the system's implied marginal
distribution. Every concrete family in this crate ([`crate::euclidean`],
[`crate::riemannian`], [`crate::constrained`]) implements the object-safe
[`HamiltonianSystem`] trait; a capability a family lacks simply is not in its
API, there are no "not implemented" runtime failures.

Systems are immutable after construction: the user-supplied potential and any
optional derivatives are resolved once in `new` (see [`Potential`]) and all
per-call memoization lives in the state that is passed in. Randomness is drawn
exclusively from the generator injected into
[`HamiltonianSystem::sample_momentum`].
*/

use crate::diff::{resolve, Differentiator, GradFn, HessFn, MtpFn, ScalarFn};
use crate::errors::SystemError;
use crate::state::{cached, cached_multi, CachedValue, ChainState, Deps};
use ndarray::Array1;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use std::sync::Arc;

/// Energy / derivative / momentum-sampling contract shared by every system
/// family.
///
/// All operations take the state mutably because derived quantities are
/// memoized inside it; logically they are pure functions of `(system, state)`.
pub trait HamiltonianSystem {
    /// Potential energy (negative log target density) at the state's
    /// position, cached on the position.
    fn pot_energy(&self, state: &mut ChainState) -> Result<f64, SystemError>;

    /// Gradient of the potential energy, cached on the position.
    fn grad_pot_energy(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError>;

    /// Total energy.
    fn h(&self, state: &mut ChainState) -> Result<f64, SystemError>;

    /// Partial derivative of `h` with respect to position.
    fn dh_dpos(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError>;

    /// Partial derivative of `h` with respect to momentum.
    fn dh_dmom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError>;

    /// Draws a momentum from the marginal distribution implied by the
    /// system's kinetic term, consuming randomness only from `rng`.
    fn sample_momentum(
        &self,
        state: &mut ChainState,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, SystemError>;
}

/// Draws a standard-normal vector of the given length from an injected
/// generator.
pub fn draw_standard_normal(n_dim: usize, rng: &mut dyn RngCore) -> Array1<f64> {
    Array1::from_shape_fn(n_dim, |_| rng.sample::<f64, _>(StandardNormal))
}

/// A potential-energy function plus optional explicit derivatives.
///
/// Built once and handed to a system constructor, which resolves each
/// derivative it needs into a required function — either the explicit closure
/// given here or one derived by the differentiation collaborator — and fails
/// with [`SystemError::MissingDerivative`] otherwise.
///
/// ```
/// use geometric_mcmc::hamiltonian::Potential;
/// use ndarray::Array1;
///
/// let potential = Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q))
///     .with_grad(|q: &Array1<f64>| (q.clone(), 0.5 * q.dot(q)));
/// ```
pub struct Potential {
    f: ScalarFn,
    grad: Option<GradFn>,
    hess: Option<HessFn>,
    mtp: Option<MtpFn>,
}

impl Potential {
    /// Wraps the base potential-energy closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            grad: None,
            hess: None,
            mtp: None,
        }
    }

    /// Supplies an explicit gradient, returning `(gradient, value)`.
    pub fn with_grad<F>(mut self, grad: F) -> Self
    where
        F: Fn(&Array1<f64>) -> (Array1<f64>, f64) + Send + Sync + 'static,
    {
        self.grad = Some(Box::new(grad));
        self
    }

    /// Supplies an explicit Hessian, returning `(hessian, gradient, value)`.
    /// Consumed only by the SoftAbs family.
    pub fn with_hess<F>(mut self, hess: F) -> Self
    where
        F: Fn(&Array1<f64>) -> (ndarray::Array2<f64>, Array1<f64>, f64) + Send + Sync + 'static,
    {
        self.hess = Some(Box::new(hess));
        self
    }

    /// Supplies an explicit matrix-transpose product against the potential's
    /// third-derivative tensor. Consumed only by the SoftAbs family.
    pub fn with_mtp<F>(mut self, mtp: F) -> Self
    where
        F: Fn(&Array1<f64>, &ndarray::Array2<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        self.mtp = Some(Box::new(mtp));
        self
    }

    /// Resolves the gradient and returns the runtime form used by every
    /// system. Higher derivatives left in `self` are dropped; the SoftAbs
    /// constructor extracts them first via [`Potential::into_parts`].
    pub(crate) fn resolve(
        self,
        diff: Option<&dyn Differentiator>,
    ) -> Result<ResolvedPotential, SystemError> {
        let (f, grad, _, _) = self.into_parts();
        let grad = resolve(grad, diff, "grad_pot_energy", |d| {
            d.grad_and_value(f.clone())
        })?;
        Ok(ResolvedPotential { f, grad })
    }

    pub(crate) fn into_parts(self) -> (ScalarFn, Option<GradFn>, Option<HessFn>, Option<MtpFn>) {
        (self.f, self.grad, self.hess, self.mtp)
    }
}

/// A potential whose gradient has been resolved at construction time.
pub(crate) struct ResolvedPotential {
    f: ScalarFn,
    grad: GradFn,
}

impl std::fmt::Debug for ResolvedPotential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPotential").finish_non_exhaustive()
    }
}

impl ResolvedPotential {
    pub(crate) fn from_parts(f: ScalarFn, grad: GradFn) -> Self {
        Self { f, grad }
    }

    /// Potential energy, cached on the position.
    pub(crate) fn energy(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Pos, "pot_energy", |s| {
            Ok(CachedValue::Scalar((self.f)(s.pos())))
        })
        .map(CachedValue::into_scalar)
    }

    /// Gradient of the potential energy; the underlying call also yields the
    /// value, so both cache entries fill together.
    pub(crate) fn grad(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached_multi(
            state,
            Deps::Pos,
            &["grad_pot_energy", "pot_energy"],
            |s| {
                let (grad, value) = (self.grad)(s.pos());
                Ok(vec![CachedValue::Vector(grad), CachedValue::Scalar(value)])
            },
        )
        .map(CachedValue::into_vector)
    }
}
