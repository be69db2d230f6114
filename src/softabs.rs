/*!
# SoftAbs Eigen-Regularized Metric.

Builds a position-dependent metric from the Hessian of the potential energy:
the Hessian is symmetric-eigendecomposed and each eigenvalue `λ` replaced by

```text
softabs(λ) = λ / tanh(λ·c)
```

with regularization coefficient `c`. The transform tends to `|λ|` away from
zero and stays bounded near `1/c` close to zero, so the resulting metric is
positive definite even where the Hessian is indefinite or singular. At
exactly `λ = 0` the raw expression is `0/0`; the finite limit is a documented
precondition on callers, not a special case in the code.

Position-gradients of the metric terms need the derivative of the
eigendecomposition. That enters through the divided-difference matrix

```text
J[i,j] = (softabs(λᵢ) − softabs(λⱼ)) / (λᵢ − λⱼ)    i ≠ j
J[i,i] = grad_softabs(λᵢ)
```

whose off-diagonal denominators use the raw Hessian eigenvalues (diagonal
filled from the limit). Both gradients are linear functionals of the
potential's third-derivative tensor, reached by rotating an outer product
into the eigenvector basis and feeding it through the matrix-transpose
product operator of the potential.
*/

use crate::diff::{resolve, Differentiator, HessFn, MtpFn};
use crate::errors::SystemError;
use crate::hamiltonian::Potential;
use crate::linalg::{outer, MatrixOps};
use crate::riemannian::{RiemannianGeometry, RiemannianMetricSystem};
use crate::state::{cached, cached_multi, CachedValue, ChainState, Deps, EigenBasis};
use ndarray::{Array1, Array2};

/// SoftAbs-regularized system over the potential's Hessian.
pub type SoftAbsRiemannianMetricSystem = RiemannianMetricSystem<SoftAbsGeometry>;

/// `softabs(x) = x / tanh(x·c)`: a smooth, strictly positive surrogate for
/// `|x|`. Undefined (NaN) at exactly `x = 0`; tends to `1/c` in the limit.
pub fn softabs(x: f64, coeff: f64) -> f64 {
    x / (x * coeff).tanh()
}

/// Derivative of [`softabs`] with respect to `x`.
pub fn grad_softabs(x: f64, coeff: f64) -> f64 {
    1.0 / (coeff * x).tanh() - coeff * x / (coeff * x).sinh().powi(2)
}

/// Geometry deriving the metric from the eigendecomposition of the
/// potential's Hessian.
pub struct SoftAbsGeometry {
    hess: HessFn,
    mtp: MtpFn,
    softabs_coeff: f64,
}

impl RiemannianMetricSystem<SoftAbsGeometry> {
    /// Builds the SoftAbs system. The potential's Hessian and
    /// matrix-transpose-product operators are taken from the [`Potential`]
    /// if supplied, otherwise derived by the collaborator.
    pub fn new(
        potential: Potential,
        softabs_coeff: f64,
        diff: Option<&dyn Differentiator>,
    ) -> Result<Self, SystemError> {
        let (f, grad, hess, mtp) = potential.into_parts();
        let grad = resolve(grad, diff, "grad_pot_energy", |d| {
            d.grad_and_value(f.clone())
        })?;
        let hess = resolve(hess, diff, "hess_pot_energy", |d| {
            d.hessian_grad_and_value(f.clone())
        })?;
        let mtp = resolve(mtp, diff, "mtp_pot_energy", |d| d.mtp_hessian(f.clone()))?;
        Ok(Self::from_parts(
            crate::hamiltonian::ResolvedPotential::from_parts(f, grad),
            SoftAbsGeometry {
                hess,
                mtp,
                softabs_coeff,
            },
        ))
    }
}

impl SoftAbsGeometry {
    /// The regularization coefficient `c`.
    pub fn softabs_coeff(&self) -> f64 {
        self.softabs_coeff
    }

    /// Hessian of the potential; one underlying call also fills the gradient
    /// and value entries.
    fn hess_pot_energy(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached_multi(
            state,
            Deps::Pos,
            &["hess_pot_energy", "grad_pot_energy", "pot_energy"],
            |s| {
                let (hess, grad, value) = (self.hess)(s.pos());
                Ok(vec![
                    CachedValue::Matrix(hess),
                    CachedValue::Vector(grad),
                    CachedValue::Scalar(value),
                ])
            },
        )
        .map(CachedValue::into_matrix)
    }

    /// Eigendecomposition of the Hessian together with the regularized
    /// eigenvalues, cached on the position as one atomic entry.
    fn eig_metric(&self, state: &mut ChainState) -> Result<EigenBasis, SystemError> {
        cached(state, Deps::Pos, "eig_metric", |s| {
            let hess = self.hess_pot_energy(s)?;
            let (hess_eigval, eigvec) = hess.eigh();
            let metric_eigval = hess_eigval.mapv(|x| softabs(x, self.softabs_coeff));
            Ok(CachedValue::Eigen(EigenBasis {
                metric_eigval,
                hess_eigval,
                eigvec,
            }))
        })
        .map(CachedValue::into_eigen)
    }
}

impl RiemannianGeometry for SoftAbsGeometry {
    fn sqrt_metric(&self, state: &mut ChainState) -> Result<Array2<f64>, SystemError> {
        cached(state, Deps::Pos, "sqrt_metric", |s| {
            let eig = self.eig_metric(s)?;
            Ok(CachedValue::Matrix(
                &eig.eigvec * &eig.metric_eigval.mapv(f64::sqrt),
            ))
        })
        .map(CachedValue::into_matrix)
    }

    fn log_det_sqrt_metric(&self, state: &mut ChainState) -> Result<f64, SystemError> {
        cached(state, Deps::Pos, "log_det_sqrt_metric", |s| {
            let eig = self.eig_metric(s)?;
            Ok(CachedValue::Scalar(
                0.5 * eig.metric_eigval.mapv(f64::ln).sum(),
            ))
        })
        .map(CachedValue::into_scalar)
    }

    fn grad_log_det_sqrt_metric(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::Pos, "grad_log_det_sqrt_metric", |s| {
            let eig = self.eig_metric(s)?;
            let weights = eig.hess_eigval.mapv(|x| grad_softabs(x, self.softabs_coeff))
                / &eig.metric_eigval;
            let cotangent = (&eig.eigvec * &weights).dot(&eig.eigvec.t());
            Ok(CachedValue::Vector(
                0.5 * (self.mtp)(s.pos(), &cotangent),
            ))
        })
        .map(CachedValue::into_vector)
    }

    fn inv_metric_mom(&self, state: &mut ChainState) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "inv_metric_mom", |s| {
            let eig = self.eig_metric(s)?;
            let rotated = eig.eigvec.t().dot(s.mom()) / &eig.metric_eigval;
            Ok(CachedValue::Vector(eig.eigvec.dot(&rotated)))
        })
        .map(CachedValue::into_vector)
    }

    fn grad_mom_inv_metric_mom(
        &self,
        state: &mut ChainState,
    ) -> Result<Array1<f64>, SystemError> {
        cached(state, Deps::PosMom, "grad_mom_inv_metric_mom", |s| {
            let eig = self.eig_metric(s)?;
            let n = eig.hess_eigval.len();
            let coeff = self.softabs_coeff;

            // Divided differences of softabs over the raw eigenvalues;
            // the numerator diagonal carries the limit and the denominator
            // diagonal is one.
            let mut num = Array2::from_shape_fn((n, n), |(i, j)| {
                eig.metric_eigval[i] - eig.metric_eigval[j]
            });
            let mut den = Array2::from_shape_fn((n, n), |(i, j)| {
                eig.hess_eigval[i] - eig.hess_eigval[j]
            });
            for i in 0..n {
                num[[i, i]] = grad_softabs(eig.hess_eigval[i], coeff);
                den[[i, i]] = 1.0;
            }
            let j_mtx = num / den;

            let eigvec_mom = eig.eigvec.t().dot(s.mom()) / &eig.metric_eigval;
            let cotangent = eig
                .eigvec
                .dot(&(outer(&eigvec_mom, &eigvec_mom) * &j_mtx))
                .dot(&eig.eigvec.t());
            Ok(CachedValue::Vector(-(self.mtp)(s.pos(), &cotangent)))
        })
        .map(CachedValue::into_vector)
    }
}
