/*!
# Differentiation Collaborator.

The system families consume derivatives of user-supplied closures: gradients
and Hessians of scalar potentials, Jacobians of constraint and generator
functions, and product-form operators (VJP/MTP/MHP) that contract a cotangent
against a derivative tensor without materializing it.

Every constructor accepts each derivative as an optional explicit closure.
When one is omitted, the construction falls back to a [`Differentiator`] — an
engine that derives the operator from the base function — and fails with
[`SystemError::MissingDerivative`] if no engine was provided either. The
resolution happens exactly once, at construction time, never lazily per call.

[`FiniteDifference`] is the reference engine: central differences, adequate
for moderate dimensions and for validating hand-written derivatives. An
automatic-differentiation backend can be plugged in by implementing
[`Differentiator`] for it.

Derivative-and-value pairing: the resolved operators return the underlying
value(s) alongside the derivative (mirroring a reverse-mode engine's forward
pass), which lets the cache store both from one call.
*/

use crate::errors::SystemError;
use ndarray::{Array1, Array2};
use std::sync::Arc;

/// Scalar function of position, shared between a system and its derivative
/// operators.
pub type ScalarFn = Arc<dyn Fn(&Array1<f64>) -> f64 + Send + Sync>;

/// Vector-valued function of position (constraint, generator).
pub type VectorValuedFn = Arc<dyn Fn(&Array1<f64>) -> Array1<f64> + Send + Sync>;

/// Matrix-valued function of position (metric, Cholesky factor of a metric).
pub type MatrixValuedFn = Arc<dyn Fn(&Array1<f64>) -> Array2<f64> + Send + Sync>;

/// Gradient operator returning `(gradient, value)`.
pub type GradFn = Box<dyn Fn(&Array1<f64>) -> (Array1<f64>, f64) + Send + Sync>;

/// Jacobian operator returning `(jacobian, value)`; the Jacobian has one row
/// per output component.
pub type JacobFn = Box<dyn Fn(&Array1<f64>) -> (Array2<f64>, Array1<f64>) + Send + Sync>;

/// Hessian operator returning `(hessian, gradient, value)`.
pub type HessFn = Box<dyn Fn(&Array1<f64>) -> (Array2<f64>, Array1<f64>, f64) + Send + Sync>;

/// Vector-Jacobian product of a matrix-valued function:
/// `vjp(pos, c)[k] = Σᵢⱼ c[i,j]·∂m[i,j]/∂pos[k]`.
pub type VjpFn = Box<dyn Fn(&Array1<f64>, &Array2<f64>) -> Array1<f64> + Send + Sync>;

/// Matrix-transpose product against the third-derivative tensor of a scalar
/// function: `mtp(pos, m)[k] = Σᵢⱼ m[i,j]·∂hess[i,j]/∂pos[k]`.
pub type MtpFn = Box<dyn Fn(&Array1<f64>, &Array2<f64>) -> Array1<f64> + Send + Sync>;

/// Matrix-Hessian product of a vector-valued function:
/// `mhp(pos, m)[k] = Σᵢⱼ m[i,j]·∂jac[i,j]/∂pos[k]`.
pub type MhpFn = Box<dyn Fn(&Array1<f64>, &Array2<f64>) -> Array1<f64> + Send + Sync>;

/// An engine that derives the operators above from a base function.
pub trait Differentiator: Send + Sync {
    /// Gradient-and-value of a scalar function.
    fn grad_and_value(&self, f: ScalarFn) -> GradFn;

    /// Jacobian-and-value of a vector-valued function.
    fn jacobian_and_value(&self, f: VectorValuedFn) -> JacobFn;

    /// Hessian-gradient-and-value of a scalar function.
    fn hessian_grad_and_value(&self, f: ScalarFn) -> HessFn;

    /// Cotangent contraction against the derivative of a matrix-valued
    /// function.
    fn vjp_matrix(&self, f: MatrixValuedFn) -> VjpFn;

    /// Matrix-transpose product against the third derivative of a scalar
    /// function.
    fn mtp_hessian(&self, f: ScalarFn) -> MtpFn;

    /// Matrix-Hessian product of a vector-valued function.
    fn mhp_jacobian(&self, f: VectorValuedFn) -> MhpFn;
}

/// Resolves an optional explicit derivative against the collaborator,
/// failing with the derivative's name when neither is available.
pub(crate) fn resolve<T>(
    explicit: Option<T>,
    diff: Option<&dyn Differentiator>,
    name: &'static str,
    derive: impl FnOnce(&dyn Differentiator) -> T,
) -> Result<T, SystemError> {
    match (explicit, diff) {
        (Some(f), _) => Ok(f),
        (None, Some(d)) => Ok(derive(d)),
        (None, None) => Err(SystemError::MissingDerivative { name }),
    }
}

/// Central-difference implementation of [`Differentiator`].
///
/// The base step applies to first derivatives; second and third derivatives
/// use its square and cube root respectively, trading truncation against
/// round-off order by order. The default base step suits `f64` and unit-scale
/// inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiniteDifference {
    step: f64,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        Self { step: 1e-6 }
    }
}

impl FiniteDifference {
    /// Engine with an explicit base step.
    pub fn with_step(step: f64) -> Self {
        Self { step }
    }

    fn second_order_step(&self) -> f64 {
        self.step.sqrt()
    }

    fn third_order_step(&self) -> f64 {
        self.step.cbrt()
    }
}

fn fd_grad(f: &dyn Fn(&Array1<f64>) -> f64, pos: &Array1<f64>, h: f64) -> Array1<f64> {
    let mut x = pos.clone();
    Array1::from_shape_fn(pos.len(), |i| {
        let xi = pos[i];
        x[i] = xi + h;
        let fp = f(&x);
        x[i] = xi - h;
        let fm = f(&x);
        x[i] = xi;
        (fp - fm) / (2.0 * h)
    })
}

fn fd_jacobian(f: &dyn Fn(&Array1<f64>) -> Array1<f64>, pos: &Array1<f64>, h: f64) -> Array2<f64> {
    let n = pos.len();
    let m = f(pos).len();
    let mut jac = Array2::zeros((m, n));
    let mut x = pos.clone();
    for i in 0..n {
        let xi = pos[i];
        x[i] = xi + h;
        let fp = f(&x);
        x[i] = xi - h;
        let fm = f(&x);
        x[i] = xi;
        let col = (fp - fm) / (2.0 * h);
        jac.column_mut(i).assign(&col);
    }
    jac
}

fn fd_hessian(f: &dyn Fn(&Array1<f64>) -> f64, pos: &Array1<f64>, h: f64) -> Array2<f64> {
    let n = pos.len();
    let f0 = f(pos);
    let mut hess = Array2::zeros((n, n));
    let mut x = pos.clone();
    for i in 0..n {
        for j in i..n {
            let d2 = if i == j {
                x[i] = pos[i] + h;
                let fp = f(&x);
                x[i] = pos[i] - h;
                let fm = f(&x);
                x[i] = pos[i];
                (fp - 2.0 * f0 + fm) / (h * h)
            } else {
                let mut probe = |si: f64, sj: f64| {
                    x[i] = pos[i] + si * h;
                    x[j] = pos[j] + sj * h;
                    let v = f(&x);
                    x[i] = pos[i];
                    x[j] = pos[j];
                    v
                };
                let fpp = probe(1.0, 1.0);
                let fpm = probe(1.0, -1.0);
                let fmp = probe(-1.0, 1.0);
                let fmm = probe(-1.0, -1.0);
                (fpp - fpm - fmp + fmm) / (4.0 * h * h)
            };
            hess[[i, j]] = d2;
            hess[[j, i]] = d2;
        }
    }
    hess
}

impl Differentiator for FiniteDifference {
    fn grad_and_value(&self, f: ScalarFn) -> GradFn {
        let h = self.step;
        Box::new(move |pos| (fd_grad(&*f, pos, h), f(pos)))
    }

    fn jacobian_and_value(&self, f: VectorValuedFn) -> JacobFn {
        let h = self.step;
        Box::new(move |pos| (fd_jacobian(&*f, pos, h), f(pos)))
    }

    fn hessian_grad_and_value(&self, f: ScalarFn) -> HessFn {
        let h1 = self.step;
        let h2 = self.second_order_step();
        Box::new(move |pos| (fd_hessian(&*f, pos, h2), fd_grad(&*f, pos, h1), f(pos)))
    }

    fn vjp_matrix(&self, f: MatrixValuedFn) -> VjpFn {
        let h = self.step;
        Box::new(move |pos, cotangent| {
            let mut x = pos.clone();
            Array1::from_shape_fn(pos.len(), |k| {
                let xk = pos[k];
                x[k] = xk + h;
                let mp = f(&x);
                x[k] = xk - h;
                let mm = f(&x);
                x[k] = xk;
                ((mp - mm) * cotangent).sum() / (2.0 * h)
            })
        })
    }

    fn mtp_hessian(&self, f: ScalarFn) -> MtpFn {
        let h2 = self.second_order_step();
        let h3 = self.third_order_step();
        Box::new(move |pos, m| {
            let mut x = pos.clone();
            Array1::from_shape_fn(pos.len(), |k| {
                let xk = pos[k];
                x[k] = xk + h3;
                let hp = fd_hessian(&*f, &x, h2);
                x[k] = xk - h3;
                let hm = fd_hessian(&*f, &x, h2);
                x[k] = xk;
                ((hp - hm) * m).sum() / (2.0 * h3)
            })
        })
    }

    fn mhp_jacobian(&self, f: VectorValuedFn) -> MhpFn {
        let h1 = self.step;
        let h2 = self.second_order_step();
        Box::new(move |pos, m| {
            let mut x = pos.clone();
            Array1::from_shape_fn(pos.len(), |k| {
                let xk = pos[k];
                x[k] = xk + h2;
                let jp = fd_jacobian(&*f, &x, h1);
                x[k] = xk - h2;
                let jm = fd_jacobian(&*f, &x, h1);
                x[k] = xk;
                ((jp - jm) * m).sum() / (2.0 * h2)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    // f(q) = q1^3 q2 + q2^2, with all derivatives known in closed form.
    fn f() -> ScalarFn {
        Arc::new(|q: &Array1<f64>| q[0].powi(3) * q[1] + q[1] * q[1])
    }

    #[test]
    fn grad_matches_closed_form() {
        let fd = FiniteDifference::default();
        let grad = fd.grad_and_value(f());
        let q = arr1(&[1.2, -0.7]);
        let (g, v) = grad(&q);
        assert_abs_diff_eq!(v, q[0].powi(3) * q[1] + q[1] * q[1], epsilon = 1e-12);
        let expected = arr1(&[3.0 * q[0] * q[0] * q[1], q[0].powi(3) + 2.0 * q[1]]);
        assert_abs_diff_eq!(g, expected, epsilon = 1e-6);
    }

    #[test]
    fn hessian_matches_closed_form() {
        let fd = FiniteDifference::default();
        let hess = fd.hessian_grad_and_value(f());
        let q = arr1(&[1.2, -0.7]);
        let (h, _, _) = hess(&q);
        let expected = arr2(&[
            [6.0 * q[0] * q[1], 3.0 * q[0] * q[0]],
            [3.0 * q[0] * q[0], 2.0],
        ]);
        assert_abs_diff_eq!(h, expected, epsilon = 1e-5);
    }

    #[test]
    fn mtp_contracts_third_derivative() {
        let fd = FiniteDifference::default();
        let mtp = fd.mtp_hessian(f());
        let q = arr1(&[1.2, -0.7]);
        let m = arr2(&[[0.3, -1.1], [0.5, 2.0]]);
        // d hess / d q1 = [[6 q2, 6 q1], [6 q1, 0]]; d hess / d q2 = [[6 q1, 0], [0, 0]].
        let expected = arr1(&[
            6.0 * q[1] * m[[0, 0]] + 6.0 * q[0] * (m[[0, 1]] + m[[1, 0]]),
            6.0 * q[0] * m[[0, 0]],
        ]);
        assert_abs_diff_eq!(mtp(&q, &m), expected, epsilon = 1e-3);
    }

    #[test]
    fn jacobian_and_vjp_match_closed_form() {
        let fd = FiniteDifference::default();
        let g: VectorValuedFn = Arc::new(|q: &Array1<f64>| arr1(&[q[0] * q[1], q[0] - q[1]]));
        let jac = fd.jacobian_and_value(g.clone());
        let q = arr1(&[0.4, 1.3]);
        let (j, v) = jac(&q);
        assert_abs_diff_eq!(v, arr1(&[q[0] * q[1], q[0] - q[1]]), epsilon = 1e-12);
        assert_abs_diff_eq!(j, arr2(&[[q[1], q[0]], [1.0, -1.0]]), epsilon = 1e-6);

        let mf: MatrixValuedFn =
            Arc::new(|q: &Array1<f64>| arr2(&[[q[0] * q[0], 0.0], [0.0, q[1]]]));
        let vjp = fd.vjp_matrix(mf);
        let c = arr2(&[[1.0, 0.0], [0.0, 2.0]]);
        assert_abs_diff_eq!(vjp(&q, &c), arr1(&[2.0 * q[0], 2.0]), epsilon = 1e-6);
    }

    #[test]
    fn resolve_prefers_explicit_and_errors_without_collaborator() {
        let explicit: Option<i32> = Some(7);
        assert_eq!(resolve(explicit, None, "grad", |_| 0).unwrap(), 7);
        let absent: Option<i32> = None;
        let err = resolve(absent, None, "grad_pot_energy", |_| 0).unwrap_err();
        assert_eq!(
            err,
            SystemError::MissingDerivative {
                name: "grad_pot_energy"
            }
        );
    }
}
