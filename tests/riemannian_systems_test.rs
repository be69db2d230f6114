//! Tests verifying the Riemannian-metric systems (dense, Cholesky-factored,
//! SoftAbs): energy decomposition, finite-difference agreement of the
//! derivatives, and eigendecomposition caching.

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use geometric_mcmc::hamiltonian::{HamiltonianSystem, Potential};
    use geometric_mcmc::riemannian::{
        CholeskyFactoredRiemannianMetricSystem, DenseRiemannianMetricSystem, MetricFunction,
    };
    use geometric_mcmc::softabs::SoftAbsRiemannianMetricSystem;
    use geometric_mcmc::state::ChainState;
    use ndarray::{arr1, arr2, Array1, Array2};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const FD_STEP: f64 = 1e-6;

    /// Gaussian-like target with a hand-written gradient.
    fn potential() -> Potential {
        Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q))
            .with_grad(|q: &Array1<f64>| (q.clone(), 0.5 * q.dot(q)))
    }

    /// Position-dependent dense metric `[[1+q0^2, 0.5], [0.5, 2+q1^2]]` with
    /// its exact vector-Jacobian product.
    fn dense_metric() -> MetricFunction {
        MetricFunction::new(|q: &Array1<f64>| {
            arr2(&[[1.0 + q[0] * q[0], 0.5], [0.5, 2.0 + q[1] * q[1]]])
        })
        .with_vjp(|q: &Array1<f64>, c: &Array2<f64>| {
            arr1(&[2.0 * q[0] * c[[0, 0]], 2.0 * q[1] * c[[1, 1]]])
        })
    }

    /// Lower-triangular factor `[[1+q0^2, 0], [0.5*q0*q1, 2+q1^2]]` with its
    /// exact vector-Jacobian product.
    fn factored_metric() -> MetricFunction {
        MetricFunction::new(|q: &Array1<f64>| {
            arr2(&[[1.0 + q[0] * q[0], 0.0], [0.5 * q[0] * q[1], 2.0 + q[1] * q[1]]])
        })
        .with_vjp(|q: &Array1<f64>, c: &Array2<f64>| {
            arr1(&[
                2.0 * q[0] * c[[0, 0]] + 0.5 * q[1] * c[[1, 0]],
                0.5 * q[0] * c[[1, 0]] + 2.0 * q[1] * c[[1, 1]],
            ])
        })
    }

    /// `pot(q) = 0.25 * (q.q)^2` with exact gradient, Hessian and
    /// matrix-transpose product against the third-derivative tensor.
    fn quartic_potential() -> Potential {
        Potential::new(|q: &Array1<f64>| 0.25 * q.dot(q).powi(2))
            .with_grad(|q: &Array1<f64>| (q.dot(q) * q, 0.25 * q.dot(q).powi(2)))
            .with_hess(|q: &Array1<f64>| {
                let r2 = q.dot(q);
                let hess = arr2(&[
                    [r2 + 2.0 * q[0] * q[0], 2.0 * q[0] * q[1]],
                    [2.0 * q[0] * q[1], r2 + 2.0 * q[1] * q[1]],
                ]);
                (hess, r2 * q, 0.25 * r2 * r2)
            })
            .with_mtp(|q: &Array1<f64>, m: &Array2<f64>| {
                // d hess / d q0 = [[6q0, 2q1], [2q1, 2q0]],
                // d hess / d q1 = [[2q1, 2q0], [2q0, 6q1]].
                arr1(&[
                    6.0 * q[0] * m[[0, 0]]
                        + 2.0 * q[1] * (m[[0, 1]] + m[[1, 0]])
                        + 2.0 * q[0] * m[[1, 1]],
                    2.0 * q[1] * m[[0, 0]]
                        + 2.0 * q[0] * (m[[0, 1]] + m[[1, 0]])
                        + 6.0 * q[1] * m[[1, 1]],
                ])
            })
    }

    fn fd_dh_dpos<S: HamiltonianSystem>(system: &S, state: &mut ChainState) -> Array1<f64> {
        let pos = state.pos().clone();
        let fd = Array1::from_shape_fn(pos.len(), |i| {
            let mut p = pos.clone();
            p[i] += FD_STEP;
            state.set_pos(p);
            let hp = system.h(state).unwrap();
            let mut p = pos.clone();
            p[i] -= FD_STEP;
            state.set_pos(p);
            let hm = system.h(state).unwrap();
            (hp - hm) / (2.0 * FD_STEP)
        });
        state.set_pos(pos);
        fd
    }

    fn fd_dh_dmom<S: HamiltonianSystem>(system: &S, state: &mut ChainState) -> Array1<f64> {
        let mom = state.mom().clone();
        let fd = Array1::from_shape_fn(mom.len(), |i| {
            let mut m = mom.clone();
            m[i] += FD_STEP;
            state.set_mom(m);
            let hp = system.h(state).unwrap();
            let mut m = mom.clone();
            m[i] -= FD_STEP;
            state.set_mom(m);
            let hm = system.h(state).unwrap();
            (hp - hm) / (2.0 * FD_STEP)
        });
        state.set_mom(mom);
        fd
    }

    fn check_derivatives<S: HamiltonianSystem>(system: &S, state: &mut ChainState) {
        let expected_dpos = fd_dh_dpos(system, state);
        let expected_dmom = fd_dh_dmom(system, state);
        assert_abs_diff_eq!(system.dh_dpos(state).unwrap(), expected_dpos, epsilon = 1e-5);
        assert_abs_diff_eq!(system.dh_dmom(state).unwrap(), expected_dmom, epsilon = 1e-5);
    }

    #[test]
    fn dense_system_energy_decomposes_into_h1_and_h2() {
        let system = DenseRiemannianMetricSystem::new(potential(), dense_metric(), None).unwrap();
        let mut state = ChainState::new(arr1(&[0.8, -0.5]), arr1(&[0.3, 1.1]));

        let q = state.pos().clone();
        let metric = arr2(&[[1.0 + q[0] * q[0], 0.5], [0.5, 2.0 + q[1] * q[1]]]);
        let det = metric[[0, 0]] * metric[[1, 1]] - metric[[0, 1]] * metric[[1, 0]];

        let h1 = system.h1(&mut state).unwrap();
        assert_abs_diff_eq!(h1, 0.5 * q.dot(&q) + 0.5 * det.ln(), epsilon = 1e-12);

        let h = system.h(&mut state).unwrap();
        let h2 = system.h2(&mut state).unwrap();
        assert_abs_diff_eq!(h, h1 + h2, epsilon = 1e-12);
        // Quadratic form with a positive definite metric.
        assert!(h2 > 0.0);
    }

    #[test]
    fn dense_system_derivatives_match_finite_differences() {
        let system = DenseRiemannianMetricSystem::new(potential(), dense_metric(), None).unwrap();
        let mut state = ChainState::new(arr1(&[0.8, -0.5]), arr1(&[0.3, 1.1]));
        check_derivatives(&system, &mut state);
    }

    #[test]
    fn factored_system_derivatives_match_finite_differences() {
        let system =
            CholeskyFactoredRiemannianMetricSystem::new(potential(), factored_metric(), None)
                .unwrap();
        let mut state = ChainState::new(arr1(&[0.6, 0.9]), arr1(&[-0.4, 0.2]));
        check_derivatives(&system, &mut state);
    }

    #[test]
    fn factored_system_agrees_with_dense_system_on_the_same_metric() {
        // Dense metric defined as L L^T of the factored one.
        let dense_of_factor = MetricFunction::new(|q: &Array1<f64>| {
            let l = arr2(&[[1.0 + q[0] * q[0], 0.0], [0.5 * q[0] * q[1], 2.0 + q[1] * q[1]]]);
            l.dot(&l.t())
        })
        .with_vjp(|_q: &Array1<f64>, _c: &Array2<f64>| unreachable!("not needed in this test"));

        let factored =
            CholeskyFactoredRiemannianMetricSystem::new(potential(), factored_metric(), None)
                .unwrap();
        let dense =
            DenseRiemannianMetricSystem::new(potential(), dense_of_factor, None).unwrap();

        let mut a = ChainState::new(arr1(&[0.6, 0.9]), arr1(&[-0.4, 0.2]));
        let mut b = ChainState::new(arr1(&[0.6, 0.9]), arr1(&[-0.4, 0.2]));
        assert_abs_diff_eq!(
            factored.h(&mut a).unwrap(),
            dense.h(&mut b).unwrap(),
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(
            factored.dh_dmom(&mut a).unwrap(),
            dense.dh_dmom(&mut b).unwrap(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn softabs_system_derivatives_match_finite_differences() {
        let system =
            SoftAbsRiemannianMetricSystem::new(quartic_potential(), 1.0, None).unwrap();
        let mut state = ChainState::new(arr1(&[0.8, -0.5]), arr1(&[0.3, 1.1]));
        check_derivatives(&system, &mut state);

        // A different regularization strength exercises the divided
        // differences away from the |x| regime.
        let system = SoftAbsRiemannianMetricSystem::new(quartic_potential(), 0.5, None).unwrap();
        let mut state = ChainState::new(arr1(&[1.2, 0.4]), arr1(&[-0.7, 0.6]));
        check_derivatives(&system, &mut state);
    }

    #[test]
    fn softabs_metric_is_positive_definite_for_an_indefinite_hessian() {
        // Saddle: hess = diag(1, -1), constant, third derivatives zero.
        let saddle = Potential::new(|q: &Array1<f64>| 0.5 * (q[0] * q[0] - q[1] * q[1]))
            .with_grad(|q: &Array1<f64>| {
                (
                    arr1(&[q[0], -q[1]]),
                    0.5 * (q[0] * q[0] - q[1] * q[1]),
                )
            })
            .with_hess(|q: &Array1<f64>| {
                (
                    arr2(&[[1.0, 0.0], [0.0, -1.0]]),
                    arr1(&[q[0], -q[1]]),
                    0.5 * (q[0] * q[0] - q[1] * q[1]),
                )
            })
            .with_mtp(|q: &Array1<f64>, _m: &Array2<f64>| Array1::zeros(q.len()));

        let system = SoftAbsRiemannianMetricSystem::new(saddle, 1.0, None).unwrap();
        let mut state = ChainState::new(arr1(&[0.4, -1.3]), arr1(&[0.9, 0.2]));

        // The quadratic momentum term stays positive despite the saddle.
        assert!(system.h2(&mut state).unwrap() > 0.0);
        check_derivatives(&system, &mut state);
    }

    #[test]
    fn hessian_is_evaluated_once_per_position() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let counted = Potential::new(|q: &Array1<f64>| 0.25 * q.dot(q).powi(2))
            .with_grad(|q: &Array1<f64>| (q.dot(q) * q, 0.25 * q.dot(q).powi(2)))
            .with_hess(move |q: &Array1<f64>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let r2 = q.dot(q);
                let hess = arr2(&[
                    [r2 + 2.0 * q[0] * q[0], 2.0 * q[0] * q[1]],
                    [2.0 * q[0] * q[1], r2 + 2.0 * q[1] * q[1]],
                ]);
                (hess, r2 * q, 0.25 * r2 * r2)
            })
            .with_mtp(|q: &Array1<f64>, m: &Array2<f64>| {
                arr1(&[
                    6.0 * q[0] * m[[0, 0]]
                        + 2.0 * q[1] * (m[[0, 1]] + m[[1, 0]])
                        + 2.0 * q[0] * m[[1, 1]],
                    2.0 * q[1] * m[[0, 0]]
                        + 2.0 * q[0] * (m[[0, 1]] + m[[1, 0]])
                        + 6.0 * q[1] * m[[1, 1]],
                ])
            });

        let system = SoftAbsRiemannianMetricSystem::new(counted, 1.0, None).unwrap();
        let mut state = ChainState::new(arr1(&[0.8, -0.5]), arr1(&[0.3, 1.1]));

        system.h(&mut state).unwrap();
        system.dh_dpos(&mut state).unwrap();
        system.dh_dmom(&mut state).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        state.set_mom(arr1(&[0.1, 0.1]));
        system.h(&mut state).unwrap();
        // Momentum update leaves the position-cached eigendecomposition valid.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        state.set_pos(arr1(&[1.0, 1.5]));
        system.h(&mut state).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
