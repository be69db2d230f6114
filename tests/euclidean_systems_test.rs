//! Tests verifying the Euclidean-metric Hamiltonian systems: exact values on
//! a known scenario, finite-difference agreement of the derivatives, kinetic
//! non-negativity, and cache behavior.

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use geometric_mcmc::diff::FiniteDifference;
    use geometric_mcmc::errors::SystemError;
    use geometric_mcmc::euclidean::{
        DenseMetric, DiagonalMetric, EuclideanMetricSystem, IsotropicMetric,
    };
    use geometric_mcmc::hamiltonian::{draw_standard_normal, HamiltonianSystem, Potential};
    use geometric_mcmc::state::ChainState;
    use ndarray::{arr1, arr2, Array1};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SEED: u64 = 42;
    const FD_STEP: f64 = 1e-6;

    /// Anisotropic quartic-plus-quadratic target with a hand-written gradient.
    fn potential() -> Potential {
        Potential::new(|q: &Array1<f64>| 0.25 * q[0].powi(4) + 0.5 * q[1] * q[1] + q[0] * q[1])
            .with_grad(|q: &Array1<f64>| {
                let grad = arr1(&[q[0].powi(3) + q[1], q[1] + q[0]]);
                let value = 0.25 * q[0].powi(4) + 0.5 * q[1] * q[1] + q[0] * q[1];
                (grad, value)
            })
    }

    /// Central difference of `h` along the position.
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

    /// Central difference of `h` along the momentum.
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

    fn random_state(rng: &mut SmallRng) -> ChainState {
        ChainState::new(draw_standard_normal(2, rng), draw_standard_normal(2, rng))
    }

    #[test]
    fn isotropic_two_dimensional_scenario_has_expected_energies() {
        let potential = Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q))
            .with_grad(|q: &Array1<f64>| (q.clone(), 0.5 * q.dot(q)));
        let system = EuclideanMetricSystem::new(potential, IsotropicMetric, None).unwrap();
        let mut state = ChainState::new(arr1(&[1.0, 2.0]), arr1(&[0.5, -0.5]));

        assert_eq!(system.pot_energy(&mut state).unwrap(), 2.5);
        assert_eq!(system.grad_pot_energy(&mut state).unwrap(), arr1(&[1.0, 2.0]));
        assert_eq!(system.kin_energy(&mut state).unwrap(), 0.25);
        assert_eq!(system.h(&mut state).unwrap(), 2.75);
    }

    #[test]
    fn derivatives_match_finite_differences_for_every_metric() {
        let mut rng = SmallRng::seed_from_u64(SEED);

        let isotropic =
            EuclideanMetricSystem::new(potential(), IsotropicMetric, None).unwrap();
        check_derivatives(&isotropic, &mut random_state(&mut rng));

        let diagonal = EuclideanMetricSystem::new(
            potential(),
            DiagonalMetric::new(arr1(&[2.0, 0.5])),
            None,
        )
        .unwrap();
        check_derivatives(&diagonal, &mut random_state(&mut rng));

        let dense = EuclideanMetricSystem::new(
            potential(),
            DenseMetric::new(arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap(),
            None,
        )
        .unwrap();
        check_derivatives(&dense, &mut random_state(&mut rng));
    }

    #[test]
    fn kinetic_term_is_non_negative_for_random_momenta() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let systems: Vec<Box<dyn Fn(&mut ChainState) -> f64>> = vec![
            {
                let s = EuclideanMetricSystem::new(potential(), IsotropicMetric, None).unwrap();
                Box::new(move |state| s.h(state).unwrap() - s.pot_energy(state).unwrap())
            },
            {
                let s = EuclideanMetricSystem::new(
                    potential(),
                    DiagonalMetric::new(arr1(&[2.0, 0.5])),
                    None,
                )
                .unwrap();
                Box::new(move |state| s.h(state).unwrap() - s.pot_energy(state).unwrap())
            },
            {
                let s = EuclideanMetricSystem::new(
                    potential(),
                    DenseMetric::new(arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap(),
                    None,
                )
                .unwrap();
                Box::new(move |state| s.h(state).unwrap() - s.pot_energy(state).unwrap())
            },
        ];

        for kinetic_term in &systems {
            for _ in 0..20 {
                let mut state = random_state(&mut rng);
                assert!(kinetic_term(&mut state) >= 0.0);
            }
        }
    }

    #[test]
    fn energy_then_gradient_costs_one_underlying_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let potential = Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q)).with_grad(
            move |q: &Array1<f64>| {
                counter.fetch_add(1, Ordering::SeqCst);
                (q.clone(), 0.5 * q.dot(q))
            },
        );
        let system = EuclideanMetricSystem::new(potential, IsotropicMetric, None).unwrap();
        let mut state = ChainState::new(arr1(&[1.0, 2.0]), arr1(&[0.0, 0.0]));

        // Gradient first: the shared call fills the energy entry too.
        system.grad_pot_energy(&mut state).unwrap();
        system.pot_energy(&mut state).unwrap();
        system.grad_pot_energy(&mut state).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A position write invalidates; the next read recomputes once.
        state.set_pos(arr1(&[3.0, 1.0]));
        system.grad_pot_energy(&mut state).unwrap();
        system.grad_pot_energy(&mut state).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn collaborator_gradient_matches_explicit_one() {
        let fd = FiniteDifference::default();
        let with_fallback =
            EuclideanMetricSystem::new(
                Potential::new(|q: &Array1<f64>| {
                    0.25 * q[0].powi(4) + 0.5 * q[1] * q[1] + q[0] * q[1]
                }),
                IsotropicMetric,
                Some(&fd),
            )
            .unwrap();
        let with_explicit = EuclideanMetricSystem::new(potential(), IsotropicMetric, None).unwrap();

        let mut a = ChainState::new(arr1(&[0.7, -1.2]), arr1(&[0.0, 0.0]));
        let mut b = ChainState::new(arr1(&[0.7, -1.2]), arr1(&[0.0, 0.0]));
        assert_abs_diff_eq!(
            with_fallback.grad_pot_energy(&mut a).unwrap(),
            with_explicit.grad_pot_energy(&mut b).unwrap(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn construction_without_gradient_or_collaborator_fails() {
        let err = EuclideanMetricSystem::new(
            Potential::new(|q: &Array1<f64>| q.sum()),
            IsotropicMetric,
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SystemError::MissingDerivative {
                name: "grad_pot_energy"
            }
        );
    }

    #[test]
    fn sampled_momentum_covariance_follows_the_metric() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let system = EuclideanMetricSystem::new(
            potential(),
            DiagonalMetric::new(arr1(&[4.0, 0.25])),
            None,
        )
        .unwrap();
        let mut state = ChainState::new(arr1(&[0.0, 0.0]), arr1(&[0.0, 0.0]));

        let n = 4000;
        let mut sums = arr1(&[0.0, 0.0]);
        for _ in 0..n {
            let mom = system.sample_momentum(&mut state, &mut rng).unwrap();
            sums = sums + &mom * &mom;
        }
        let var = sums / n as f64;
        // Loose moment check: variances should track the diagonal.
        assert!((var[0] - 4.0).abs() < 0.5, "var[0] = {}", var[0]);
        assert!((var[1] - 0.25).abs() < 0.05, "var[1] = {}", var[1]);
    }
}
