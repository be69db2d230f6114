//! # Geometric MCMC
//!
//! The mathematical core for gradient-based Markov chain Monte Carlo: a
//! family of **Hamiltonian system** abstractions that evaluate a total energy
//! over a position/momentum state, its partial derivatives, and momentum
//! draws — under several geometric assumptions about the sampled space:
//!
//! 1. **Euclidean metrics** (`euclidean`): separable systems with a fixed
//!    momentum covariance — identity, diagonal, or dense with a
//!    construction-time Cholesky factor.
//! 2. **Riemannian metrics** (`riemannian`, `softabs`): non-separable systems
//!    whose metric depends on the position — dense or Cholesky-factored
//!    metric functions, and the SoftAbs metric built by eigenvalue-
//!    regularizing the Hessian of the potential.
//! 3. **Constrained systems** (`constrained`): Euclidean systems restricted
//!    to an equality-constraint manifold, with momentum projected onto its
//!    tangent space; including observation manifolds defined implicitly by
//!    pinning a forward generator to observed output.
//!
//! Repeated evaluations share work through a per-state memoization cache
//! (`state`) with generation counters per mutable field, so asking for the
//! energy, then the gradient, then a Hessian-dependent quantity reuses the
//! intermediate results without staleness.
//!
//! The outer sampler — integrator, acceptance logic, chain orchestration —
//! lives elsewhere and drives this crate through the
//! [`HamiltonianSystem`](hamiltonian::HamiltonianSystem) trait.
//!
//! ## Example 1: Euclidean system with an isotropic metric
//!
//! ```rust
//! use geometric_mcmc::euclidean::{EuclideanMetricSystem, IsotropicMetric};
//! use geometric_mcmc::hamiltonian::{HamiltonianSystem, Potential};
//! use geometric_mcmc::state::ChainState;
//! use ndarray::{arr1, Array1};
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! // Standard Gaussian target: pot_energy(q) = 0.5 * ||q||^2.
//! let potential = Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q))
//!     .with_grad(|q: &Array1<f64>| (q.clone(), 0.5 * q.dot(q)));
//! let system = EuclideanMetricSystem::new(potential, IsotropicMetric, None).unwrap();
//!
//! let mut state = ChainState::new(arr1(&[1.0, 2.0]), arr1(&[0.5, -0.5]));
//! assert_eq!(system.pot_energy(&mut state).unwrap(), 2.5);
//! assert_eq!(system.h(&mut state).unwrap(), 2.75);
//! assert_eq!(system.dh_dpos(&mut state).unwrap(), arr1(&[1.0, 2.0]));
//!
//! // Momentum is drawn from an injected generator, never a global one.
//! let mut rng = SmallRng::seed_from_u64(42);
//! let mom = system.sample_momentum(&mut state, &mut rng).unwrap();
//! state.set_mom(mom);
//! ```
//!
//! ## Example 2: derivatives from the collaborator
//!
//! Every constructor accepts derivatives as explicit closures; omitted ones
//! are derived by a differentiation collaborator, here the built-in
//! central-difference engine:
//!
//! ```rust
//! use geometric_mcmc::diff::FiniteDifference;
//! use geometric_mcmc::euclidean::{DiagonalMetric, EuclideanMetricSystem};
//! use geometric_mcmc::hamiltonian::{HamiltonianSystem, Potential};
//! use geometric_mcmc::state::ChainState;
//! use ndarray::{arr1, Array1};
//!
//! let fd = FiniteDifference::default();
//! let potential = Potential::new(|q: &Array1<f64>| q[0].powi(4) + 0.5 * q[1] * q[1]);
//! let metric = DiagonalMetric::new(arr1(&[2.0, 0.5]));
//! let system = EuclideanMetricSystem::new(potential, metric, Some(&fd)).unwrap();
//!
//! let mut state = ChainState::new(arr1(&[0.3, -1.0]), arr1(&[1.0, 1.0]));
//! let grad = system.grad_pot_energy(&mut state).unwrap();
//! assert!((grad[0] - 4.0 * 0.3f64.powi(3)).abs() < 1e-6);
//! ```
//!
//! ## Example 3: momentum tangent to a constraint manifold
//!
//! ```rust
//! use geometric_mcmc::constrained::{Constraint, ConstrainedSystem};
//! use geometric_mcmc::euclidean::IsotropicMetric;
//! use geometric_mcmc::hamiltonian::{HamiltonianSystem, Potential};
//! use geometric_mcmc::state::ChainState;
//! use ndarray::{arr1, arr2, Array1};
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! // Restrict a standard Gaussian to the unit circle.
//! let potential = Potential::new(|q: &Array1<f64>| 0.5 * q.dot(q))
//!     .with_grad(|q: &Array1<f64>| (q.clone(), 0.5 * q.dot(q)));
//! let constraint = Constraint::new(|q: &Array1<f64>| arr1(&[q.dot(q) - 1.0]))
//!     .with_jacob(|q: &Array1<f64>| {
//!         let jac = arr2(&[[2.0 * q[0], 2.0 * q[1]]]);
//!         (jac, arr1(&[q.dot(q) - 1.0]))
//!     });
//! let system =
//!     ConstrainedSystem::new(potential, IsotropicMetric, constraint, None).unwrap();
//!
//! let mut state = ChainState::new(arr1(&[1.0, 0.0]), arr1(&[0.0, 0.0]));
//! let mut rng = SmallRng::seed_from_u64(7);
//! let mom = system.sample_momentum(&mut state, &mut rng).unwrap();
//! // The sampled momentum has no component normal to the circle.
//! let normal_component = system.jacob_constr(&mut state).unwrap().dot(&mom);
//! assert!(normal_component[0].abs() < 1e-10);
//! ```
//!
//! ## Concurrency
//!
//! Evaluation is synchronous and single-threaded per call. System instances
//! are immutable after construction and may be shared read-only across
//! chains; each chain must own its own [`state::ChainState`], which is where
//! all mutable memoization lives.

pub mod constrained;
pub mod diff;
pub mod errors;
pub mod euclidean;
pub mod hamiltonian;
pub mod linalg;
pub mod riemannian;
pub mod softabs;
pub mod state;
