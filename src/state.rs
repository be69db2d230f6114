/*!
# Chain State & Memoization.

A [`ChainState`] bundles the position and momentum vectors of one sampling
chain together with a memoization cache for quantities derived from them
(potential energy, gradients, Cholesky factors, eigendecompositions, ...).

Each mutable field carries a generation counter that is bumped whenever the
field is reassigned through [`ChainState::set_pos`] / [`ChainState::set_mom`].
Cache entries record the generations they were computed at and the fields they
depend on; a later lookup silently misses when any depended-on field has moved
on, so stale values are recomputed lazily rather than eagerly purged.

Systems own no per-call state: all memoization lives in the `ChainState` they
are handed, so one immutable system instance can serve many chains as long as
each chain owns its own state (see the crate-level notes on concurrency).

The cache is populated through [`cached`] and [`cached_multi`]. The latter
handles computations that produce several named results from one underlying
call (e.g. a gradient evaluation that yields the value too): every result is
stored under its own key with identical generation stamps, so a later request
for the cheaper quantity is a cache hit.
*/

use crate::errors::SystemError;
use ndarray::{Array1, Array2};
use std::collections::HashMap;

/// Which state fields a cached quantity was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deps {
    /// Depends on the position only.
    Pos,
    /// Depends on the momentum only.
    Mom,
    /// Depends on both position and momentum.
    PosMom,
}

impl Deps {
    fn on_pos(self) -> bool {
        matches!(self, Deps::Pos | Deps::PosMom)
    }

    fn on_mom(self) -> bool {
        matches!(self, Deps::Mom | Deps::PosMom)
    }
}

/// Eigendecomposition of a SoftAbs-regularized metric, cached as one unit.
///
/// The three arrays always come from the same underlying symmetric
/// eigendecomposition of the potential's Hessian, so they are stored (and
/// invalidated) atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenBasis {
    /// Regularized (softabs-transformed) eigenvalues of the metric.
    pub metric_eigval: Array1<f64>,
    /// Raw eigenvalues of the Hessian, ascending.
    pub hess_eigval: Array1<f64>,
    /// Orthonormal eigenvectors, one per column, matching `hess_eigval`.
    pub eigvec: Array2<f64>,
}

/// A value held in the per-state cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Scalar(f64),
    Vector(Array1<f64>),
    Matrix(Array2<f64>),
    Eigen(EigenBasis),
}

impl CachedValue {
    /// Unwraps a scalar entry. Panics if the entry holds a different kind,
    /// which would be a programming error in a system implementation.
    pub fn into_scalar(self) -> f64 {
        match self {
            CachedValue::Scalar(v) => v,
            other => panic!("cache entry holds {} where a scalar was expected", other.kind()),
        }
    }

    /// Unwraps a vector entry. Panics on a kind mismatch.
    pub fn into_vector(self) -> Array1<f64> {
        match self {
            CachedValue::Vector(v) => v,
            other => panic!("cache entry holds {} where a vector was expected", other.kind()),
        }
    }

    /// Unwraps a matrix entry. Panics on a kind mismatch.
    pub fn into_matrix(self) -> Array2<f64> {
        match self {
            CachedValue::Matrix(v) => v,
            other => panic!("cache entry holds {} where a matrix was expected", other.kind()),
        }
    }

    /// Unwraps an eigendecomposition entry. Panics on a kind mismatch.
    pub fn into_eigen(self) -> EigenBasis {
        match self {
            CachedValue::Eigen(v) => v,
            other => panic!(
                "cache entry holds {} where an eigendecomposition was expected",
                other.kind()
            ),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CachedValue::Scalar(_) => "a scalar",
            CachedValue::Vector(_) => "a vector",
            CachedValue::Matrix(_) => "a matrix",
            CachedValue::Eigen(_) => "an eigendecomposition",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    deps: Deps,
    pos_gen: u64,
    mom_gen: u64,
    value: CachedValue,
}

/// Position, momentum and derived-quantity cache for one sampling chain.
///
/// Position and momentum must have matching dimensionality; this is a
/// documented precondition of every system operation, not a runtime check.
/// States are created by the outer sampler, mutated in place between system
/// calls, and never owned by a system.
#[derive(Debug, Clone)]
pub struct ChainState {
    pos: Array1<f64>,
    mom: Array1<f64>,
    pos_gen: u64,
    mom_gen: u64,
    cache: HashMap<&'static str, CacheEntry>,
}

impl ChainState {
    /// Creates a state from a position and momentum vector of equal length.
    pub fn new(pos: Array1<f64>, mom: Array1<f64>) -> Self {
        Self {
            pos,
            mom,
            pos_gen: 0,
            mom_gen: 0,
            cache: HashMap::new(),
        }
    }

    /// Current position.
    pub fn pos(&self) -> &Array1<f64> {
        &self.pos
    }

    /// Current momentum.
    pub fn mom(&self) -> &Array1<f64> {
        &self.mom
    }

    /// Dimensionality of the position (and momentum) vector.
    pub fn n_dim(&self) -> usize {
        self.pos.len()
    }

    /// Replaces the position, invalidating every cached quantity that was
    /// computed from it.
    pub fn set_pos(&mut self, pos: Array1<f64>) {
        self.pos = pos;
        self.pos_gen += 1;
    }

    /// Replaces the momentum, invalidating every cached quantity that was
    /// computed from it.
    pub fn set_mom(&mut self, mom: Array1<f64>) {
        self.mom = mom;
        self.mom_gen += 1;
    }

    fn lookup(&self, key: &'static str) -> Option<CachedValue> {
        let entry = self.cache.get(key)?;
        let pos_ok = !entry.deps.on_pos() || entry.pos_gen == self.pos_gen;
        let mom_ok = !entry.deps.on_mom() || entry.mom_gen == self.mom_gen;
        (pos_ok && mom_ok).then(|| entry.value.clone())
    }

    fn store(&mut self, key: &'static str, deps: Deps, value: CachedValue) {
        self.cache.insert(
            key,
            CacheEntry {
                deps,
                pos_gen: self.pos_gen,
                mom_gen: self.mom_gen,
                value,
            },
        );
    }
}

/// Serves `key` from the state cache, or runs `compute` and stores the result
/// stamped with the current generations of the fields in `deps`.
///
/// `compute` receives the state mutably so it can recurse into other cached
/// quantities; it must not reassign position or momentum.
pub fn cached<F>(
    state: &mut ChainState,
    deps: Deps,
    key: &'static str,
    compute: F,
) -> Result<CachedValue, SystemError>
where
    F: FnOnce(&mut ChainState) -> Result<CachedValue, SystemError>,
{
    if let Some(value) = state.lookup(key) {
        return Ok(value);
    }
    let value = compute(state)?;
    state.store(key, deps, value.clone());
    Ok(value)
}

/// Variant of [`cached`] for one computation yielding several named results.
///
/// `compute` must return exactly one value per entry in `keys`, in order; all
/// of them are stored atomically with identical generation stamps and the
/// first (primary) value is returned. Only the primary key is consulted for a
/// hit: the secondary keys are by-products that cheaper accessors look up
/// through their own [`cached`] calls.
pub fn cached_multi<F>(
    state: &mut ChainState,
    deps: Deps,
    keys: &[&'static str],
    compute: F,
) -> Result<CachedValue, SystemError>
where
    F: FnOnce(&mut ChainState) -> Result<Vec<CachedValue>, SystemError>,
{
    if let Some(value) = state.lookup(keys[0]) {
        return Ok(value);
    }
    let values = compute(state)?;
    debug_assert_eq!(values.len(), keys.len());
    let primary = values[0].clone();
    for (key, value) in keys.iter().copied().zip(values) {
        state.store(key, deps, value);
    }
    Ok(primary)
}
