//! Derivation Implementation
//!
//! A Derivation is a cached value computed from declared dependencies. It
//! re-evaluates only when one of its dependencies has changed.
//!
//! # How Derivations Work
//!
//! 1. Creating a derivation computes nothing. The first `get()` runs the
//!    computation and caches the result together with the combined version
//!    of its direct dependencies.
//!
//! 2. On later reads, dependencies that are derivations are brought up to
//!    date first, then the combined version is taken again. If it matches
//!    the cache, the cached value is returned.
//!
//! 3. When a batch commits, nothing is recomputed under the lazy policy; the
//!    next read notices the new versions. Under the eager policy the runtime
//!    refreshes affected derivations before any effect runs.
//!
//! Versions only grow, so any change to a dependency changes the sum and no
//! write can go unnoticed.
//!
//! # Equality Cutoff
//!
//! A derivation's own version grows each time it recomputes, unless it was
//! created with [`ScopeHandle::derive_eq`](super::ScopeHandle::derive_eq) and
//! the new value equals the old one. Dependents of such a derivation keep
//! their cache and effects on it do not re-run.
//!
//! # Failures
//!
//! A compute function may fail. The error is returned as
//! `DerivationComputeFailed` and the previous cached value stays in place,
//! stale but intact, so a read after the inputs are fixed succeeds.
//!
//! # Forward Declaration
//!
//! [`ScopeHandle::declare`](super::ScopeHandle::declare) reserves a
//! derivation before its dependencies exist. [`Derivation::define`] supplies
//! them later, and is the one place where a registration can close a cycle.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::cell::Trackable;
use super::context::ReactiveContext;
use super::runtime::{Inputs, Reactive, Runtime};
use super::scope::ScopeId;
use crate::error::{BoxError, EngineError, Result};
use crate::graph::{NodeId, NodeKind};

/// A derivation's compute function.
pub(crate) type ComputeFn<T> = Arc<dyn Fn() -> std::result::Result<T, BoxError> + Send + Sync>;

/// Equality used to decide whether a recomputation changed the value.
pub(crate) type SameFn<T> = fn(&T, &T) -> bool;

struct Cache<T> {
    value: Option<T>,
    /// Combined dependency version the value was computed at.
    version: u64,
    /// Number of direct dependencies at that time.
    width: usize,
}

impl<T> Cache<T> {
    fn is_valid(&self, inputs: &Inputs) -> bool {
        self.value.is_some()
            && !inputs.failed
            && self.version == inputs.version
            && self.width == inputs.width
    }
}

pub(crate) struct DerivationInner<T> {
    id: NodeId,
    compute: RwLock<Option<ComputeFn<T>>>,
    same: Option<SameFn<T>>,
    cache: Mutex<Cache<T>>,
    compute_count: AtomicUsize,
}

impl<T> DerivationInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(id: NodeId, compute: Option<ComputeFn<T>>, same: Option<SameFn<T>>) -> Self {
        Self {
            id,
            compute: RwLock::new(compute),
            same,
            cache: Mutex::new(Cache {
                value: None,
                version: 0,
                width: 0,
            }),
            compute_count: AtomicUsize::new(0),
        }
    }

    /// Make the cache current. Returns whether the compute function ran.
    fn ensure_current(&self, runtime: &Runtime) -> Result<bool> {
        let inputs = runtime.refresh_inputs(self.id, NodeKind::Derived)?;
        let compute = self
            .compute
            .read()
            .clone()
            .ok_or(EngineError::UndefinedDerivation { node: self.id })?;

        if self.cache.lock().is_valid(&inputs) {
            return Ok(false);
        }

        let allowed = runtime.upstream(self.id, NodeKind::Derived)?;
        self.compute_count.fetch_add(1, Ordering::SeqCst);
        trace!(derivation = %self.id, version = inputs.version, "recomputing");

        // The cache lock is not held here; the computation may read other
        // derivations.
        let result = {
            let _ctx = ReactiveContext::enter(self.id, Some(allowed));
            compute()
        };

        match result {
            Ok(value) => {
                let changed = {
                    let mut cache = self.cache.lock();
                    let changed = match (&cache.value, self.same) {
                        (Some(old), Some(same)) => !same(old, &value),
                        _ => true,
                    };
                    cache.value = Some(value);
                    cache.version = inputs.version;
                    cache.width = inputs.width;
                    changed
                };
                if changed {
                    runtime.bump_version(self.id);
                } else {
                    trace!(derivation = %self.id, "recomputed to an equal value");
                }
                Ok(true)
            }
            Err(source) => {
                debug!(derivation = %self.id, error = %source, "compute failed; keeping previous value");
                Err(EngineError::DerivationComputeFailed {
                    node: self.id,
                    source,
                })
            }
        }
    }

    fn evaluate(&self, runtime: &Runtime) -> Result<T> {
        self.ensure_current(runtime)?;
        self.cache
            .lock()
            .value
            .clone()
            .ok_or_else(|| EngineError::torn_down("derivation", self.id.raw()))
    }

    fn is_stale(&self, runtime: &Runtime) -> Result<bool> {
        let inputs = runtime.refresh_inputs(self.id, NodeKind::Derived)?;
        Ok(!self.cache.lock().is_valid(&inputs))
    }
}

impl<T> Reactive for DerivationInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn update(&self, runtime: &Runtime) -> Result<bool> {
        self.ensure_current(runtime)
    }

    fn has_value(&self) -> bool {
        self.cache.lock().value.is_some()
    }

    fn release(&self) {
        self.cache.lock().value = None;
    }
}

/// A memoized value computed from declared dependencies.
///
/// Created through [`ScopeHandle::derive`](super::ScopeHandle::derive) or
/// [`ScopeHandle::declare`](super::ScopeHandle::declare). Clones share the
/// same cache.
pub struct Derivation<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<DerivationInner<T>>,
    runtime: Runtime,
}

impl<T> Derivation<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Register a derivation under `scope`. `compute` is `None` for a
    /// forward declaration; `same` enables the equality cutoff.
    pub(crate) fn register(
        runtime: &Runtime,
        scope: ScopeId,
        deps: &[NodeId],
        compute: Option<ComputeFn<T>>,
        same: Option<SameFn<T>>,
    ) -> Result<Self> {
        let id = runtime.register_node(scope, NodeKind::Derived, deps)?;
        let inner = Arc::new(DerivationInner::new(id, compute, same));

        let reactive: Arc<dyn Reactive> = inner.clone();
        runtime.register_derivation(&reactive);

        Ok(Self {
            inner,
            runtime: runtime.clone(),
        })
    }

    /// Get the derivation's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the value, recomputing if a dependency changed since the last
    /// computation.
    pub fn get(&self) -> Result<T> {
        self.runtime.record_read(self.inner.id);
        self.inner.evaluate(&self.runtime)
    }

    /// The last successfully computed value, without recomputing.
    ///
    /// `None` before the first computation and after teardown.
    pub fn cached(&self) -> Option<T> {
        self.inner.cache.lock().value.clone()
    }

    /// Whether the next `get()` will recompute.
    pub fn is_stale(&self) -> Result<bool> {
        self.inner.is_stale(&self.runtime)
    }

    /// Number of recomputations that produced a new value.
    pub fn version(&self) -> Result<u64> {
        self.runtime.version(self.inner.id, NodeKind::Derived)
    }

    /// Number of times the compute function has been invoked.
    pub fn compute_count(&self) -> usize {
        self.inner.compute_count.load(Ordering::SeqCst)
    }

    /// Supply the dependencies and compute function of a forward-declared
    /// derivation.
    ///
    /// Fails with `CyclicDependency` if a dependency already reads from this
    /// derivation, and with `AlreadyDefined` on a second call. Nothing is
    /// computed here.
    pub fn define<F>(&self, deps: &[&dyn Trackable], compute: F) -> Result<()>
    where
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        if self.inner.compute.read().is_some() {
            return Err(EngineError::AlreadyDefined {
                node: self.inner.id,
            });
        }

        let deps: Vec<NodeId> = deps.iter().map(|d| d.node_id()).collect();
        self.runtime.connect(self.inner.id, &deps)?;

        *self.inner.compute.write() = Some(Arc::new(compute));
        trace!(derivation = %self.inner.id, deps = deps.len(), "derivation defined");
        Ok(())
    }
}

impl<T> Trackable for Derivation<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn node_id(&self) -> NodeId {
        self.inner.id
    }
}

impl<T> Clone for Derivation<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T> Debug for Derivation<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivation")
            .field("id", &self.inner.id)
            .field("cached", &self.cached())
            .field("compute_count", &self.compute_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
