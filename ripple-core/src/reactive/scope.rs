//! Scopes
//!
//! A scope is a lifetime boundary. Every cell, derivation and effect is
//! created through a scope and lives until that scope is torn down.
//!
//! Scopes nest: [`ScopeHandle::child`] creates a scope that is torn down with
//! its parent. Scopes also carry typed context values. A value provided on a
//! scope is visible from every descendant through
//! [`ScopeHandle::use_context`], so deeply nested code can reach shared
//! state without it being threaded through every constructor.
//!
//! ```rust,ignore
//! #[derive(Clone)]
//! struct Theme(&'static str);
//!
//! let app = runtime.create_scope();
//! app.provide(Theme("dark"))?;
//!
//! let panel = app.child()?;
//! let theme = panel.use_context::<Theme>()?;
//! assert_eq!(theme.map(|t| t.0), Some("dark"));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::cell::{Cell, Trackable};
use super::derivation::Derivation;
use super::effect::{Cleanup, EffectDeps, EffectHandle, EffectSlot};
use super::reducer::Dispatch;
use super::runtime::Runtime;
use crate::error::{BoxError, Result};
use crate::graph::{NodeId, NodeKind};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn new() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Handle used to create reactive nodes under a scope.
#[derive(Clone)]
pub struct ScopeHandle {
    id: ScopeId,
    runtime: Runtime,
}

impl ScopeHandle {
    pub(crate) fn new(id: ScopeId, runtime: Runtime) -> Self {
        Self { id, runtime }
    }

    /// Get the scope's ID.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The runtime this scope belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Create a cell holding `value`.
    pub fn cell<T>(&self, value: T) -> Result<Cell<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.runtime.register_node(self.id, NodeKind::Source, &[])?;
        Ok(Cell::new(id, value, self.runtime.clone()))
    }

    /// Create a derivation over `deps`.
    ///
    /// Nothing is computed until the first [`Derivation::get`].
    pub fn derive<T, F>(&self, deps: &[&dyn Trackable], compute: F) -> Result<Derivation<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let deps: Vec<NodeId> = deps.iter().map(|d| d.node_id()).collect();
        Derivation::register(&self.runtime, self.id, &deps, Some(Arc::new(compute)), None)
    }

    /// Like [`derive`](Self::derive), but a recomputation that yields a value
    /// equal to the previous one does not count as a change. Dependents keep
    /// their cached values and effects on it are not re-run.
    pub fn derive_eq<T, F>(&self, deps: &[&dyn Trackable], compute: F) -> Result<Derivation<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let deps: Vec<NodeId> = deps.iter().map(|d| d.node_id()).collect();
        Derivation::register(
            &self.runtime,
            self.id,
            &deps,
            Some(Arc::new(compute)),
            Some(<T as PartialEq>::eq),
        )
    }

    /// Reserve a derivation whose dependencies are supplied later with
    /// [`Derivation::define`].
    pub fn declare<T>(&self) -> Result<Derivation<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Derivation::register(&self.runtime, self.id, &[], None, None)
    }

    /// Register an effect.
    ///
    /// The effect runs once the current batch settles (immediately if no
    /// batch is open), then again whenever `deps` say it should. If that
    /// first settle fails, the effect stays registered and the settle error
    /// is returned.
    pub fn effect<F>(&self, deps: EffectDeps, run: F) -> Result<EffectHandle>
    where
        F: FnMut() -> Option<Cleanup> + Send + 'static,
    {
        let id = self
            .runtime
            .register_node(self.id, NodeKind::Effect, deps.nodes())?;

        let run_count = Arc::new(AtomicUsize::new(0));
        let every_batch = matches!(deps, EffectDeps::EveryBatch);
        let slot = EffectSlot::new(Box::new(run), every_batch, Arc::clone(&run_count));

        let handle = EffectHandle::new(id, self.runtime.clone(), run_count);
        self.runtime.register_effect(id, slot)?;
        Ok(handle)
    }

    /// Create a cell paired with a transition function.
    pub fn reducer<S, A, F>(&self, initial: S, transition: F) -> Result<(Cell<S>, Dispatch<S, A>)>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(&S, &A) -> std::result::Result<S, BoxError> + Send + Sync + 'static,
    {
        let cell = self.cell(initial)?;
        let dispatch = Dispatch::new(cell.clone(), transition);
        Ok((cell, dispatch))
    }

    /// Create a nested scope torn down together with this one.
    pub fn child(&self) -> Result<ScopeHandle> {
        self.runtime.create_child_scope(self.id)
    }

    /// Attach a context value to this scope, replacing any value of the
    /// same type.
    pub fn provide<T>(&self, value: T) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        let value: Arc<dyn Any + Send + Sync> = Arc::new(value);
        self.runtime.provide(self.id, TypeId::of::<T>(), value)
    }

    /// Look up a context value on this scope or its nearest ancestor that
    /// provides one.
    pub fn use_context<T>(&self) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let found = self.runtime.lookup_context(self.id, TypeId::of::<T>())?;
        Ok(found.and_then(|value| value.downcast_ref::<T>().cloned()))
    }

    /// Tear down this scope. See [`Runtime::teardown`].
    pub fn teardown(&self) -> Result<()> {
        self.runtime.teardown_scope(self.id)
    }

    /// Whether the scope is still alive.
    pub fn is_live(&self) -> bool {
        self.runtime.is_scope_live(self.id)
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicI32;

    #[derive(Debug, Clone, PartialEq)]
    struct Theme(&'static str);

    #[test]
    fn context_is_visible_from_descendants() {
        let runtime = Runtime::new();
        let root = runtime.create_scope();
        root.provide(Theme("dark")).unwrap();

        let grandchild = root.child().unwrap().child().unwrap();
        assert_eq!(
            grandchild.use_context::<Theme>().unwrap(),
            Some(Theme("dark"))
        );
    }

    #[test]
    fn nearest_provider_wins() {
        let runtime = Runtime::new();
        let root = runtime.create_scope();
        root.provide(Theme("dark")).unwrap();

        let child = root.child().unwrap();
        child.provide(Theme("light")).unwrap();

        assert_eq!(child.use_context::<Theme>().unwrap(), Some(Theme("light")));
        assert_eq!(root.use_context::<Theme>().unwrap(), Some(Theme("dark")));
    }

    #[test]
    fn missing_context_is_none() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        assert_eq!(scope.use_context::<Theme>().unwrap(), None);
        assert_eq!(scope.use_context::<u32>().unwrap(), None);
    }

    #[test]
    fn teardown_removes_children() {
        let runtime = Runtime::new();
        let parent = runtime.create_scope();
        let child = parent.child().unwrap();
        let cell = child.cell(1).unwrap();
        assert_eq!(runtime.scope_count(), 2);

        parent.teardown().unwrap();
        assert!(!parent.is_live());
        assert!(!child.is_live());
        assert!(!cell.is_live());
        assert_eq!(runtime.scope_count(), 0);
        assert_eq!(runtime.node_count(), 0);

        assert!(matches!(
            child.cell(2),
            Err(EngineError::UseAfterTeardown { kind: "scope", .. })
        ));
        assert!(child.use_context::<Theme>().is_err());
    }

    #[test]
    fn child_teardown_leaves_parent_alive() {
        let runtime = Runtime::new();
        let parent = runtime.create_scope();
        let child = parent.child().unwrap();
        let kept = parent.cell(1).unwrap();

        child.teardown().unwrap();
        assert!(parent.is_live());
        assert!(kept.is_live());
        assert!(parent.child().is_ok());
    }

    #[test]
    fn teardown_disposes_dependents_in_other_scopes() {
        let runtime = Runtime::new();
        let owner = runtime.create_scope();
        let watcher = runtime.create_scope();
        let cell = owner.cell(0).unwrap();
        let cleanups = Arc::new(AtomicI32::new(0));

        let cleanups_clone = cleanups.clone();
        let effect = watcher
            .effect(EffectDeps::on(&[&cell]), move || {
                let cleanups = cleanups_clone.clone();
                Some(Cleanup::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .unwrap();

        owner.teardown().unwrap();
        assert!(effect.is_disposed());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(watcher.is_live());
    }

    #[test]
    fn teardown_cleans_up_across_scopes_in_registration_order() {
        let runtime = Runtime::new();
        let owner = runtime.create_scope();
        let watcher = runtime.create_scope();
        let cell = owner.cell(0).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (scope, name) in [(&watcher, "watcher"), (&owner, "owner")] {
            let order = order.clone();
            scope
                .effect(EffectDeps::on(&[&cell]), move || {
                    let order = order.clone();
                    Some(Cleanup::new(move || order.lock().push(name)))
                })
                .unwrap();
        }

        owner.teardown().unwrap();
        assert_eq!(*order.lock(), vec!["watcher", "owner"]);
    }

    #[test]
    fn scope_ids_are_unique() {
        let runtime = Runtime::new();
        let a = runtime.create_scope();
        let b = runtime.create_scope();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("scope#"));
    }
}
