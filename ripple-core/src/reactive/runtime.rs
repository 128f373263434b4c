//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells, derivations
//! and effects. It owns the dependency graph, the effect table, the scope
//! tree and the open batch.
//!
//! # How It Works
//!
//! 1. Cells, derivations and effects register with the runtime through a
//!    [`ScopeHandle`], declaring their dependencies up front.
//!
//! 2. A cell write bumps the cell's version and records it in the open batch.
//!    Nothing recomputes yet.
//!
//! 3. When the outermost batch commits, the runtime settles it in passes:
//!    a. Walk the graph from the written cells, in topological order
//!    b. Invalidate affected derivations (and recompute them under the eager policy)
//!    c. Schedule effects that were reached, never ran, or run every batch
//!    d. Flush scheduled effects in registration order
//!    e. If effects wrote cells, start another pass
//!
//! 4. Settle subscribers are notified once the passes quiesce. The commit is
//!    still open while they run, so their writes start another round of
//!    passes instead of a nested commit. Every pass of every round counts
//!    towards the runaway limit.
//!
//! # Change Propagation
//!
//! Every node carries a version. Cells bump it on each write; derivations
//! bump it only when a recomputation produced a new value. Before a
//! derivation recomputes or an effect re-runs, its direct derivation
//! dependencies are brought up to date and the combined version of its
//! direct dependencies is compared with the one it last saw. A derivation
//! created with [`ScopeHandle::derive_eq`] that recomputes to an equal value
//! keeps its version, so nothing downstream of it re-runs.
//!
//! A write with no open batch opens one and commits it straight away.
//!
//! # Locking
//!
//! All bookkeeping lives behind one mutex. The lock is never held while user
//! code runs (compute functions, effect bodies, cleanups, settle callbacks),
//! so user code is free to read and write cells.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, debug_span, error, trace, warn};

use super::context::ReactiveContext;
use super::effect::{Cleanup, EffectSlot, EffectState};
use super::scope::{ScopeHandle, ScopeId};
use crate::config::{DerivationPolicy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::graph::{Node, NodeId, NodeKind, UpdateScheduler};

/// A derivation as seen by the runtime, independent of its value type.
pub(crate) trait Reactive: Send + Sync {
    /// The derivation's node.
    fn node_id(&self) -> NodeId;

    /// Bring the cached value up to date, computing it if needed.
    ///
    /// Returns whether a recomputation happened.
    fn update(&self, runtime: &Runtime) -> Result<bool>;

    /// Whether a value has been computed and not released.
    fn has_value(&self) -> bool;

    /// Drop the cached value after teardown.
    fn release(&self);
}

/// The state of a node's direct dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Inputs {
    /// Sum of the dependency versions.
    pub(crate) version: u64,

    /// Number of direct dependencies.
    pub(crate) width: usize,

    /// A derivation dependency failed to compute.
    pub(crate) failed: bool,
}

/// Summary of one settled commit, passed to settle subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Number of settle passes the commit took.
    pub passes: usize,

    /// Derivations invalidated across all passes.
    pub invalidated: usize,

    /// Derivations recomputed eagerly (always 0 under the lazy policy).
    pub recomputed: usize,

    /// Effect runs across all passes.
    pub effects_run: usize,
}

/// Handle returned by [`Runtime::on_settled`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SettledSubscription(u64);

type SettledCallback = Arc<dyn Fn(&SettleReport) + Send + Sync>;

pub(crate) struct ScopeRecord {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    /// Nodes registered under this scope, in registration order.
    nodes: Vec<NodeId>,
    context: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ScopeRecord {
    fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            nodes: Vec::new(),
            context: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct BatchState {
    /// Open `begin_batch` calls.
    depth: usize,

    /// A commit is being settled; writes fold into it.
    settling: bool,

    /// Cells written since the last pass, in write order.
    dirty: indexmap::IndexSet<NodeId>,

    /// Effects registered or explicitly scheduled since the last pass.
    pending_effects: usize,
}

impl BatchState {
    fn has_work(&self) -> bool {
        !self.dirty.is_empty() || self.pending_effects > 0
    }

    fn idle(&self) -> bool {
        self.depth == 0 && !self.settling
    }
}

struct PassPlan {
    invalidated: usize,
    refresh: Vec<Arc<dyn Reactive>>,
    effects: Vec<NodeId>,
}

pub(crate) struct RuntimeState {
    graph: UpdateScheduler,
    effects: IndexMap<NodeId, EffectSlot>,
    derivations: HashMap<NodeId, Weak<dyn Reactive>>,
    scopes: HashMap<ScopeId, ScopeRecord>,
    batch: BatchState,
    settled: IndexMap<SettledSubscription, SettledCallback>,
    next_subscription: u64,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            graph: UpdateScheduler::new(),
            effects: IndexMap::new(),
            derivations: HashMap::new(),
            scopes: HashMap::new(),
            batch: BatchState::default(),
            settled: IndexMap::new(),
            next_subscription: 0,
        }
    }

    fn scope_mut(&mut self, scope: ScopeId) -> Result<&mut ScopeRecord> {
        self.scopes
            .get_mut(&scope)
            .ok_or_else(|| EngineError::torn_down("scope", scope.raw()))
    }

    /// Work out what the next settle pass has to do.
    fn plan_pass(&mut self) -> PassPlan {
        let dirty: Vec<NodeId> = self.batch.dirty.drain(..).collect();
        self.batch.pending_effects = 0;

        let affected = self.graph.affected(&dirty);

        let mut derived = Vec::new();
        let mut reached = HashSet::new();
        for id in affected {
            match self.graph.get_node(id).map(Node::kind) {
                Some(NodeKind::Derived) => derived.push(id),
                Some(NodeKind::Effect) => {
                    reached.insert(id);
                }
                _ => {}
            }
        }

        let refresh = derived
            .iter()
            .filter_map(|id| self.derivations.get(id).and_then(Weak::upgrade))
            .collect();

        let mut effects = Vec::new();
        for (id, slot) in self.effects.iter_mut() {
            if slot.is_due(reached.contains(id)) && slot.schedule() {
                effects.push(*id);
            }
        }

        PassPlan {
            invalidated: derived.len(),
            refresh,
            effects,
        }
    }

    /// Nodes an effect body may read without a warning. `None` accepts any
    /// read, which is the case for effects with no dependencies.
    fn allowed_reads(&self, effect: NodeId) -> Option<SmallVec<[NodeId; 8]>> {
        match self.effects.get(&effect) {
            Some(slot) if !slot.every_batch() => self
                .graph
                .upstream(effect, NodeKind::Effect)
                .ok()
                .filter(|nodes| !nodes.is_empty()),
            _ => None,
        }
    }

    /// Collect `scope` and all of its descendants, parents first.
    fn subtree(&self, scope: ScopeId) -> Vec<ScopeId> {
        let mut result = vec![scope];
        let mut i = 0;
        while i < result.len() {
            if let Some(record) = self.scopes.get(&result[i]) {
                result.extend(record.children.iter().copied());
            }
            i += 1;
        }
        result
    }
}

struct Shared {
    config: EngineConfig,
    state: Mutex<RuntimeState>,
}

/// A reactive engine instance.
///
/// `Runtime` is a cheap, clonable handle; clones share the same graph.
/// There is no global runtime: every cell, derivation and effect belongs to
/// the runtime whose scope created it.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let scope = runtime.create_scope();
///
/// let count = scope.cell(0)?;
/// let doubled = scope.derive(&[&count], {
///     let count = count.clone();
///     move || Ok(count.read()? * 2)
/// })?;
///
/// runtime.batch(|| {
///     count.set(1)?;
///     count.update(|c| c + 1)
/// })??;
/// assert_eq!(doubled.get()?, 4);
/// ```
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::from_config(EngineConfig::default())
    }

    /// Create a runtime with the given configuration.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(RuntimeState::new()),
            }),
        }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.shared.state.lock()
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Create a new top-level scope.
    pub fn create_scope(&self) -> ScopeHandle {
        let id = ScopeId::new();
        self.lock().scopes.insert(id, ScopeRecord::new(None));
        debug!(scope = %id, "scope created");
        ScopeHandle::new(id, self.clone())
    }

    pub(crate) fn create_child_scope(&self, parent: ScopeId) -> Result<ScopeHandle> {
        let id = ScopeId::new();
        {
            let mut state = self.lock();
            state.scope_mut(parent)?.children.push(id);
            state.scopes.insert(id, ScopeRecord::new(Some(parent)));
        }
        debug!(scope = %id, parent = %parent, "child scope created");
        Ok(ScopeHandle::new(id, self.clone()))
    }

    pub(crate) fn is_scope_live(&self, scope: ScopeId) -> bool {
        self.lock().scopes.contains_key(&scope)
    }

    /// Tear down a scope and everything registered under it.
    ///
    /// Child scopes go with it. Effects and derivations registered elsewhere
    /// that depend on the torn-down nodes are disposed too, since they can no
    /// longer be satisfied. Pending effect cleanups run in registration
    /// order across all of these, after the engine state has been updated.
    pub fn teardown(&self, scope: &ScopeHandle) -> Result<()> {
        self.teardown_scope(scope.id())
    }

    pub(crate) fn teardown_scope(&self, scope: ScopeId) -> Result<()> {
        let (cleanups, released, slots) = {
            let mut state = self.lock();
            if !state.scopes.contains_key(&scope) {
                return Err(EngineError::torn_down("scope", scope.raw()));
            }

            let scopes = state.subtree(scope);
            let mut owned: Vec<NodeId> = scopes
                .iter()
                .filter_map(|s| state.scopes.get(s))
                .flat_map(|record| record.nodes.iter().copied())
                .collect();
            owned.sort();

            let owned_set: HashSet<NodeId> = owned.iter().copied().collect();
            let mut orphans: Vec<NodeId> = owned
                .iter()
                .flat_map(|id| state.graph.downstream(*id))
                .filter(|id| !owned_set.contains(id))
                .collect();
            orphans.sort();
            orphans.dedup();

            let mut doomed: Vec<NodeId> = owned.iter().chain(orphans.iter()).copied().collect();
            doomed.sort();

            if let Some(parent) = state.scopes.get(&scope).and_then(|r| r.parent) {
                if let Some(record) = state.scopes.get_mut(&parent) {
                    record.children.retain(|c| *c != scope);
                }
            }
            for s in &scopes {
                state.scopes.remove(s);
            }

            let mut cleanups: Vec<Cleanup> = Vec::new();
            let mut released = Vec::new();
            let mut slots = Vec::new();
            for id in &doomed {
                state.batch.dirty.shift_remove(id);
                state.graph.remove_node(*id);
                if let Some(mut slot) = state.effects.shift_remove(id) {
                    cleanups.extend(slot.dispose());
                    slots.push(slot);
                }
                if let Some(reactive) = state.derivations.remove(id).and_then(|w| w.upgrade()) {
                    released.push(reactive);
                }
            }

            debug!(
                scope = %scope,
                scopes = scopes.len(),
                nodes = owned.len(),
                orphans = orphans.len(),
                "scope torn down"
            );
            (cleanups, released, slots)
        };

        for cleanup in cleanups {
            cleanup.run();
        }
        for reactive in released {
            trace!(derivation = %reactive.node_id(), "releasing cached value");
            reactive.release();
        }
        drop(slots);
        Ok(())
    }

    pub(crate) fn provide(
        &self,
        scope: ScopeId,
        type_id: TypeId,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Result<()> {
        self.lock().scope_mut(scope)?.context.insert(type_id, value);
        Ok(())
    }

    pub(crate) fn lookup_context(
        &self,
        scope: ScopeId,
        type_id: TypeId,
    ) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        let state = self.lock();
        let mut current = Some(scope);
        let mut first = true;

        while let Some(id) = current {
            let Some(record) = state.scopes.get(&id) else {
                if first {
                    return Err(EngineError::torn_down("scope", scope.raw()));
                }
                break;
            };
            if let Some(value) = record.context.get(&type_id) {
                return Ok(Some(Arc::clone(value)));
            }
            current = record.parent;
            first = false;
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a node under `scope` and connect it to `deps`.
    pub(crate) fn register_node(
        &self,
        scope: ScopeId,
        kind: NodeKind,
        deps: &[NodeId],
    ) -> Result<NodeId> {
        let mut state = self.lock();
        state.scope_mut(scope)?;

        let id = state.graph.add_node(Node::new(kind));
        if let Err(err) = state.graph.connect(id, deps) {
            state.graph.remove_node(id);
            error!(node = %id, %err, "rejected {} registration", kind.label());
            return Err(err);
        }

        state.scope_mut(scope)?.nodes.push(id);
        trace!(node = %id, scope = %scope, deps = deps.len(), "registered {}", kind.label());
        Ok(id)
    }

    /// Connect a forward-declared derivation to its dependencies.
    pub(crate) fn connect(&self, node: NodeId, deps: &[NodeId]) -> Result<()> {
        let result = self.lock().graph.connect(node, deps);
        if let Err(err) = &result {
            error!(node = %node, %err, "rejected derivation definition");
        }
        result
    }

    pub(crate) fn register_derivation(&self, reactive: &Arc<dyn Reactive>) {
        self.lock()
            .derivations
            .insert(reactive.node_id(), Arc::downgrade(reactive));
    }

    pub(crate) fn register_effect(&self, id: NodeId, slot: EffectSlot) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            state.effects.insert(id, slot);
            state.batch.pending_effects += 1;
            state.batch.idle()
        };

        if idle {
            self.settle()
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    pub(crate) fn ensure_live(&self, node: NodeId, kind: NodeKind) -> Result<()> {
        self.lock().graph.live(node, kind).map(|_| ())
    }

    pub(crate) fn version(&self, node: NodeId, kind: NodeKind) -> Result<u64> {
        Ok(self.lock().graph.live(node, kind)?.version())
    }

    /// Record that a derivation recomputed to a new value.
    pub(crate) fn bump_version(&self, node: NodeId) {
        if let Some(node) = self.lock().graph.get_node_mut(node) {
            node.bump_version();
        }
    }

    pub(crate) fn upstream(&self, node: NodeId, kind: NodeKind) -> Result<SmallVec<[NodeId; 8]>> {
        self.lock().graph.upstream(node, kind)
    }

    /// Bring the direct derivation dependencies of `node` up to date and
    /// return the combined version of all its direct dependencies.
    pub(crate) fn refresh_inputs(&self, node: NodeId, kind: NodeKind) -> Result<Inputs> {
        let (deps, derived) = {
            let state = self.lock();
            let deps = state.graph.dependencies(node, kind)?;
            let derived: Vec<Arc<dyn Reactive>> = deps
                .iter()
                .filter_map(|dep| state.derivations.get(dep).and_then(Weak::upgrade))
                .collect();
            (deps, derived)
        };

        let mut failed = false;
        for reactive in derived {
            if let Err(err) = reactive.update(self) {
                trace!(node = %node, dependency = %reactive.node_id(), %err, "dependency failed");
                failed = true;
            }
        }

        let version = self.lock().graph.combined_version(&deps);
        Ok(Inputs {
            version,
            width: deps.len(),
            failed,
        })
    }

    /// Attribute a read to the running computation, warning on undeclared reads.
    pub(crate) fn record_read(&self, node: NodeId) {
        if let Some(reader) = ReactiveContext::record_read(node) {
            if self.shared.config.warn_undeclared_reads {
                warn!(
                    node = %node,
                    reader = %reader,
                    "read of an undeclared dependency; changes to it will not re-run the reader"
                );
            }
        }
    }

    /// Record a cell write in the open batch, settling straight away when
    /// no batch is open.
    pub(crate) fn note_write(&self, cell: NodeId) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            let node = state
                .graph
                .get_node_mut(cell)
                .ok_or_else(|| EngineError::torn_down("cell", cell.raw()))?;
            let version = node.bump_version();
            state.batch.dirty.insert(cell);
            trace!(cell = %cell, version, "cell written");
            state.batch.idle()
        };

        if idle {
            self.settle()
        } else {
            Ok(())
        }
    }

    /// Ask for an effect to run in the next pass. No-op for disposed effects.
    pub(crate) fn schedule_effect(&self, id: NodeId) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            match state.effects.get_mut(&id) {
                Some(slot) => slot.force(),
                None => return Ok(()),
            }
            state.batch.pending_effects += 1;
            state.batch.idle()
        };

        if idle {
            self.settle()
        } else {
            Ok(())
        }
    }

    pub(crate) fn effect_state(&self, id: NodeId) -> Option<EffectState> {
        self.lock().effects.get(&id).map(EffectSlot::state)
    }

    /// Dispose a single effect, running its pending cleanup.
    pub(crate) fn dispose_effect(&self, id: NodeId) {
        let slot = {
            let mut state = self.lock();
            state.graph.remove_node(id);
            state.effects.shift_remove(&id)
        };

        if let Some(mut slot) = slot {
            trace!(effect = %id, "effect disposed");
            if let Some(cleanup) = slot.dispose() {
                cleanup.run();
            }
        }
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a batch. Writes are collected until the matching [`commit`](Self::commit).
    ///
    /// Batches nest; only the outermost commit settles.
    pub fn begin_batch(&self) {
        let mut state = self.lock();
        state.batch.depth += 1;
        trace!(depth = state.batch.depth, "batch opened");
    }

    /// Close the innermost batch, settling if it was the outermost one.
    pub fn commit(&self) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            if state.batch.depth == 0 {
                return Err(EngineError::CommitWithoutBatch);
            }
            state.batch.depth -= 1;
            state.batch.idle()
        };

        if idle {
            self.settle()
        } else {
            Ok(())
        }
    }

    /// Run `f` inside a batch and commit it.
    ///
    /// If `f` panics the batch is closed without settling.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let guard = BatchGuard::open(self);
        let result = f();
        guard.commit()?;
        Ok(result)
    }

    /// Whether a batch is open or a commit is being settled.
    pub fn in_batch(&self) -> bool {
        !self.lock().batch.idle()
    }

    // ------------------------------------------------------------------
    // Settling
    // ------------------------------------------------------------------

    /// Subscribe to commits. The callback runs once per commit, after every
    /// effect of that commit has flushed.
    pub fn on_settled<F>(&self, callback: F) -> SettledSubscription
    where
        F: Fn(&SettleReport) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let subscription = SettledSubscription(state.next_subscription);
        state.next_subscription += 1;
        state.settled.insert(subscription, Arc::new(callback));
        subscription
    }

    /// Remove a settle subscription. Returns whether it was registered.
    pub fn off_settled(&self, subscription: SettledSubscription) -> bool {
        self.lock().settled.shift_remove(&subscription).is_some()
    }

    fn settle(&self) -> Result<()> {
        let span = debug_span!("commit");
        let _enter = span.enter();

        // Raised until the commit is over, settle callbacks included
        let _settling = SettlingGuard::enter(self);
        let limit = self.shared.config.max_rebatch_passes + 1;
        let mut spent = 0;

        let outcome = loop {
            let report = match self.settle_passes(&mut spent, limit) {
                Ok(report) => report,
                Err(err) => break Err(err),
            };

            debug!(
                passes = report.passes,
                invalidated = report.invalidated,
                effects_run = report.effects_run,
                "commit settled"
            );

            let callbacks: Vec<SettledCallback> = self.lock().settled.values().cloned().collect();
            for callback in callbacks {
                callback(&report);
            }

            if !self.lock().batch.has_work() {
                break Ok(());
            }
            debug!(spent, "settle callbacks wrote cells; settling again");
        };

        if outcome.is_err() {
            let mut state = self.lock();
            state.batch.dirty.clear();
            state.batch.pending_effects = 0;
        }
        outcome
    }

    /// Run passes until no writes or scheduled effects are left.
    ///
    /// `spent` counts passes across the whole commit; once it reaches `limit`
    /// with work remaining the commit is a runaway.
    fn settle_passes(&self, spent: &mut usize, limit: usize) -> Result<SettleReport> {
        let eager = self.shared.config.derivation_policy == DerivationPolicy::Eager;
        let mut report = SettleReport::default();

        loop {
            let plan = {
                let mut state = self.lock();
                if report.passes > 0 && !state.batch.has_work() {
                    break;
                }
                if *spent == limit {
                    error!(passes = *spent, "commit did not quiesce; aborting");
                    return Err(EngineError::RunawayBatch { passes: *spent });
                }
                *spent += 1;
                report.passes += 1;
                state.plan_pass()
            };

            debug!(
                pass = report.passes,
                invalidated = plan.invalidated,
                effects = plan.effects.len(),
                "settle pass"
            );
            report.invalidated += plan.invalidated;

            if eager {
                for reactive in plan.refresh.iter().filter(|r| r.has_value()) {
                    match reactive.update(self) {
                        Ok(true) => report.recomputed += 1,
                        Ok(false) => {}
                        Err(err) => warn!(
                            derivation = %reactive.node_id(),
                            %err,
                            "eager recompute failed; derivation stays stale"
                        ),
                    }
                }
            }

            for id in plan.effects {
                if self.flush_effect(id) {
                    report.effects_run += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run one scheduled effect: pending cleanup first, then the body.
    ///
    /// An effect that was only reached through the graph is skipped when its
    /// direct dependencies are at the versions its last run saw.
    fn flush_effect(&self, id: NodeId) -> bool {
        let (every_batch, allowed) = {
            let state = self.lock();
            match state.effects.get(&id) {
                Some(slot) if slot.state() == EffectState::Scheduled => {
                    (slot.every_batch(), state.allowed_reads(id))
                }
                _ => return false,
            }
        };

        let inputs = if every_batch {
            None
        } else {
            match self.refresh_inputs(id, NodeKind::Effect) {
                Ok(inputs) => Some(inputs),
                Err(_) => return false,
            }
        };

        let (mut run, cleanup) = {
            let mut state = self.lock();
            let Some(slot) = state.effects.get_mut(&id) else {
                return false;
            };
            if inputs.as_ref().is_some_and(|inputs| slot.unchanged(inputs)) {
                slot.skip();
                trace!(effect = %id, "inputs unchanged; skipping run");
                return false;
            }
            match slot.begin_run(inputs.map(|inputs| inputs.version)) {
                Some(taken) => taken,
                None => return false,
            }
        };

        if let Some(cleanup) = cleanup {
            trace!(effect = %id, "running cleanup");
            cleanup.run();
        }

        trace!(effect = %id, "running effect");
        let next = {
            let _ctx = ReactiveContext::enter(id, allowed);
            run()
        };

        let (orphaned, leftover) = {
            let mut state = self.lock();
            match state.effects.get_mut(&id) {
                Some(slot) => {
                    slot.finish_run(run, next);
                    (None, None)
                }
                // Disposed while running
                None => (next, Some(run)),
            }
        };

        if let Some(cleanup) = orphaned {
            cleanup.run();
        }
        drop(leftover);
        true
    }

    /// Number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.lock().graph.node_count()
    }

    /// Number of live scopes.
    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Runtime")
            .field("nodes", &state.graph.node_count())
            .field("effects", &state.effects.len())
            .field("scopes", &state.scopes.len())
            .field("batch_depth", &state.batch.depth)
            .finish()
    }
}

/// Closes a batch opened by [`Runtime::batch`], even if the closure panics.
struct BatchGuard<'a> {
    runtime: &'a Runtime,
    open: bool,
}

impl<'a> BatchGuard<'a> {
    fn open(runtime: &'a Runtime) -> Self {
        runtime.begin_batch();
        Self {
            runtime,
            open: true,
        }
    }

    fn commit(mut self) -> Result<()> {
        self.open = false;
        self.runtime.commit()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            let mut state = self.runtime.lock();
            state.batch.depth = state.batch.depth.saturating_sub(1);
        }
    }
}

/// Marks the runtime as settling so writes from effects fold into the commit.
struct SettlingGuard<'a> {
    runtime: &'a Runtime,
}

impl<'a> SettlingGuard<'a> {
    fn enter(runtime: &'a Runtime) -> Self {
        runtime.lock().batch.settling = true;
        Self { runtime }
    }
}

impl Drop for SettlingGuard<'_> {
    fn drop(&mut self) {
        self.runtime.lock().batch.settling = false;
    }
}
