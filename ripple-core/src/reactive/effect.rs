//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs after a batch settles
//! whenever one of its declared dependencies changed.
//!
//! # How Effects Work
//!
//! 1. When registered, the effect is scheduled so that it runs once the
//!    current batch (or the implicit one opened by the registration) settles.
//!
//! 2. When a dependency changes, the effect is scheduled again for the next
//!    settle pass. Effects declared with [`EffectDeps::EveryBatch`] run on
//!    every pass regardless of what changed.
//!
//! 3. Before re-running, the cleanup returned by the previous run is invoked.
//!    A scheduled run whose dependencies all sit at the versions the last run
//!    saw (a derivation recomputed to an equal value) is skipped.
//!
//! # Differences from Derivation
//!
//! - Derivations return a value; effects do not.
//! - Derivations are lazy (compute on access); effects run when the batch settles.
//! - Derivations cache results; effects just run their side effect.
//!
//! # Cleanup
//!
//! The effect body may return a [`Cleanup`]. It runs before the next run and
//! when the effect is disposed (explicitly or by scope teardown). A cleanup
//! is an `FnOnce`, so it runs at most once.
//!
//! The engine does not await anything an effect starts. Cancelling async work
//! is the cleanup's job, typically by flipping a token the work checks.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use super::cell::Trackable;
use super::runtime::{Inputs, Runtime};
use crate::error::Result;
use crate::graph::NodeId;

/// A cleanup callback returned by an effect body.
pub struct Cleanup(Box<dyn FnOnce() + Send>);

impl Cleanup {
    /// Wrap a closure as a cleanup.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub(crate) fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

/// When an effect runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectDeps {
    /// Run on every settle pass.
    EveryBatch,

    /// Run after registration, then whenever one of these nodes changes.
    /// An empty list runs exactly once.
    On(SmallVec<[NodeId; 4]>),
}

impl EffectDeps {
    /// Depend on the given cells and derivations.
    pub fn on(deps: &[&dyn Trackable]) -> Self {
        EffectDeps::On(deps.iter().map(|d| d.node_id()).collect())
    }

    /// Run once after registration and never again.
    pub fn once() -> Self {
        EffectDeps::On(SmallVec::new())
    }

    pub(crate) fn nodes(&self) -> &[NodeId] {
        match self {
            EffectDeps::EveryBatch => &[],
            EffectDeps::On(nodes) => nodes,
        }
    }
}

/// Lifecycle state of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectState {
    /// Waiting for a dependency to change.
    Idle,

    /// Will run in the current settle pass.
    Scheduled,

    /// The body is executing.
    Running,

    /// Torn down. Never runs again.
    Disposed,
}

pub(crate) type RunFn = Box<dyn FnMut() -> Option<Cleanup> + Send>;

/// Runtime-side storage for one effect.
pub(crate) struct EffectSlot {
    run: Option<RunFn>,
    cleanup: Option<Cleanup>,
    state: EffectState,
    every_batch: bool,
    has_run: bool,
    forced: bool,
    /// Scheduled only because a dependency was reached, so the run may be
    /// skipped if nothing it reads actually changed.
    reached_only: bool,
    /// Combined dependency version at the start of the last run.
    seen: Option<u64>,
    run_count: Arc<AtomicUsize>,
}

impl EffectSlot {
    pub(crate) fn new(run: RunFn, every_batch: bool, run_count: Arc<AtomicUsize>) -> Self {
        Self {
            run: Some(run),
            cleanup: None,
            state: EffectState::Idle,
            every_batch,
            has_run: false,
            forced: false,
            reached_only: false,
            seen: None,
            run_count,
        }
    }

    pub(crate) fn state(&self) -> EffectState {
        self.state
    }

    pub(crate) fn every_batch(&self) -> bool {
        self.every_batch
    }

    /// Whether the effect should run in a pass where `reached` says if one
    /// of its dependencies changed.
    pub(crate) fn is_due(&self, reached: bool) -> bool {
        self.every_batch || !self.has_run || self.forced || reached
    }

    /// Request a run in the next pass.
    pub(crate) fn force(&mut self) {
        if self.state != EffectState::Disposed {
            self.forced = true;
        }
    }

    /// `Idle -> Scheduled`. Returns false for disposed effects.
    pub(crate) fn schedule(&mut self) -> bool {
        match self.state {
            EffectState::Disposed => false,
            EffectState::Running => false,
            EffectState::Idle | EffectState::Scheduled => {
                self.state = EffectState::Scheduled;
                self.reached_only = self.has_run && !self.every_batch && !self.forced;
                self.forced = false;
                true
            }
        }
    }

    /// Whether a scheduled run can be skipped given the current `inputs`.
    pub(crate) fn unchanged(&self, inputs: &Inputs) -> bool {
        self.reached_only && !inputs.failed && self.seen == Some(inputs.version)
    }

    /// `Scheduled -> Idle` without running.
    pub(crate) fn skip(&mut self) {
        if self.state == EffectState::Scheduled {
            self.state = EffectState::Idle;
        }
    }

    /// `Scheduled -> Running`, handing out the body and the pending cleanup.
    ///
    /// `seen` is the combined dependency version the run starts from.
    pub(crate) fn begin_run(&mut self, seen: Option<u64>) -> Option<(RunFn, Option<Cleanup>)> {
        if self.state != EffectState::Scheduled {
            return None;
        }
        let run = self.run.take()?;
        self.seen = seen;
        self.state = EffectState::Running;
        self.run_count.fetch_add(1, Ordering::SeqCst);
        Some((run, self.cleanup.take()))
    }

    /// `Running -> Idle`, keeping the cleanup the run returned.
    pub(crate) fn finish_run(&mut self, run: RunFn, cleanup: Option<Cleanup>) {
        self.run = Some(run);
        self.cleanup = cleanup;
        self.has_run = true;
        self.state = EffectState::Idle;
    }

    /// Move to `Disposed`, returning the cleanup that still has to run.
    pub(crate) fn dispose(&mut self) -> Option<Cleanup> {
        self.state = EffectState::Disposed;
        self.cleanup.take()
    }
}

/// Handle to a registered effect.
///
/// Dropping the handle does not dispose the effect; it lives until
/// [`dispose`](Self::dispose) is called or its scope is torn down.
#[derive(Clone)]
pub struct EffectHandle {
    id: NodeId,
    runtime: Runtime,
    run_count: Arc<AtomicUsize>,
}

impl EffectHandle {
    pub(crate) fn new(id: NodeId, runtime: Runtime, run_count: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            runtime,
            run_count,
        }
    }

    /// Get the effect's node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EffectState {
        self.runtime
            .effect_state(self.id)
            .unwrap_or(EffectState::Disposed)
    }

    /// Number of times the body has been invoked.
    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.state() == EffectState::Disposed
    }

    /// Run the effect again in the next settle pass even if nothing changed.
    ///
    /// Settles immediately when no batch is open. Does nothing once disposed.
    pub fn schedule(&self) -> Result<()> {
        self.runtime.schedule_effect(self.id)
    }

    /// Dispose of the effect, running its pending cleanup.
    ///
    /// After disposal, the effect will not run again.
    pub fn dispose(&self) {
        self.runtime.dispose_effect(self.id);
    }
}

impl fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("run_count", &self.run_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn effect_runs_on_registration() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();

        let effect = scope
            .effect(EffectDeps::once(), move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                None
            })
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
        assert_eq!(effect.state(), EffectState::Idle);
    }

    #[test]
    fn registration_inside_batch_defers_first_run() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();

        runtime.begin_batch();
        let effect = scope
            .effect(EffectDeps::once(), move || {
                runs_clone.fetch_add(1, Ordering::SeqCst);
                None
            })
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        runtime.commit().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let count = scope.cell(0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let count_clone = count.clone();
        let seen_clone = seen.clone();
        scope
            .effect(EffectDeps::on(&[&count]), move || {
                seen_clone.lock().push(count_clone.read().unwrap());
                None
            })
            .unwrap();

        count.set(1).unwrap();
        count.set(2).unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn unrelated_write_does_not_rerun_effect() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let watched = scope.cell(0).unwrap();
        let other = scope.cell(0).unwrap();

        let effect = scope
            .effect(EffectDeps::on(&[&watched]), || None)
            .unwrap();

        other.set(5).unwrap();
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn every_batch_effect_runs_on_each_commit() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let unrelated = scope.cell(0).unwrap();

        let effect = scope.effect(EffectDeps::EveryBatch, || None).unwrap();
        assert_eq!(effect.run_count(), 1);

        unrelated.set(1).unwrap();
        runtime.batch(|| ()).unwrap();
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn explicit_schedule_forces_a_run() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let effect = scope.effect(EffectDeps::once(), || None).unwrap();

        effect.schedule().unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let count = scope.cell(0).unwrap();

        let effect = scope
            .effect(EffectDeps::on(&[&count]), || None)
            .unwrap();
        assert_eq!(effect.run_count(), 1);

        effect.dispose();
        assert!(effect.is_disposed());

        // Scheduling a disposed effect is a silent no-op
        effect.schedule().unwrap();
        count.set(1).unwrap();
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn dispose_runs_pending_cleanup_once() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cleanups = Arc::new(AtomicI32::new(0));
        let cleanups_clone = cleanups.clone();

        let effect = scope
            .effect(EffectDeps::once(), move || {
                let cleanups = cleanups_clone.clone();
                Some(Cleanup::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .unwrap();

        effect.dispose();
        effect.dispose();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_disposed_during_its_own_run_still_cleans_up() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let cleaned = Arc::new(AtomicI32::new(0));
        let handle: Arc<Mutex<Option<EffectHandle>>> = Arc::new(Mutex::new(None));
        let count = scope.cell(0).unwrap();

        let cleaned_clone = cleaned.clone();
        let handle_clone = handle.clone();
        let count_clone = count.clone();
        let effect = scope
            .effect(EffectDeps::on(&[&count]), move || {
                if count_clone.read().unwrap() > 0 {
                    if let Some(me) = handle_clone.lock().as_ref() {
                        me.dispose();
                    }
                }
                let cleaned = cleaned_clone.clone();
                Some(Cleanup::new(move || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .unwrap();
        *handle.lock() = Some(effect.clone());

        count.set(1).unwrap();
        // Cleanup from the first run, then the cleanup returned by the
        // run that disposed the effect
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
        assert!(effect.is_disposed());
    }

    #[test]
    fn effects_flush_in_registration_order() {
        let runtime = Runtime::new();
        let scope = runtime.create_scope();
        let trigger = scope.cell(0).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            scope
                .effect(EffectDeps::on(&[&trigger]), move || {
                    order.lock().push(name);
                    None
                })
                .unwrap();
        }
        order.lock().clear();

        trigger.set(1).unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }
}
