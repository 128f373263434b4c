//! Reactive Primitives
//!
//! This module implements the reactive engine: cells, derivations, effects,
//! reducers and the scopes and runtime that own them.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell holds a value and a version stamp. Writing a cell records it in the
//! open batch; nothing recomputes until the batch commits.
//!
//! ## Derivations
//!
//! A Derivation is a cached value computed from dependencies declared when it
//! is created. It recomputes lazily, only when a cell upstream of it changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs after a batch settles
//! when one of its dependencies changed. It may return a cleanup that runs
//! before the next run and on disposal.
//!
//! ## Reducers
//!
//! A reducer pairs a cell with a pure `(state, action) -> state` transition.
//!
//! ## Scopes
//!
//! Every node belongs to a scope. Tearing a scope down disposes its nodes,
//! its child scopes and anything elsewhere that depended on them.
//!
//! # Implementation Notes
//!
//! Dependencies are declared explicitly rather than discovered by tracking
//! reads. The thread-local [`ReactiveContext`] still observes reads so that
//! a read of an undeclared dependency can be reported.

mod cell;
mod context;
mod derivation;
mod effect;
mod reducer;
mod runtime;
mod scope;

pub use cell::{Cell, Trackable, Update};
pub use context::ReactiveContext;
pub use derivation::Derivation;
pub use effect::{Cleanup, EffectDeps, EffectHandle, EffectState};
pub use reducer::Dispatch;
pub use runtime::{Runtime, SettleReport, SettledSubscription};
pub use scope::{ScopeHandle, ScopeId};
