//! Ripple Core
//!
//! This crate provides a localized reactive engine: given a write to a piece
//! of held state, it works out which dependent computations must re-run and
//! in what order. It implements:
//!
//! - Versioned cells with batched writes
//! - Lazily recomputed derivations over declared dependencies
//! - Effects with cleanups, flushed in registration order
//! - Reducer-style dispatch
//! - Scopes with nested lifetimes and typed context values
//!
//! There is no global state. Every graph belongs to a [`Runtime`] instance,
//! and hosts (renderers, network layers, UI frameworks) plug in through
//! scopes and [`Runtime::on_settled`].
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Cells, derivations, effects, reducers, scopes and the runtime
//! - `graph`: Dependency graph and topological update scheduling
//! - `config`: Runtime settings
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::{EffectDeps, Runtime};
//!
//! let runtime = Runtime::new();
//! let scope = runtime.create_scope();
//!
//! // Create a cell
//! let count = scope.cell(0)?;
//!
//! // Create a derived value
//! let doubled = scope.derive(&[&count], {
//!     let count = count.clone();
//!     move || Ok(count.read()? * 2)
//! })?;
//!
//! // Create an effect
//! scope.effect(EffectDeps::on(&[&doubled]), {
//!     let doubled = doubled.clone();
//!     move || {
//!         println!("Doubled: {:?}", doubled.get());
//!         None
//!     }
//! })?;
//!
//! // Update the cell
//! count.set(5)?;
//! // Effect runs after the write commits, prints: "Doubled: Ok(10)"
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::{DerivationPolicy, EngineConfig};
pub use error::{BoxError, EngineError, Result};
pub use reactive::{
    Cell, Cleanup, Derivation, Dispatch, EffectDeps, EffectHandle, EffectState, Runtime,
    ScopeHandle, ScopeId, SettleReport, SettledSubscription, Trackable, Update,
};
