//! Engine Errors
//!
//! Every fallible engine operation returns [`Result`]. Failures split into two
//! families:
//!
//! - Computation errors (`DerivationComputeFailed`, `TransitionFailed`) are
//!   local to one call and the caller may retry on a later batch.
//! - Structural errors (`CyclicDependency`, `UseAfterTeardown`,
//!   `RunawayBatch`, ...) indicate mis-wiring and should not be retried.

use thiserror::Error;

use crate::graph::NodeId;

/// Error type produced by user computations (derivation compute functions and
/// reducer transitions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the reactive engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A cell, derivation, effect or scope was used after its scope was torn down.
    #[error("{kind} {id} used after its scope was torn down")]
    UseAfterTeardown {
        /// What kind of handle was used ("cell", "derivation", "effect", "scope").
        kind: &'static str,
        /// Raw id of the handle.
        id: u64,
    },

    /// A derivation's compute function failed. The previous cached value is kept.
    #[error("derivation {node} failed to compute: {source}")]
    DerivationComputeFailed {
        /// The derivation whose compute function failed.
        node: NodeId,
        /// The underlying computation error.
        #[source]
        source: BoxError,
    },

    /// A reducer transition failed. The paired cell was not written.
    #[error("transition for cell {cell} failed: {source}")]
    TransitionFailed {
        /// The cell paired with the failing transition.
        cell: NodeId,
        /// The underlying transition error.
        #[source]
        source: BoxError,
    },

    /// Registering the node would close a cycle in the dependency graph.
    #[error("registering {node} would create a dependency cycle through {through}")]
    CyclicDependency {
        /// The node being registered.
        node: NodeId,
        /// The declared dependency through which the cycle closes.
        through: NodeId,
    },

    /// A commit kept re-batching without quiescing.
    #[error("commit did not settle after {passes} passes; effects or settle callbacks keep writing")]
    RunawayBatch {
        /// Number of passes performed before aborting.
        passes: usize,
    },

    /// A forward-declared derivation was read before it was defined.
    #[error("derivation {node} was declared but never defined")]
    UndefinedDerivation {
        /// The undefined derivation.
        node: NodeId,
    },

    /// A forward-declared derivation was defined twice.
    #[error("derivation {node} is already defined")]
    AlreadyDefined {
        /// The derivation that was already defined.
        node: NodeId,
    },

    /// `commit()` was called without a matching `begin_batch()`.
    #[error("commit called without an open batch")]
    CommitWithoutBatch,

    /// The engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// The engine configuration could not be parsed.
    #[error("failed to parse engine configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error is a recoverable computation failure rather than a
    /// structural mis-wiring.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DerivationComputeFailed { .. } | EngineError::TransitionFailed { .. }
        )
    }

    pub(crate) fn torn_down(kind: &'static str, id: u64) -> Self {
        EngineError::UseAfterTeardown { kind, id }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computation_errors_are_recoverable() {
        let err = EngineError::TransitionFailed {
            cell: NodeId::from(3),
            source: "boom".into(),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "transition for cell #3 failed: boom");
    }

    #[test]
    fn structural_errors_are_not_recoverable() {
        let err = EngineError::CyclicDependency {
            node: NodeId::from(1),
            through: NodeId::from(2),
        };
        assert!(!err.is_recoverable());
        assert!(!EngineError::RunawayBatch { passes: 25 }.is_recoverable());
    }
}
