//! Reactive Context
//!
//! The reactive context tracks which computation is currently running so that
//! reads can be attributed to it.
//!
//! Dependency sets in this engine are declared up front, so the context does
//! not discover dependencies. It records every read and reports the ones that
//! fall outside the declared set; those are almost always a forgotten entry in
//! a dependency list, and the computation will not re-run when that cell
//! changes.
//!
//! # Implementation
//!
//! A thread-local stack holds one entry per running computation. Nested
//! computations (a derivation reading another derivation) push their own
//! entry, so each read is checked against the innermost computation only.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone)]
struct ContextEntry {
    node: NodeId,

    /// Nodes the computation may read. `None` accepts any read.
    allowed: Option<SmallVec<[NodeId; 8]>>,
}

/// Guard that pops the context when dropped.
///
/// This keeps the stack balanced even if the computation panics.
pub struct ReactiveContext {
    node: NodeId,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given computation.
    ///
    /// `allowed` is the set of nodes the computation declared (directly or
    /// transitively); `None` disables the undeclared-read check.
    pub fn enter(node: NodeId, allowed: Option<SmallVec<[NodeId; 8]>>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry { node, allowed });
        });

        Self { node }
    }

    /// Check a read of `node` against the current computation.
    ///
    /// Returns the reading computation when the read was not declared.
    pub fn record_read(node: NodeId) -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| {
            let stack = stack.borrow();
            let entry = stack.last()?;

            match &entry.allowed {
                Some(allowed) if !allowed.contains(&node) => Some(entry.node),
                _ => None,
            }
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.node, self.node,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.node, entry.node
                );
            }
        });
    }
}
