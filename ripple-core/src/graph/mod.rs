//! Dependency Graph
//!
//! This module implements the dependency graph that tracks relationships
//! between cells, derivations and effects.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent cells (sources), derivations or effects
//! - Edges represent dependencies: if A depends on B, there is an edge from B to A
//!
//! When a batch commits, we traverse the graph from the written cells to find
//! all affected nodes, then hand them back in dependency order.
//!
//! # Design Decisions
//!
//! 1. The graph is centralized per runtime rather than distributed across
//!    handles, which keeps topological ordering and cycle checks simple.
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;

pub use node::{Node, NodeId, NodeKind};
pub use scheduler::UpdateScheduler;
