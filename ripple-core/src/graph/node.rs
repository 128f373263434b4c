//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a node in the dependency graph.
///
/// Ids come from a process-wide counter, so comparing two ids also compares
/// their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A cell. Cells are the roots of the graph: they carry a version and
    /// have dependents but no dependencies.
    Source,

    /// A derivation. Has dependencies and may have dependents.
    Derived,

    /// An effect. Effects are leaves: dependencies, never dependents.
    Effect,
}

impl NodeKind {
    /// Human-readable name used in errors and logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source => "cell",
            NodeKind::Derived => "derivation",
            NodeKind::Effect => "effect",
        }
    }
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,

    /// Change counter, starting at 0. Cells bump it on every write,
    /// derivations whenever a recomputation produced a new value.
    version: u64,

    /// Nodes that this node reads from (parents in the DAG).
    dependencies: HashSet<NodeId>,

    /// Nodes that read from this node (children in the DAG).
    dependents: HashSet<NodeId>,
}

impl Node {
    /// Create a new node with the given kind and a fresh id.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            version: 0,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Current change counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record a change. Returns the new version.
    pub fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.remove(&node_id);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &HashSet<NodeId> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.remove(&node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }
}
