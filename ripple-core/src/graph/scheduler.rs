//! Update Scheduler
//!
//! The scheduler owns the dependency graph and determines the order in which
//! affected nodes are processed. Dependencies are always processed before their
//! dependents.
//!
//! # Algorithm
//!
//! 1. Collect the cells written during a batch.
//! 2. Walk their dependents breadth-first, collecting every reached node.
//! 3. Sort the reached nodes topologically (Kahn's algorithm) so derivations
//!    come before anything that reads them.
//!
//! Validity of a cached derivation is decided separately by comparing the
//! combined version of its direct dependencies (see
//! [`UpdateScheduler::combined_version`]). Versions only grow, so the sum
//! changes whenever any dependency does.
//!
//! Dependency edges are fixed when a node is connected. Because a node can
//! only be connected to nodes that already exist, the only way to close a
//! cycle is to connect a node that something else already reads from; that is
//! checked in [`UpdateScheduler::connect`].

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind};
use crate::error::{EngineError, Result};

/// The update scheduler manages the dependency graph and coordinates updates.
pub struct UpdateScheduler {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,
}

impl UpdateScheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node. Returns the removed node.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for dep_id in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Whether the node is still part of the graph.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Look up a node, failing with `UseAfterTeardown` when it was removed.
    pub fn live(&self, node_id: NodeId, kind: NodeKind) -> Result<&Node> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| EngineError::torn_down(kind.label(), node_id.raw()))
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Connect `node` to its declared dependencies.
    ///
    /// Fails without adding any edge if a dependency no longer exists or if
    /// the new edges would close a cycle.
    pub fn connect(&mut self, node: NodeId, deps: &[NodeId]) -> Result<()> {
        self.live(node, NodeKind::Derived)?;

        for &dep in deps {
            if !self.contains(dep) {
                return Err(EngineError::torn_down("dependency", dep.raw()));
            }
            if dep == node || self.upstream_nodes(dep).contains(&node) {
                return Err(EngineError::CyclicDependency { node, through: dep });
            }
        }

        for &dep in deps {
            self.add_edge(dep, node);
        }
        Ok(())
    }

    /// Every node `node` transitively reads from, in registration order.
    pub fn upstream(&self, node: NodeId, kind: NodeKind) -> Result<SmallVec<[NodeId; 8]>> {
        self.live(node, kind)?;

        let mut upstream: SmallVec<[NodeId; 8]> = self.upstream_nodes(node).into_iter().collect();
        upstream.sort();
        Ok(upstream)
    }

    /// The nodes `node` reads from directly, in registration order.
    pub fn dependencies(&self, node: NodeId, kind: NodeKind) -> Result<SmallVec<[NodeId; 8]>> {
        let mut deps: SmallVec<[NodeId; 8]> =
            self.live(node, kind)?.dependencies().iter().copied().collect();
        deps.sort();
        Ok(deps)
    }

    /// Sum of the versions of `nodes`. Removed nodes count as 0.
    pub fn combined_version(&self, nodes: &[NodeId]) -> u64 {
        nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(Node::version)
            .sum()
    }

    fn upstream_nodes(&self, node: NodeId) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut stack = vec![node];

        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes.get(&id) {
                for &dep in n.dependencies() {
                    if visited.insert(dep) {
                        stack.push(dep);
                    }
                }
            }
        }

        visited
    }

    /// Every node that transitively depends on `node`, in registration order.
    pub fn downstream(&self, node: NodeId) -> Vec<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([node]);

        while let Some(id) = queue.pop_front() {
            if let Some(n) = self.nodes.get(&id) {
                for &dependent in n.dependents() {
                    if visited.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let mut result: Vec<_> = visited.into_iter().collect();
        result.sort();
        result
    }

    /// Every node reachable from the given changed cells, in topological
    /// order. The changed cells themselves are not included.
    pub fn affected(&self, sources: &[NodeId]) -> Vec<NodeId> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        for source_id in sources {
            if let Some(source) = self.nodes.get(source_id) {
                queue.extend(source.dependents().iter().copied());
            }
        }

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get(&node_id) {
                to_process.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }

        self.topological_sort(to_process)
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    /// Ties are broken by registration order so the result is deterministic.
    fn topological_sort(&self, mut nodes: Vec<NodeId>) -> Vec<NodeId> {
        nodes.sort();
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // In-degrees only count edges within the node set
        for &node_id in &nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                let mut ready: SmallVec<[NodeId; 8]> = SmallVec::new();
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.push(dependent_id);
                        }
                    }
                }
                ready.sort();
                queue.extend(ready);
            }
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (UpdateScheduler, NodeId, NodeId, NodeId) {
        let mut scheduler = UpdateScheduler::new();
        let source = scheduler.add_node(Node::new(NodeKind::Source));
        let derived1 = scheduler.add_node(Node::new(NodeKind::Derived));
        let derived2 = scheduler.add_node(Node::new(NodeKind::Derived));
        scheduler.connect(derived1, &[source]).unwrap();
        scheduler.connect(derived2, &[derived1]).unwrap();
        (scheduler, source, derived1, derived2)
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = UpdateScheduler::new();

        let id1 = scheduler.add_node(Node::new(NodeKind::Source));
        let id2 = scheduler.add_node(Node::new(NodeKind::Derived));
        assert_eq!(scheduler.node_count(), 2);

        assert!(scheduler.remove_node(id1).is_some());
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
        assert!(scheduler.remove_node(id1).is_none());
    }

    #[test]
    fn removing_a_node_drops_its_edges() {
        let (mut scheduler, source, derived1, derived2) = chain();

        scheduler.remove_node(derived1);
        assert!(scheduler.get_node(source).unwrap().dependents().is_empty());
        assert!(scheduler.get_node(derived2).unwrap().dependencies().is_empty());
    }

    #[test]
    fn affected_nodes_come_in_topological_order() {
        let (scheduler, source, derived1, derived2) = chain();
        assert_eq!(scheduler.affected(&[source]), vec![derived1, derived2]);
        assert!(scheduler.affected(&[derived2]).is_empty());
    }

    #[test]
    fn diamond_visits_each_node_once() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::new(NodeKind::Source));
        let b = scheduler.add_node(Node::new(NodeKind::Source));
        let left = scheduler.add_node(Node::new(NodeKind::Derived));
        let right = scheduler.add_node(Node::new(NodeKind::Derived));
        let join = scheduler.add_node(Node::new(NodeKind::Derived));
        scheduler.connect(left, &[a]).unwrap();
        scheduler.connect(right, &[a, b]).unwrap();
        scheduler.connect(join, &[left, right]).unwrap();

        let order = scheduler.affected(&[a, b]);
        assert_eq!(order, vec![left, right, join]);
    }

    #[test]
    fn connect_rejects_cycles() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::new(NodeKind::Derived));
        let b = scheduler.add_node(Node::new(NodeKind::Derived));
        scheduler.connect(a, &[b]).unwrap();

        let err = scheduler.connect(b, &[a]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CyclicDependency { node, through } if node == b && through == a
        ));
        // No edge was added
        assert!(scheduler.get_node(b).unwrap().dependencies().is_empty());
    }

    #[test]
    fn connect_rejects_self_dependency() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::new(NodeKind::Derived));
        assert!(matches!(
            scheduler.connect(a, &[a]),
            Err(EngineError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn connect_rejects_missing_dependency() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::new(NodeKind::Derived));
        let gone = scheduler.add_node(Node::new(NodeKind::Source));
        scheduler.remove_node(gone);

        assert!(matches!(
            scheduler.connect(a, &[gone]),
            Err(EngineError::UseAfterTeardown { .. })
        ));
    }

    #[test]
    fn upstream_and_direct_dependencies() {
        let (scheduler, source, derived1, derived2) = chain();

        assert_eq!(
            scheduler.upstream(derived2, NodeKind::Derived).unwrap().as_slice(),
            &[source, derived1]
        );
        assert_eq!(
            scheduler.dependencies(derived2, NodeKind::Derived).unwrap().as_slice(),
            &[derived1]
        );
    }

    #[test]
    fn combined_version_sums_dependencies() {
        let (mut scheduler, source, derived1, _) = chain();
        assert_eq!(scheduler.combined_version(&[source, derived1]), 0);

        scheduler.get_node_mut(source).unwrap().bump_version();
        scheduler.get_node_mut(source).unwrap().bump_version();
        scheduler.get_node_mut(derived1).unwrap().bump_version();
        assert_eq!(scheduler.combined_version(&[source, derived1]), 3);

        scheduler.remove_node(derived1);
        assert_eq!(scheduler.combined_version(&[source, derived1]), 2);
    }

    #[test]
    fn downstream_is_in_registration_order() {
        let (scheduler, source, derived1, derived2) = chain();
        assert_eq!(scheduler.downstream(source), vec![derived1, derived2]);
    }
}
