//! Dependency Graph Analysis
//!
//! Builds a petgraph view of the transitive dependency closure of a
//! registry and reports strongly connected components (dependency cycles).
//! Cycles are legal: the lock protocol tolerates them. The report exists for
//! diagnostics and for deciding whether a dependency order is available.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use super::Upstream;
use crate::lock::RegistryId;

/// Transitive dependency closure of one registry
///
/// Edges point from a registry to the registry it depends on.
pub struct DependencyTopology {
    graph: DiGraph<String, ()>,
    root: NodeIndex,
    node_indices: HashMap<RegistryId, NodeIndex>,
}

/// Build the topology rooted at a registry named `root_name` whose direct
/// upstreams are `upstreams`
pub fn dependency_topology(
    root_id: RegistryId,
    root_name: &str,
    upstreams: Vec<Arc<dyn Upstream>>,
) -> DependencyTopology {
    let mut graph = DiGraph::new();
    let mut node_indices = HashMap::new();

    let root = graph.add_node(root_name.to_string());
    node_indices.insert(root_id, root);

    let mut queue: VecDeque<(NodeIndex, Vec<Arc<dyn Upstream>>)> = VecDeque::new();
    queue.push_back((root, upstreams));

    while let Some((from, targets)) = queue.pop_front() {
        for upstream in targets {
            let to = match node_indices.get(&upstream.id()) {
                Some(&index) => index,
                None => {
                    let index = graph.add_node(upstream.name().to_string());
                    node_indices.insert(upstream.id(), index);
                    queue.push_back((index, upstream.upstreams()));
                    index
                }
            };
            graph.update_edge(from, to, ());
        }
    }

    DependencyTopology {
        graph,
        root,
        node_indices,
    }
}

impl DependencyTopology {
    /// Registries in the closure, the root included
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: RegistryId) -> bool {
        self.node_indices.contains_key(&id)
    }

    /// Names of all registries the root transitively depends on
    pub fn closure(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .graph
            .node_indices()
            .filter(|index| *index != self.root)
            .map(|index| self.graph[index].clone())
            .collect();
        names.sort();
        names
    }

    /// Direct upstream names of a registry in the closure
    pub fn upstreams_of(&self, id: RegistryId) -> Vec<String> {
        let Some(&index) = self.node_indices.get(&id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| self.graph[edge.target()].clone())
            .collect()
    }

    /// Dependency cycles, each as a sorted list of registry names
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || self
                        .graph
                        .edges_directed(scc[0], Direction::Outgoing)
                        .any(|edge| edge.target() == scc[0])
            })
            .map(|scc| {
                let mut names: Vec<String> =
                    scc.iter().map(|index| self.graph[*index].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles().is_empty()
    }

    /// Upstreams-first order of the closure, `None` when it contains a cycle
    pub fn dependency_order(&self) -> Option<Vec<String>> {
        let mut order = toposort(&self.graph, None).ok()?;
        order.reverse();
        Some(order.into_iter().map(|index| self.graph[index].clone()).collect())
    }
}
