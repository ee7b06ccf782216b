//! Recompute-aware partitioning as a minimum s-t cut.
//!
//! Every graph node `n` becomes a pair `n.in -> n.out` whose capacity is the cost of saving
//! `n`. Wiring and anchor edges are infinite, so a finite cut can only sever node-internal
//! edges, and the severed nodes are exactly the saved set. Everything on the sink side of
//! the cut is recomputed by the backward graph.
//!
//! ```text
//! source ==> x.in --16--> x.out ==> a.in --32--> a.out ==> g.in ==> sink
//!  (primal anchor)                       (recomputable)     (tangent closure)
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;

use super::{split_with_saved_values, Partition, PartitionError, Partitioner, RecomputePolicy};
use crate::graph::{Graph, JointGraph, NodeId, NodeKind};

/// Edge capacity. `Infinite` orders above every finite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capacity {
    Finite(u64),
    Infinite,
}

impl Capacity {
    pub fn is_infinite(self) -> bool {
        matches!(self, Capacity::Infinite)
    }

    fn is_positive(self) -> bool {
        !matches!(self, Capacity::Finite(0))
    }

    fn add(self, amount: u64) -> Self {
        match self {
            Capacity::Finite(value) => Capacity::Finite(value.saturating_add(amount)),
            Capacity::Infinite => Capacity::Infinite,
        }
    }

    fn sub(self, amount: u64) -> Self {
        match self {
            Capacity::Finite(value) => Capacity::Finite(value.saturating_sub(amount)),
            Capacity::Infinite => Capacity::Infinite,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Finite(value) => write!(f, "{value}"),
            Capacity::Infinite => f.write_str("inf"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetNode {
    Source,
    Sink,
    In(NodeId),
    Out(NodeId),
}

/// Result of a minimum cut: its total capacity and the saved nodes, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinCut {
    pub value: u64,
    pub saved: Vec<NodeId>,
}

/// Flow network over a joint graph. Edges are stored in forward/residual pairs, so edge
/// `2k` is a real edge and `2k + 1` its reverse with zero initial capacity.
pub struct FlowNetwork {
    net: DiGraph<NetNode, Capacity>,
    source: NodeIndex,
    sink: NodeIndex,
    names: Vec<String>,
}

impl FlowNetwork {
    pub fn build(joint: &JointGraph, policy: &RecomputePolicy) -> Self {
        let graph = joint.graph();
        let mut net = DiGraph::with_capacity(2 * graph.len() + 2, 4 * graph.len());
        let source = net.add_node(NetNode::Source);
        let sink = net.add_node(NetNode::Sink);

        let mut ports: Vec<Option<(NodeIndex, NodeIndex)>> = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            if node.is_output() {
                ports.push(None);
            } else {
                let node_in = net.add_node(NetNode::In(node.id));
                let node_out = net.add_node(NetNode::Out(node.id));
                ports.push(Some((node_in, node_out)));
            }
        }

        let closure = tangent_closure(graph);
        let backward_outputs: HashSet<NodeId> = joint.backward_outputs().iter().copied().collect();
        let users = graph.users();
        let mut network = FlowNetwork {
            net,
            source,
            sink,
            names: graph.nodes().iter().map(|node| node.name.clone()).collect(),
        };

        for node in graph.nodes() {
            let Some((node_in, node_out)) = ports[node.id.index()] else {
                continue;
            };
            if closure[node.id.index()] {
                network.add_edge(node_in, sink, Capacity::Infinite);
                continue;
            }

            let anchored = match &node.kind {
                NodeKind::Input(_) => true,
                NodeKind::Operation { op, .. } => !policy.is_recomputable(op),
                NodeKind::Output(_) => false,
            };
            if anchored {
                network.add_edge(source, node_in, Capacity::Infinite);
            }

            let weight = match &node.meta {
                None => Capacity::Infinite,
                Some(meta) if node.is_input() => Capacity::Finite(meta.nbytes()),
                Some(meta) => Capacity::Finite(
                    meta.nbytes()
                        .saturating_mul(policy.intermediate_cost_factor),
                ),
            };
            network.add_edge(node_in, node_out, weight);

            for user in &users[node.id.index()] {
                if let Some((user_in, _)) = ports[user.index()] {
                    network.add_edge(node_out, user_in, Capacity::Infinite);
                }
            }
            if backward_outputs.contains(&node.id) {
                network.add_edge(node_out, sink, Capacity::Infinite);
            }
        }
        network
    }

    fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, capacity: Capacity) {
        self.net.add_edge(from, to, capacity);
        self.net.add_edge(to, from, Capacity::Finite(0));
    }

    /// Real (non-residual) edges with their capacities.
    pub fn edges(&self) -> impl Iterator<Item = (NetNode, NetNode, Capacity)> + '_ {
        self.net
            .edge_references()
            .filter(|edge| edge.id().index() % 2 == 0)
            .map(|edge| (self.net[edge.source()], self.net[edge.target()], *edge.weight()))
    }

    fn label(&self, index: NodeIndex) -> String {
        match self.net[index] {
            NetNode::Source => "source".to_string(),
            NetNode::Sink => "sink".to_string(),
            NetNode::In(id) => format!("{}.in", self.names[id.index()]),
            NetNode::Out(id) => format!("{}.out", self.names[id.index()]),
        }
    }

    /// Edmonds-Karp max flow followed by a residual reachability sweep from the source.
    pub fn min_cut(&self) -> Result<MinCut, PartitionError> {
        let mut residual: Vec<Capacity> = self.net.edge_weights().copied().collect();
        let mut value = 0u64;

        while let Some(path) = self.augmenting_path(&residual) {
            let bottleneck = path
                .iter()
                .map(|edge| residual[edge.index()])
                .min()
                .unwrap_or(Capacity::Infinite);
            let amount = match bottleneck {
                Capacity::Finite(amount) => amount,
                Capacity::Infinite => {
                    return Err(PartitionError::UnboundedCut {
                        node: self.unbounded_node(&path),
                    })
                }
            };
            for edge in &path {
                residual[edge.index()] = residual[edge.index()].sub(amount);
                residual[edge.index() ^ 1] = residual[edge.index() ^ 1].add(amount);
            }
            value = value.saturating_add(amount);
        }

        let reachable = self.reachable(&residual);
        let mut saved = Vec::new();
        for edge in self.net.edge_references() {
            if edge.id().index() % 2 == 1 {
                continue;
            }
            let (from, to) = (edge.source(), edge.target());
            if !reachable[from.index()] || reachable[to.index()] {
                continue;
            }
            match (self.net[from], self.net[to]) {
                (NetNode::In(a), NetNode::Out(b)) if a == b => saved.push(a),
                _ => {
                    return Err(PartitionError::CutCrossesAnchor {
                        edge: format!("{} -> {}", self.label(from), self.label(to)),
                    })
                }
            }
        }
        saved.sort();
        Ok(MinCut { value, saved })
    }

    fn augmenting_path(&self, residual: &[Capacity]) -> Option<Vec<EdgeIndex>> {
        let mut pred: Vec<Option<EdgeIndex>> = vec![None; self.net.node_count()];
        let mut visited = vec![false; self.net.node_count()];
        let mut queue = VecDeque::from([self.source]);
        visited[self.source.index()] = true;

        while let Some(node) = queue.pop_front() {
            if node == self.sink {
                break;
            }
            for edge in self.net.edges(node) {
                let target = edge.target();
                if visited[target.index()] || !residual[edge.id().index()].is_positive() {
                    continue;
                }
                visited[target.index()] = true;
                pred[target.index()] = Some(edge.id());
                queue.push_back(target);
            }
        }
        if !visited[self.sink.index()] {
            return None;
        }

        let mut path = Vec::new();
        let mut node = self.sink;
        while let Some(edge) = pred[node.index()] {
            path.push(edge);
            node = self.net.edge_endpoints(edge)?.0;
        }
        path.reverse();
        Some(path)
    }

    fn reachable(&self, residual: &[Capacity]) -> Vec<bool> {
        let mut visited = vec![false; self.net.node_count()];
        let mut stack = vec![self.source];
        visited[self.source.index()] = true;
        while let Some(node) = stack.pop() {
            for edge in self.net.edges(node) {
                let target = edge.target();
                if !visited[target.index()] && residual[edge.id().index()].is_positive() {
                    visited[target.index()] = true;
                    stack.push(target);
                }
            }
        }
        visited
    }

    /// The first node on an infinite path whose own edge is infinite; only nodes without
    /// size metadata have one.
    fn unbounded_node(&self, path: &[EdgeIndex]) -> String {
        path.iter()
            .filter_map(|&edge| {
                let (from, to) = self.net.edge_endpoints(edge)?;
                match (self.net[from], self.net[to]) {
                    (NetNode::In(a), NetNode::Out(b)) if a == b => Some(a),
                    _ => None,
                }
            })
            .next()
            .map(|id| self.names[id.index()].clone())
            .unwrap_or_else(|| "source".to_string())
    }
}

/// Nodes transitively downstream of a tangent input, indexed by node id.
fn tangent_closure(graph: &Graph) -> Vec<bool> {
    let mut closure = vec![false; graph.len()];
    for node in graph.nodes() {
        closure[node.id.index()] =
            node.is_tangent() || node.node_args().any(|arg| closure[arg.index()]);
    }
    closure
}

/// Partitioner that saves the cheapest set of values under a [`RecomputePolicy`] and
/// recomputes the rest in the backward graph.
#[derive(Debug, Clone, Default)]
pub struct MinCutPartitioner {
    policy: RecomputePolicy,
}

impl MinCutPartitioner {
    pub fn new(policy: RecomputePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RecomputePolicy {
        &self.policy
    }

    pub fn cut(&self, joint: &JointGraph) -> Result<MinCut, PartitionError> {
        let _scope = crate::profiling::compile_scope("partition::min_cut");
        FlowNetwork::build(joint, &self.policy).min_cut()
    }
}

impl Partitioner for MinCutPartitioner {
    fn name(&self) -> &'static str {
        "min-cut"
    }

    fn partition(&self, joint: &JointGraph) -> Result<Partition, PartitionError> {
        let cut = self.cut(joint)?;
        log::debug!(
            "min-cut partition: cut value {} over {} saved value(s)",
            cut.value,
            cut.saved.len()
        );
        Ok(split_with_saved_values(joint, cut.saved, self.policy.refinement))
    }
}
