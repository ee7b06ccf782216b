//! Graph model shared by the extractor, the partitioners and the dispatch layer.
//!
//! A [`Graph`] is an ordered list of [`Node`]s closed by a single output node. Every argument
//! refers to an earlier node, names are unique, and graphs are immutable once built: rewriting
//! always produces a fresh graph through a [`GraphBuilder`], which keeps the forward and
//! backward views of a joint graph from aliasing each other.
//!
//! ```text
//! %a: primal f32[4]            <- InputRole::Primal
//! %t: tangent f32[4]           <- InputRole::Tangent
//! %c = mul(%a, %a) : f32[4]    <- NodeKind::Operation
//! return (%c, %t)              <- NodeKind::Output
//! ```

mod builder;
pub mod extract;
mod node;
pub mod text;
mod topology;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::GraphBuilder;
pub use extract::{eliminate_dead_code, extract_subgraph};
pub use node::{
    Arg, Args, DType, GraphOutput, InputRole, Literal, Node, NodeId, NodeKind, OpTag, TensorMeta,
};
pub use topology::GraphError;

/// Validated, immutable computation graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Validates `nodes` and wraps them into a graph.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self, GraphError> {
        topology::validate_nodes(&nodes)?;
        Ok(Graph { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Number of nodes including the output node.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn output_node(&self) -> &Node {
        // `from_nodes` guarantees a trailing output node.
        &self.nodes[self.nodes.len() - 1]
    }

    pub fn output(&self) -> &GraphOutput {
        match &self.output_node().kind {
            NodeKind::Output(output) => output,
            _ => unreachable!("validated graph always ends with an output node"),
        }
    }

    /// Flat list of returned values, whether or not the output is a tuple.
    pub fn output_values(&self) -> &[NodeId] {
        self.output().values()
    }

    /// Input nodes in graph order; this is the calling convention of a compiled graph.
    pub fn inputs(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|node| node.is_input())
    }

    pub fn primal_inputs(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.is_primal())
            .map(|node| node.id)
            .collect()
    }

    pub fn tangent_inputs(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.is_tangent())
            .map(|node| node.id)
            .collect()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs().count()
    }

    /// Operation nodes in graph order.
    pub fn operations(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .iter()
            .filter(|node| matches!(node.kind, NodeKind::Operation { .. }))
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| node.id)
    }

    pub fn name_index(&self) -> HashMap<&str, NodeId> {
        self.nodes
            .iter()
            .map(|node| (node.name.as_str(), node.id))
            .collect()
    }

    /// Users of every node, indexed by node id. The output node counts as a user; duplicate
    /// uses by the same consumer are collapsed.
    pub fn users(&self) -> Vec<Vec<NodeId>> {
        let mut users: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for arg in node.node_args() {
                let entry = &mut users[arg.index()];
                if entry.last() != Some(&node.id) {
                    entry.push(node.id);
                }
            }
        }
        users
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(src: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct RawGraph {
            nodes: Vec<Node>,
        }
        let raw: RawGraph = serde_json::from_str(src)?;
        Ok(Graph::from_nodes(raw.nodes)?)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        text::write_graph(self, "graph", f)
    }
}

/// Joint forward/backward graph together with the number of leading outputs that belong
/// to the forward computation. The remaining outputs are gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct JointGraph {
    graph: Graph,
    num_fwd_outputs: usize,
}

impl JointGraph {
    pub fn new(graph: Graph, num_fwd_outputs: usize) -> Result<Self, GraphError> {
        let total = graph.output_values().len();
        if num_fwd_outputs > total {
            return Err(GraphError::InvalidSplit {
                num_fwd_outputs,
                total,
            });
        }
        Ok(JointGraph {
            graph,
            num_fwd_outputs,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_fwd_outputs(&self) -> usize {
        self.num_fwd_outputs
    }

    pub fn forward_outputs(&self) -> &[NodeId] {
        &self.graph.output_values()[..self.num_fwd_outputs]
    }

    pub fn backward_outputs(&self) -> &[NodeId] {
        &self.graph.output_values()[self.num_fwd_outputs..]
    }
}
