use std::collections::HashSet;

use super::node::{Args, GraphOutput, InputRole, Node, NodeId, NodeKind, OpTag, TensorMeta};
use super::topology::GraphError;
use super::Graph;

/// Append-only graph construction. Ids are handed out densely in insertion order, so a
/// builder can never produce a forward reference through its own API.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Returns `base` if it is still free, otherwise `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        if !self.names.contains(base) {
            return base.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}_{suffix}");
            if !self.names.contains(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    pub fn input(
        &mut self,
        name: impl Into<String>,
        role: InputRole,
        meta: Option<TensorMeta>,
    ) -> NodeId {
        self.push(name.into(), NodeKind::Input(role), meta)
    }

    pub fn primal(&mut self, name: impl Into<String>, meta: Option<TensorMeta>) -> NodeId {
        self.input(name, InputRole::Primal, meta)
    }

    pub fn tangent(&mut self, name: impl Into<String>, meta: Option<TensorMeta>) -> NodeId {
        self.input(name, InputRole::Tangent, meta)
    }

    pub fn op(
        &mut self,
        name: impl Into<String>,
        op: impl Into<OpTag>,
        args: impl Into<Args>,
        meta: Option<TensorMeta>,
    ) -> NodeId {
        let kind = NodeKind::Operation {
            op: op.into(),
            args: args.into(),
        };
        self.push(name.into(), kind, meta)
    }

    /// Re-expresses `source` (an operation from another graph) against already remapped arguments.
    pub fn copy_operation(&mut self, source: &Node, args: Args) -> NodeId {
        let op = match &source.kind {
            NodeKind::Operation { op, .. } => op.clone(),
            other => panic!("copy_operation called on non-operation node {other:?}"),
        };
        self.push(
            source.name.clone(),
            NodeKind::Operation { op, args },
            source.meta.clone(),
        )
    }

    /// Appends the output node and validates the finished graph.
    pub fn finish(mut self, output: GraphOutput) -> Result<Graph, GraphError> {
        let name = self.unique_name("output");
        self.push(name, NodeKind::Output(output), None);
        Graph::from_nodes(self.nodes)
    }

    fn push(&mut self, name: String, kind: NodeKind, meta: Option<TensorMeta>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.names.insert(name.clone());
        self.nodes.push(Node {
            id,
            name,
            kind,
            meta,
        });
        id
    }
}
