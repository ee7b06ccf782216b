//! Node-level building blocks shared by every graph in the crate.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Dense index of a node inside the graph that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Distinguishes original function arguments from gradient seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputRole {
    /// Original argument of the user function.
    Primal,
    /// Incoming gradient for one forward output.
    Tangent,
    /// Forward intermediate threaded into a backward graph.
    Saved,
}

impl InputRole {
    pub fn as_str(self) -> &'static str {
        match self {
            InputRole::Primal => "primal",
            InputRole::Tangent => "tangent",
            InputRole::Saved => "saved",
        }
    }
}

/// Operator name as recorded by the tracer (for example `add` or `matmul`).
///
/// The partitioning layer never interprets operator semantics; it only
/// compares tags against recompute policies and hands them to compilers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpTag(Arc<str>);

impl OpTag {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OpTag {
    fn from(value: &str) -> Self {
        OpTag::new(value)
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-node operand carried inline by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Ints(Vec<i64>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(value) => write!(f, "{value}"),
            Literal::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            Literal::Bool(value) => write!(f, "{value}"),
            Literal::Ints(values) => {
                f.write_str("[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Single operation argument: either another node of the same graph or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Node(NodeId),
    Literal(Literal),
}

impl Arg {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Arg::Node(id) => Some(*id),
            Arg::Literal(_) => None,
        }
    }
}

impl From<NodeId> for Arg {
    fn from(value: NodeId) -> Self {
        Arg::Node(value)
    }
}

impl From<Literal> for Arg {
    fn from(value: Literal) -> Self {
        Arg::Literal(value)
    }
}

pub type Args = SmallVec<[Arg; 4]>;

/// Scalar element types understood by the size metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(DType::Bool),
            "i32" => Some(DType::I32),
            "i64" => Some(DType::I64),
            "f16" => Some(DType::F16),
            "f32" => Some(DType::F32),
            "f64" => Some(DType::F64),
            _ => None,
        }
    }
}

/// Static size information attached to a node by the tracer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorMeta {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().map(|&dim| dim as u64).product()
    }

    pub fn nbytes(&self) -> u64 {
        self.numel() * self.dtype.size_in_bytes() as u64
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype.as_str())?;
        for (idx, dim) in self.shape.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// Values returned by a graph. A single value is never wrapped in a one-element tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphOutput {
    Single(NodeId),
    Tuple(Vec<NodeId>),
}

impl GraphOutput {
    /// Builds an output from an ordered value list, unwrapping exactly-one lists.
    pub fn from_values(mut values: Vec<NodeId>) -> Self {
        if values.len() == 1 {
            GraphOutput::Single(values.remove(0))
        } else {
            GraphOutput::Tuple(values)
        }
    }

    pub fn values(&self) -> &[NodeId] {
        match self {
            GraphOutput::Single(value) => std::slice::from_ref(value),
            GraphOutput::Tuple(values) => values,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

/// Role-specific payload of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Input(InputRole),
    Operation { op: OpTag, args: Args },
    Output(GraphOutput),
}

/// A single graph node. Nodes are immutable once their graph is finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TensorMeta>,
}

impl Node {
    pub fn input_role(&self) -> Option<InputRole> {
        match self.kind {
            NodeKind::Input(role) => Some(role),
            _ => None,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input(_))
    }

    pub fn is_primal(&self) -> bool {
        self.input_role() == Some(InputRole::Primal)
    }

    pub fn is_tangent(&self) -> bool {
        self.input_role() == Some(InputRole::Tangent)
    }

    pub fn is_output(&self) -> bool {
        matches!(self.kind, NodeKind::Output(_))
    }

    pub fn op(&self) -> Option<&OpTag> {
        match &self.kind {
            NodeKind::Operation { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Node arguments in order; literals are skipped. Output nodes report their values.
    pub fn node_args(&self) -> impl Iterator<Item = NodeId> + '_ {
        let (args, outputs): (&[Arg], &[NodeId]) = match &self.kind {
            NodeKind::Input(_) => (&[], &[]),
            NodeKind::Operation { args, .. } => (args.as_slice(), &[]),
            NodeKind::Output(output) => (&[], output.values()),
        };
        args.iter()
            .filter_map(Arg::as_node)
            .chain(outputs.iter().copied())
    }
}
