#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use aotgrad::graph::text::parse_graph;
use aotgrad::graph::{Arg, DType, NodeKind};
use aotgrad::{
    Executable, Graph, GraphCompiler, JointGraph, JointRequest, JointTracer, TensorValue,
    TracedJoint, TreeSpec,
};

/// Rank-0 f64 value, enough to drive the dispatch layer without a tensor runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    pub value: f64,
    pub requires_grad: bool,
}

impl Scalar {
    pub fn grad(value: f64) -> Self {
        Self {
            value,
            requires_grad: true,
        }
    }

    pub fn constant(value: f64) -> Self {
        Self {
            value,
            requires_grad: false,
        }
    }
}

impl TensorValue for Scalar {
    fn dtype(&self) -> DType {
        DType::F64
    }

    fn shape(&self) -> &[usize] {
        &[]
    }

    fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// Interprets a graph of scalar pointwise operations.
pub fn evaluate(graph: &Graph, inputs: &[f64]) -> Result<Vec<f64>> {
    let mut env: Vec<f64> = Vec::with_capacity(graph.len());
    let mut next_input = 0usize;
    for node in graph.nodes() {
        let value = match &node.kind {
            NodeKind::Input(_) => {
                let value = *inputs
                    .get(next_input)
                    .ok_or_else(|| anyhow!("missing value for input `{}`", node.name))?;
                next_input += 1;
                value
            }
            NodeKind::Operation { op, args } => {
                let operands: Vec<f64> = args
                    .iter()
                    .filter_map(Arg::as_node)
                    .map(|id| env[id.index()])
                    .collect();
                match (op.as_str(), operands.as_slice()) {
                    ("add", [a, b]) => a + b,
                    ("sub", [a, b]) => a - b,
                    ("mul", [a, b]) => a * b,
                    ("neg", [a]) => -a,
                    ("exp", [a]) => a.exp(),
                    ("sin", [a]) => a.sin(),
                    ("cos", [a]) => a.cos(),
                    ("relu", [a]) => a.max(0.0),
                    ("zeros_like", [_]) => 0.0,
                    ("ones_like", [_]) => 1.0,
                    (other, operands) => {
                        bail!("no scalar kernel for `{other}` with {} operand(s)", operands.len())
                    }
                }
            }
            NodeKind::Output(_) => f64::NAN,
        };
        env.push(value);
    }
    if next_input != inputs.len() {
        bail!("graph takes {next_input} input(s), got {}", inputs.len());
    }
    Ok(graph
        .output_values()
        .iter()
        .map(|id| env[id.index()])
        .collect())
}

struct ScalarProgram {
    graph: Graph,
}

impl Executable<Scalar> for ScalarProgram {
    fn run(&self, args: &[Scalar]) -> Result<Vec<Scalar>> {
        let inputs: Vec<f64> = args.iter().map(|arg| arg.value).collect();
        Ok(evaluate(&self.graph, &inputs)?
            .into_iter()
            .map(Scalar::constant)
            .collect())
    }
}

/// Compiler that wraps the scalar interpreter and counts its invocations.
#[derive(Default)]
pub struct CountingCompiler {
    pub compiles: AtomicUsize,
}

impl CountingCompiler {
    pub fn count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl GraphCompiler<Scalar> for CountingCompiler {
    fn name(&self) -> &str {
        "scalar-interpreter"
    }

    fn compile(&self, graph: &Graph, example_args: &[Scalar]) -> Result<Box<dyn Executable<Scalar>>> {
        if example_args.len() != graph.num_inputs() {
            bail!(
                "graph takes {} input(s), {} example argument(s) given",
                graph.num_inputs(),
                example_args.len()
            );
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScalarProgram {
            graph: graph.clone(),
        }))
    }
}

/// Compiler that always fails.
pub struct FailingCompiler;

impl GraphCompiler<Scalar> for FailingCompiler {
    fn compile(&self, _graph: &Graph, _example_args: &[Scalar]) -> Result<Box<dyn Executable<Scalar>>> {
        bail!("backend refused the graph")
    }
}

/// Tracer that returns a fixed joint graph regardless of the function.
pub struct FixedTracer {
    pub joint: JointGraph,
    pub output_spec: TreeSpec,
    pub traces: AtomicUsize,
}

impl FixedTracer {
    pub fn new(src: &str, num_fwd_outputs: usize, output_spec: TreeSpec) -> Arc<Self> {
        let graph = parse_graph(src).expect("fixture parses");
        Arc::new(Self {
            joint: JointGraph::new(graph, num_fwd_outputs).expect("fixture splits"),
            output_spec,
            traces: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.traces.load(Ordering::SeqCst)
    }
}

impl JointTracer<(), Scalar> for FixedTracer {
    fn trace_joint(&self, _func: &(), _request: &JointRequest<'_, Scalar>) -> Result<TracedJoint> {
        self.traces.fetch_add(1, Ordering::SeqCst);
        Ok(TracedJoint {
            joint: self.joint.clone(),
            output_spec: self.output_spec.clone(),
        })
    }
}

/// Tracer that picks one of several joint graphs by the call's `requires_grad` mask.
pub struct GradMaskTracer {
    pub variants: Vec<(Vec<bool>, JointGraph)>,
    pub traces: AtomicUsize,
}

impl GradMaskTracer {
    pub fn new(variants: &[(&[bool], &str)]) -> Arc<Self> {
        Arc::new(Self {
            variants: variants
                .iter()
                .map(|(mask, src)| (mask.to_vec(), joint(src, 1)))
                .collect(),
            traces: AtomicUsize::new(0),
        })
    }

    pub fn count(&self) -> usize {
        self.traces.load(Ordering::SeqCst)
    }
}

impl JointTracer<(), Scalar> for GradMaskTracer {
    fn trace_joint(&self, _func: &(), request: &JointRequest<'_, Scalar>) -> Result<TracedJoint> {
        self.traces.fetch_add(1, Ordering::SeqCst);
        let mask = request.needs_input_grad();
        let (_, joint) = self
            .variants
            .iter()
            .find(|(variant, _)| *variant == mask)
            .ok_or_else(|| anyhow!("no joint graph for grad mask {mask:?}"))?;
        Ok(TracedJoint {
            joint: joint.clone(),
            output_spec: TreeSpec::Leaf,
        })
    }
}

pub fn joint(src: &str, num_fwd_outputs: usize) -> JointGraph {
    JointGraph::new(parse_graph(src).expect("fixture parses"), num_fwd_outputs)
        .expect("fixture splits")
}
