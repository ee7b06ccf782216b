//! Recording user functions into joint forward/backward graphs.
//!
//! A traced function receives a [`TraceContext`] and symbolic arguments. Every operation it
//! applies appends a node with inferred metadata. [`TraceContext::grad`] then records the
//! reverse-mode derivative into the same graph, which is how [`RefTracer`] produces joint
//! graphs for the dispatch layer.

use std::collections::HashMap;

use anyhow::{bail, ensure, Result};
use aotgrad::graph::{
    Arg, Args, DType, GraphBuilder, GraphOutput, InputRole, Literal, NodeId, NodeKind, TensorMeta,
};
use aotgrad::{
    CallArgs, Graph, JointGraph, JointRequest, JointTracer, TensorValue, TracedJoint, Tree,
};

use crate::ops;
use crate::tensor::HostTensor;

/// Handle to a value recorded in a [`TraceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sym(NodeId);

impl Sym {
    pub fn id(self) -> NodeId {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct TraceContext {
    builder: GraphBuilder,
    requires_grad: Vec<bool>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primal(&mut self, name: &str, meta: TensorMeta, requires_grad: bool) -> Sym {
        self.input(name, InputRole::Primal, meta, requires_grad)
    }

    pub fn tangent(&mut self, name: &str, meta: TensorMeta) -> Sym {
        self.input(name, InputRole::Tangent, meta, false)
    }

    fn input(&mut self, name: &str, role: InputRole, meta: TensorMeta, requires_grad: bool) -> Sym {
        let name = self.builder.unique_name(name);
        let id = self.builder.input(name, role, Some(meta));
        self.requires_grad.push(requires_grad);
        Sym(id)
    }

    pub fn meta(&self, value: Sym) -> TensorMeta {
        self.builder
            .node(value.0)
            .meta
            .clone()
            .unwrap_or_else(|| TensorMeta::new(DType::F32, Vec::new()))
    }

    pub fn shape(&self, value: Sym) -> &[usize] {
        self.builder
            .node(value.0)
            .meta
            .as_ref()
            .map(|meta| meta.shape.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `value` depends on a primal that requires grad.
    pub fn requires_grad(&self, value: Sym) -> bool {
        self.requires_grad[value.0.index()]
    }

    /// Records `op` applied to `inputs` followed by `literals`.
    pub fn apply(&mut self, op: &str, inputs: &[Sym], literals: Vec<Literal>) -> Result<Sym> {
        let shapes: Vec<Vec<usize>> = inputs.iter().map(|&x| self.shape(x).to_vec()).collect();
        let shape_refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
        let shape = ops::infer_shape(op, &shape_refs, &literals)?;

        let mut args: Args = inputs.iter().map(|x| Arg::Node(x.0)).collect();
        args.extend(literals.into_iter().map(Arg::Literal));
        let name = self.builder.unique_name(op);
        let id = self
            .builder
            .op(name, op, args, Some(TensorMeta::new(DType::F32, shape)));
        let requires_grad = inputs.iter().any(|&x| self.requires_grad(x));
        self.requires_grad.push(requires_grad);
        Ok(Sym(id))
    }

    pub fn add(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.apply("add", &[a, b], Vec::new())
    }

    pub fn sub(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.apply("sub", &[a, b], Vec::new())
    }

    pub fn mul(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.apply("mul", &[a, b], Vec::new())
    }

    pub fn div(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.apply("div", &[a, b], Vec::new())
    }

    pub fn neg(&mut self, x: Sym) -> Result<Sym> {
        self.apply("neg", &[x], Vec::new())
    }

    pub fn relu(&mut self, x: Sym) -> Result<Sym> {
        self.apply("relu", &[x], Vec::new())
    }

    pub fn exp(&mut self, x: Sym) -> Result<Sym> {
        self.apply("exp", &[x], Vec::new())
    }

    pub fn log(&mut self, x: Sym) -> Result<Sym> {
        self.apply("log", &[x], Vec::new())
    }

    pub fn sin(&mut self, x: Sym) -> Result<Sym> {
        self.apply("sin", &[x], Vec::new())
    }

    pub fn cos(&mut self, x: Sym) -> Result<Sym> {
        self.apply("cos", &[x], Vec::new())
    }

    pub fn tanh(&mut self, x: Sym) -> Result<Sym> {
        self.apply("tanh", &[x], Vec::new())
    }

    pub fn sigmoid(&mut self, x: Sym) -> Result<Sym> {
        self.apply("sigmoid", &[x], Vec::new())
    }

    /// Sum of every element, as a rank-0 value.
    pub fn sum(&mut self, x: Sym) -> Result<Sym> {
        self.apply("sum", &[x], Vec::new())
    }

    pub fn expand(&mut self, x: Sym, shape: &[usize]) -> Result<Sym> {
        self.apply("expand", &[x], vec![shape_literal(shape)])
    }

    pub fn sum_to_size(&mut self, x: Sym, shape: &[usize]) -> Result<Sym> {
        self.apply("sum_to_size", &[x], vec![shape_literal(shape)])
    }

    pub fn matmul(&mut self, a: Sym, b: Sym) -> Result<Sym> {
        self.apply("matmul", &[a, b], Vec::new())
    }

    pub fn transpose(&mut self, x: Sym) -> Result<Sym> {
        self.apply("transpose", &[x], Vec::new())
    }

    pub fn zeros_like(&mut self, x: Sym) -> Result<Sym> {
        self.apply("zeros_like", &[x], Vec::new())
    }

    pub fn ones_like(&mut self, x: Sym) -> Result<Sym> {
        self.apply("ones_like", &[x], Vec::new())
    }

    pub fn clone_value(&mut self, x: Sym) -> Result<Sym> {
        self.apply("clone", &[x], Vec::new())
    }

    /// Records the reverse-mode derivative of `outputs`, seeded with `seeds`, with respect to
    /// `wrt`.
    ///
    /// Gradients only flow into values that require grad. A `wrt` entry that no output
    /// depends on yields `None` when `allow_unused` is set and an error otherwise.
    pub fn grad(
        &mut self,
        outputs: &[Sym],
        wrt: &[Sym],
        seeds: &[Sym],
        allow_unused: bool,
    ) -> Result<Vec<Option<Sym>>> {
        ensure!(
            outputs.len() == seeds.len(),
            "{} output(s) but {} seed(s)",
            outputs.len(),
            seeds.len()
        );
        let mut adjoints: HashMap<NodeId, Sym> = HashMap::new();
        for (&output, &seed) in outputs.iter().zip(seeds) {
            ensure!(
                self.shape(output) == self.shape(seed),
                "seed shape {:?} does not match output shape {:?}",
                self.shape(seed),
                self.shape(output)
            );
            if self.requires_grad(output) {
                self.accumulate(&mut adjoints, output, seed)?;
            }
        }

        let last = outputs.iter().map(|x| x.0.index()).max().unwrap_or(0);
        for index in (0..=last).rev() {
            let id = NodeId(index as u32);
            let Some(&upstream) = adjoints.get(&id) else {
                continue;
            };
            let (op, args) = match &self.builder.node(id).kind {
                NodeKind::Operation { op, args } => (op.clone(), args.clone()),
                NodeKind::Input(_) | NodeKind::Output(_) => continue,
            };
            let inputs: Vec<Sym> = args.iter().filter_map(Arg::as_node).map(Sym).collect();
            let contributions = self.vjp(op.as_str(), &inputs, Sym(id), upstream)?;
            for (input, contribution) in inputs.into_iter().zip(contributions) {
                if let Some(contribution) = contribution {
                    if self.requires_grad(input) {
                        self.accumulate(&mut adjoints, input, contribution)?;
                    }
                }
            }
        }

        wrt.iter()
            .map(|x| match adjoints.get(&x.0) {
                Some(&grad) => Ok(Some(grad)),
                None if allow_unused => Ok(None),
                None => bail!(
                    "`{}` is not used by any differentiated output",
                    self.builder.node(x.0).name
                ),
            })
            .collect()
    }

    fn accumulate(&mut self, adjoints: &mut HashMap<NodeId, Sym>, at: Sym, grad: Sym) -> Result<()> {
        let total = match adjoints.get(&at.0) {
            Some(&previous) => self.add(previous, grad)?,
            None => grad,
        };
        adjoints.insert(at.0, total);
        Ok(())
    }

    /// Input cotangents of one operation, one slot per tensor operand.
    fn vjp(&mut self, op: &str, inputs: &[Sym], y: Sym, g: Sym) -> Result<Vec<Option<Sym>>> {
        let needs: Vec<bool> = inputs.iter().map(|&x| self.requires_grad(x)).collect();
        let grads = match op {
            "add" => vec![Some(g), Some(g)],
            "sub" => {
                let rhs = if needs[1] { Some(self.neg(g)?) } else { None };
                vec![Some(g), rhs]
            }
            "mul" => {
                let (a, b) = (inputs[0], inputs[1]);
                let lhs = if needs[0] { Some(self.mul(g, b)?) } else { None };
                let rhs = if needs[1] { Some(self.mul(g, a)?) } else { None };
                vec![lhs, rhs]
            }
            "div" => {
                let b = inputs[1];
                let lhs = if needs[0] { Some(self.div(g, b)?) } else { None };
                let rhs = if needs[1] {
                    let gy = self.mul(g, y)?;
                    let quotient = self.div(gy, b)?;
                    Some(self.neg(quotient)?)
                } else {
                    None
                };
                vec![lhs, rhs]
            }
            "neg" => vec![Some(self.neg(g)?)],
            "relu" => vec![Some(self.apply("relu_backward", &[g, inputs[0]], Vec::new())?)],
            "exp" => vec![Some(self.mul(g, y)?)],
            "log" => vec![Some(self.div(g, inputs[0])?)],
            "sin" => {
                let cos = self.cos(inputs[0])?;
                vec![Some(self.mul(g, cos)?)]
            }
            "cos" => {
                let sin = self.sin(inputs[0])?;
                let scaled = self.mul(g, sin)?;
                vec![Some(self.neg(scaled)?)]
            }
            "tanh" => vec![Some(self.apply("tanh_backward", &[g, y], Vec::new())?)],
            "sigmoid" => vec![Some(self.apply("sigmoid_backward", &[g, y], Vec::new())?)],
            "sum" | "sum_to_size" => {
                let shape = self.shape(inputs[0]).to_vec();
                vec![Some(self.expand(g, &shape)?)]
            }
            "expand" => {
                let shape = self.shape(inputs[0]).to_vec();
                vec![Some(self.sum_to_size(g, &shape)?)]
            }
            "matmul" => {
                let (a, b) = (inputs[0], inputs[1]);
                let lhs = if needs[0] {
                    let bt = self.transpose(b)?;
                    Some(self.matmul(g, bt)?)
                } else {
                    None
                };
                let rhs = if needs[1] {
                    let at = self.transpose(a)?;
                    Some(self.matmul(at, g)?)
                } else {
                    None
                };
                vec![lhs, rhs]
            }
            "transpose" => vec![Some(self.transpose(g)?)],
            "clone" => vec![Some(g)],
            "zeros_like" | "ones_like" => vec![None],
            other => bail!("no derivative rule for `{other}`"),
        };
        Ok(grads)
    }

    /// Closes the recording with `outputs` as the graph result.
    pub fn finish(self, outputs: &[Sym]) -> Result<Graph> {
        let ids = outputs.iter().map(|x| x.0).collect();
        Ok(self.builder.finish(GraphOutput::from_values(ids))?)
    }
}

fn shape_literal(shape: &[usize]) -> Literal {
    Literal::Ints(shape.iter().map(|&dim| dim as i64).collect())
}

/// Tracer for functions written against [`TraceContext`].
///
/// Primal inputs are named `primal_<i>` and tangents `tangent_<i>`. Outputs that do not
/// depend on a differentiable input receive no seed, and inputs the outputs do not depend on
/// get an explicit zero gradient.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefTracer;

impl<F> JointTracer<F, HostTensor> for RefTracer
where
    F: Fn(&mut TraceContext, CallArgs<Sym>) -> Result<Tree<Sym>> + ?Sized,
{
    fn trace_joint(&self, func: &F, request: &JointRequest<'_, HostTensor>) -> Result<TracedJoint> {
        let mut ctx = TraceContext::new();
        let primals: Vec<Sym> = request
            .leaves
            .iter()
            .enumerate()
            .map(|(i, leaf)| ctx.primal(&format!("primal_{i}"), leaf.meta(), leaf.requires_grad()))
            .collect();
        let args = CallArgs::unflatten(request.args_spec, primals.clone())?;

        let (outputs, output_spec) = func(&mut ctx, args)?.flatten();
        if outputs.is_empty() {
            bail!("traced function returned no values");
        }
        let tangents: Vec<Sym> = outputs
            .iter()
            .enumerate()
            .map(|(i, &out)| {
                let meta = ctx.meta(out);
                ctx.tangent(&format!("tangent_{i}"), meta)
            })
            .collect();

        let (seeded, seeds): (Vec<Sym>, Vec<Sym>) = outputs
            .iter()
            .zip(&tangents)
            .filter(|(out, _)| ctx.requires_grad(**out))
            .map(|(&out, &tangent)| (out, tangent))
            .unzip();
        let wrt: Vec<Sym> = primals
            .iter()
            .zip(request.leaves)
            .filter(|(_, leaf)| leaf.requires_grad())
            .map(|(&primal, _)| primal)
            .collect();
        let grads = ctx.grad(&seeded, &wrt, &seeds, true)?;

        let mut joint_outputs = outputs.clone();
        for (&input, grad) in wrt.iter().zip(grads) {
            let grad = match grad {
                Some(grad) => grad,
                None => ctx.zeros_like(input)?,
            };
            joint_outputs.push(grad);
        }

        let graph = ctx.finish(&joint_outputs)?;
        log::debug!(
            "traced joint graph: {} node(s), {} forward output(s), {} gradient(s)",
            graph.len(),
            outputs.len(),
            wrt.len()
        );
        Ok(TracedJoint {
            joint: JointGraph::new(graph, outputs.len())?,
            output_spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::evaluate;

    fn meta(shape: &[usize]) -> TensorMeta {
        TensorMeta::new(DType::F32, shape.to_vec())
    }

    #[test]
    fn records_inferred_shapes() -> Result<()> {
        let mut ctx = TraceContext::new();
        let x = ctx.primal("x", meta(&[2, 3]), true);
        let w = ctx.primal("w", meta(&[3, 4]), false);
        let y = ctx.matmul(x, w)?;
        assert_eq!(ctx.shape(y), &[2, 4]);
        assert!(ctx.requires_grad(y));
        let s = ctx.sum(y)?;
        assert!(ctx.shape(s).is_empty());
        assert!(ctx.add(x, w).is_err());
        Ok(())
    }

    #[test]
    fn product_rule_accumulates() -> Result<()> {
        let mut ctx = TraceContext::new();
        let x = ctx.primal("x", meta(&[2]), true);
        let y = ctx.mul(x, x)?;
        let seed = ctx.tangent("seed", meta(&[2]));
        let grads = ctx.grad(&[y], &[x], &[seed], false)?;
        let gx = grads[0].expect("gradient of x");
        let graph = ctx.finish(&[y, gx])?;

        let x = HostTensor::new(vec![2], vec![3.0, -1.0])?;
        let seed = HostTensor::full(vec![2], 1.0);
        let outputs = evaluate(&graph, &[x, seed])?;
        assert_eq!(outputs[0].data(), &[9.0, 1.0]);
        assert_eq!(outputs[1].data(), &[6.0, -2.0]);
        Ok(())
    }

    #[test]
    fn unused_inputs_follow_allow_unused() -> Result<()> {
        let mut ctx = TraceContext::new();
        let x = ctx.primal("x", meta(&[]), true);
        let z = ctx.primal("z", meta(&[]), true);
        let y = ctx.exp(x)?;
        let seed = ctx.tangent("seed", meta(&[]));
        assert!(ctx.grad(&[y], &[x, z], &[seed], false).is_err());
        let grads = ctx.grad(&[y], &[x, z], &[seed], true)?;
        assert!(grads[0].is_some());
        assert!(grads[1].is_none());
        Ok(())
    }
}
