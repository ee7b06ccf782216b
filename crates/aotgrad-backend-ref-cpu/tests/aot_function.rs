use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use aotgrad::{
    AotFunction, AotOptions, CallArgs, Compilers, PartitionerKind, TensorValue, Tree, UnitCache,
};
use aotgrad_backend_ref_cpu::{
    aot_function, HostTensor, InterpreterCompiler, RefTracer, Sym, TraceContext,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn options(kind: PartitionerKind) -> AotOptions {
    AotOptions::default().with_partitioner(kind)
}

fn leaf(args: &CallArgs<Sym>, index: usize) -> Result<Sym> {
    args.leaf(index)
        .copied()
        .ok_or_else(|| anyhow!("argument {index} is not a tensor"))
}

/// `sum(tanh(x @ w + b))` with `b` broadcast over the rows.
fn mlp(ctx: &mut TraceContext, args: CallArgs<Sym>) -> Result<Tree<Sym>> {
    let (x, w, b) = (leaf(&args, 0)?, leaf(&args, 1)?, leaf(&args, 2)?);
    let h = ctx.matmul(x, w)?;
    let shape = ctx.shape(h).to_vec();
    let b = ctx.expand(b, &shape)?;
    let z = ctx.add(h, b)?;
    let y = ctx.tanh(z)?;
    Ok(Tree::leaf(ctx.sum(y)?))
}

fn sin_chain(ctx: &mut TraceContext, args: CallArgs<Sym>) -> Result<Tree<Sym>> {
    let mut x = leaf(&args, 0)?;
    for _ in 0..3 {
        x = ctx.sin(x)?;
    }
    Ok(Tree::leaf(ctx.sum(x)?))
}

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> HostTensor {
    let len: usize = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    HostTensor::new(shape.to_vec(), data).expect("valid tensor")
}

fn scalar_result(tree: &Tree<HostTensor>) -> Result<f32> {
    tree.as_leaf()
        .and_then(HostTensor::item)
        .ok_or_else(|| anyhow!("expected a scalar result"))
}

#[test]
fn square_sum_gradient_is_twice_the_input() -> Result<()> {
    let f = aot_function(
        |ctx: &mut TraceContext, args: CallArgs<Sym>| -> Result<Tree<Sym>> {
            let x = leaf(&args, 0)?;
            let sq = ctx.mul(x, x)?;
            Ok(Tree::leaf(ctx.sum(sq)?))
        },
        options(PartitionerKind::Default),
    )?;
    let x = HostTensor::new(vec![3], vec![1.0, -2.0, 0.5])?.requiring_grad();
    let (result, grad_fn) = f.call(CallArgs::positional([x]))?.into_parts();
    assert_eq!(scalar_result(&result)?, 5.25);

    let grads = grad_fn.backward(vec![HostTensor::scalar(1.0)])?;
    let gx = grads[0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?;
    assert_eq!(gx.data(), &[2.0, -4.0, 1.0]);
    Ok(())
}

#[test]
fn gradients_match_finite_differences() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let x = random_tensor(&mut rng, &[2, 3]);
    let w = random_tensor(&mut rng, &[3, 2]).requiring_grad();
    let b = random_tensor(&mut rng, &[1, 2]).requiring_grad();

    for kind in [PartitionerKind::Default, PartitionerKind::MinCut] {
        let f = aot_function(mlp, options(kind))?;
        let out = f.call(CallArgs::positional([x.clone(), w.clone(), b.clone()]))?;
        let grads = out.grad_fn.backward(vec![HostTensor::scalar(1.0)])?;
        assert!(grads[0].is_none(), "x does not require grad");

        for (index, base) in [(1usize, &w), (2usize, &b)] {
            let analytic = grads[index]
                .as_ref()
                .ok_or_else(|| anyhow!("missing gradient for argument {index}"))?;
            for element in 0..base.len() {
                let eps = 1e-2f32;
                let evaluate_at = |delta: f32| -> Result<f32> {
                    let mut data = base.to_vec();
                    data[element] += delta;
                    let bumped = HostTensor::new(base.shape().to_vec(), data)?.requiring_grad();
                    let mut args = vec![x.clone(), w.clone(), b.clone()];
                    args[index] = bumped;
                    scalar_result(&f.call(CallArgs::positional(args))?.result)
                };
                let numeric = (evaluate_at(eps)? - evaluate_at(-eps)?) / (2.0 * eps);
                let exact = analytic.data()[element];
                assert!(
                    (numeric - exact).abs() <= 1e-2,
                    "{kind}: d/d{index}[{element}] numeric {numeric} vs analytic {exact}"
                );
            }
        }
        assert_eq!(f.num_compiled(), 1);
    }
    Ok(())
}

#[test]
fn same_shapes_reuse_the_compiled_unit() -> Result<()> {
    let compiler = Arc::new(InterpreterCompiler::new());
    let f = AotFunction::new(
        mlp,
        Arc::new(RefTracer),
        Compilers::shared(compiler.clone()),
        UnitCache::shared(),
        options(PartitionerKind::Default),
    )?;
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..4 {
        let args = CallArgs::positional([
            random_tensor(&mut rng, &[2, 3]).requiring_grad(),
            random_tensor(&mut rng, &[3, 2]).requiring_grad(),
            random_tensor(&mut rng, &[1, 2]),
        ]);
        f.call(args)?;
    }
    assert_eq!(compiler.compilations(), 2);
    assert_eq!(f.num_compiled(), 1);

    let wider = CallArgs::positional([
        random_tensor(&mut rng, &[4, 3]).requiring_grad(),
        random_tensor(&mut rng, &[3, 2]).requiring_grad(),
        random_tensor(&mut rng, &[1, 2]),
    ]);
    f.call(wider)?;
    assert_eq!(compiler.compilations(), 4);
    assert_eq!(f.num_compiled(), 2);
    Ok(())
}

#[test]
fn a_new_shape_of_the_same_rank_gets_its_own_unit() -> Result<()> {
    let f = aot_function(sin_chain, AotOptions::default())?;
    assert_eq!(f.options().scheme.tag(), "StaticShapeHasher");
    for (len, expected) in [(2usize, 1usize), (3, 2), (2, 2)] {
        let x = HostTensor::full(vec![len], 0.25).requiring_grad();
        let out = f.call(CallArgs::positional([x]))?;
        let grads = out.grad_fn.backward(vec![HostTensor::scalar(1.0)])?;
        let gx = grads[0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?;
        assert_eq!(gx.shape(), &[len]);
        assert_eq!(f.num_compiled(), expected);
    }
    Ok(())
}

#[test]
fn min_cut_saves_the_input_instead_of_intermediates() -> Result<()> {
    let x = HostTensor::new(vec![4], vec![0.1, 0.2, 0.3, 0.4])?.requiring_grad();
    let mut saved = Vec::new();
    let mut grads = Vec::new();
    for kind in [PartitionerKind::Default, PartitionerKind::MinCut] {
        let f = aot_function(sin_chain, options(kind))?;
        let out = f.call(CallArgs::positional([x.clone()]))?;
        saved.push((out.grad_fn.num_saved(), out.grad_fn.saved_nbytes()));
        grads.push(out.grad_fn.backward(vec![HostTensor::scalar(1.0)])?);
    }
    assert_eq!(saved[0], (3, 48));
    assert_eq!(saved[1], (1, 16));

    let default = grads[0][0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?;
    let min_cut = grads[1][0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?;
    assert_eq!(default.max_abs_diff(min_cut), Some(0.0));
    Ok(())
}

#[test]
fn nested_outputs_and_keyword_arguments() -> Result<()> {
    let f = aot_function(
        |ctx: &mut TraceContext, args: CallArgs<Sym>| -> Result<Tree<Sym>> {
            let x = leaf(&args, 0)?;
            let scale = args
                .kwarg_leaf("scale")
                .copied()
                .ok_or_else(|| anyhow!("missing `scale`"))?;
            let y = ctx.mul(x, scale)?;
            let e = ctx.exp(x)?;
            let mut aux = BTreeMap::new();
            aux.insert("exp".to_string(), Tree::leaf(e));
            Ok(Tree::tuple([Tree::leaf(y), Tree::Dict(aux)]))
        },
        options(PartitionerKind::Default),
    )?;

    let x = HostTensor::new(vec![2], vec![0.0, 1.0])?.requiring_grad();
    let scale = HostTensor::new(vec![2], vec![3.0, 3.0])?;
    let out = f.call(CallArgs::new().arg(x).kwarg("scale", scale))?;

    let (y, e) = match &out.result {
        Tree::Tuple(items) => match items.as_slice() {
            [Tree::Leaf(y), Tree::Dict(aux)] => (y.clone(), aux.get("exp").cloned()),
            other => bail!("unexpected result structure {other:?}"),
        },
        other => bail!("unexpected result structure {other:?}"),
    };
    assert_eq!(y.data(), &[0.0, 3.0]);
    assert_eq!(
        e.and_then(Tree::into_leaf).map(|t| t.to_vec()),
        Some(vec![1.0, 1.0f32.exp()])
    );

    let grads = out.grad_fn.backward(vec![
        HostTensor::full(vec![2], 1.0),
        HostTensor::zeros(vec![2]),
    ])?;
    assert_eq!(grads.len(), 2);
    assert_eq!(grads[0].as_ref().map(HostTensor::to_vec), Some(vec![3.0, 3.0]));
    assert!(grads[1].is_none());
    Ok(())
}

#[test]
fn tracing_errors_leave_the_cache_empty() -> Result<()> {
    let f = aot_function(
        |ctx: &mut TraceContext, args: CallArgs<Sym>| -> Result<Tree<Sym>> {
            let x = leaf(&args, 0)?;
            let y = leaf(&args, 1)?;
            Ok(Tree::leaf(ctx.add(x, y)?))
        },
        options(PartitionerKind::Default),
    )?;
    let args = CallArgs::positional([
        HostTensor::zeros(vec![2]).requiring_grad(),
        HostTensor::zeros(vec![3]),
    ]);
    let err = match f.call(args) {
        Ok(_) => panic!("mismatched shapes traced"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("operands have shapes"), "{err:#}");
    assert_eq!(f.num_compiled(), 0);
    Ok(())
}

#[test]
fn each_forward_call_keeps_its_own_context() -> Result<()> {
    let f = aot_function(sin_chain, options(PartitionerKind::Default))?;
    let x = HostTensor::new(vec![2], vec![0.5, -0.5])?.requiring_grad();
    let first = f.call(CallArgs::positional([x.clone()]))?;
    let second = f.call(CallArgs::positional([x]))?;
    let a = first.grad_fn.backward(vec![HostTensor::scalar(1.0)])?;
    let b = second.grad_fn.backward(vec![HostTensor::scalar(2.0)])?;
    let (a, b) = (
        a[0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?,
        b[0].as_ref().ok_or_else(|| anyhow!("missing gradient"))?,
    );
    for (ga, gb) in a.data().iter().zip(b.data()) {
        assert!((2.0 * ga - gb).abs() <= 1e-6);
    }
    assert!(!a.requires_grad());
    Ok(())
}
