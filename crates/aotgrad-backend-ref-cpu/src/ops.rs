//! Reference kernels and the shape rules shared by the tracer and the interpreter.
//!
//! Elementwise operators require identical operand shapes; broadcasting is always spelled
//! out with `expand` and undone with `sum_to_size`.

use anyhow::{bail, Result};
use aotgrad::graph::Literal;
use aotgrad::TensorValue;

use crate::tensor::HostTensor;

const BINARY_OPS: &[&str] = &[
    "add",
    "sub",
    "mul",
    "div",
    "relu_backward",
    "tanh_backward",
    "sigmoid_backward",
];

const UNARY_OPS: &[&str] = &[
    "neg",
    "relu",
    "exp",
    "log",
    "sin",
    "cos",
    "tanh",
    "sigmoid",
    "zeros_like",
    "ones_like",
    "clone",
];

const SHAPE_OPS: &[&str] = &["sum", "expand", "sum_to_size", "matmul", "transpose"];

pub fn is_supported(op: &str) -> bool {
    BINARY_OPS.contains(&op) || UNARY_OPS.contains(&op) || SHAPE_OPS.contains(&op)
}

/// Every operator the reference backend can execute, in no particular order.
pub fn supported_ops() -> impl Iterator<Item = &'static str> {
    BINARY_OPS
        .iter()
        .chain(UNARY_OPS)
        .chain(SHAPE_OPS)
        .copied()
}

/// Result shape of `op` over operands of the given shapes.
pub fn infer_shape(op: &str, shapes: &[&[usize]], literals: &[Literal]) -> Result<Vec<usize>> {
    if BINARY_OPS.contains(&op) {
        expect_operands(op, shapes, 2)?;
        if shapes[0] != shapes[1] {
            bail!(
                "`{op}` operands have shapes {:?} and {:?}",
                shapes[0],
                shapes[1]
            );
        }
        return Ok(shapes[0].to_vec());
    }
    if UNARY_OPS.contains(&op) {
        expect_operands(op, shapes, 1)?;
        return Ok(shapes[0].to_vec());
    }
    match op {
        "sum" => {
            expect_operands(op, shapes, 1)?;
            Ok(Vec::new())
        }
        "expand" => {
            expect_operands(op, shapes, 1)?;
            let target = target_shape(op, literals)?;
            if !broadcastable(shapes[0], &target) {
                bail!("cannot expand {:?} to {:?}", shapes[0], target);
            }
            Ok(target)
        }
        "sum_to_size" => {
            expect_operands(op, shapes, 1)?;
            let target = target_shape(op, literals)?;
            if !broadcastable(&target, shapes[0]) {
                bail!("cannot sum {:?} down to {:?}", shapes[0], target);
            }
            Ok(target)
        }
        "matmul" => {
            expect_operands(op, shapes, 2)?;
            match (shapes[0], shapes[1]) {
                ([m, k], [k2, n]) if k == k2 => Ok(vec![*m, *n]),
                (lhs, rhs) => bail!("matmul expects [m, k] x [k, n], got {lhs:?} x {rhs:?}"),
            }
        }
        "transpose" => {
            expect_operands(op, shapes, 1)?;
            match shapes[0] {
                [rows, cols] => Ok(vec![*cols, *rows]),
                other => bail!("transpose expects a matrix, got shape {other:?}"),
            }
        }
        other => bail!("no reference kernel for `{other}`"),
    }
}

/// Runs one operator. The result never requires grad.
pub fn execute(op: &str, inputs: &[&HostTensor], literals: &[Literal]) -> Result<HostTensor> {
    let shapes: Vec<&[usize]> = inputs.iter().map(|tensor| tensor.shape()).collect();
    let shape = infer_shape(op, &shapes, literals)?;
    let numel: usize = shape.iter().product();

    let data = match op {
        "add" => zip_with(inputs, |a, b| a + b),
        "sub" => zip_with(inputs, |a, b| a - b),
        "mul" => zip_with(inputs, |a, b| a * b),
        "div" => zip_with(inputs, |a, b| a / b),
        "relu_backward" => zip_with(inputs, |grad, x| if x > 0.0 { grad } else { 0.0 }),
        "tanh_backward" => zip_with(inputs, |grad, y| grad * (1.0 - y * y)),
        "sigmoid_backward" => zip_with(inputs, |grad, y| grad * y * (1.0 - y)),
        "neg" => map(inputs, |x| -x),
        "relu" => map(inputs, |x| x.max(0.0)),
        "exp" => map(inputs, f32::exp),
        "log" => map(inputs, f32::ln),
        "sin" => map(inputs, f32::sin),
        "cos" => map(inputs, f32::cos),
        "tanh" => map(inputs, f32::tanh),
        "sigmoid" => map(inputs, |x| 1.0 / (1.0 + (-x).exp())),
        "zeros_like" => vec![0.0; numel],
        "ones_like" => vec![1.0; numel],
        "clone" => inputs[0].to_vec(),
        "sum" => vec![inputs[0].data().iter().sum()],
        "expand" => broadcast(inputs[0].data(), inputs[0].shape(), &shape),
        "sum_to_size" => sum_to_size(inputs[0].data(), inputs[0].shape(), &shape),
        "matmul" => matmul(inputs[0], inputs[1], &shape),
        "transpose" => transpose(inputs[0]),
        other => bail!("no reference kernel for `{other}`"),
    };
    Ok(HostTensor::from_parts(shape, data))
}

fn expect_operands(op: &str, shapes: &[&[usize]], count: usize) -> Result<()> {
    if shapes.len() != count {
        bail!("`{op}` expects {count} tensor operand(s), got {}", shapes.len());
    }
    Ok(())
}

fn target_shape(op: &str, literals: &[Literal]) -> Result<Vec<usize>> {
    match literals {
        [Literal::Ints(dims)] => dims
            .iter()
            .map(|&dim| {
                usize::try_from(dim).map_err(|_| anyhow::anyhow!("`{op}` has negative dimension {dim}"))
            })
            .collect(),
        _ => bail!("`{op}` expects a single shape literal"),
    }
}

/// Whether `from` broadcasts to `to` under trailing-dimension alignment.
fn broadcastable(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(axis, &dim)| dim == 1 || dim == to[offset + axis])
}

fn zip_with(inputs: &[&HostTensor], f: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    inputs[0]
        .data()
        .iter()
        .zip(inputs[1].data())
        .map(|(&a, &b)| f(a, b))
        .collect()
}

fn map(inputs: &[&HostTensor], f: impl Fn(f32) -> f32) -> Vec<f32> {
    inputs[0].data().iter().map(|&x| f(x)).collect()
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

/// Strides of `small` aligned against the rank of `large`; broadcast axes get stride 0.
fn aligned_strides(small: &[usize], large: &[usize]) -> Vec<usize> {
    let offset = large.len() - small.len();
    let mut aligned = vec![1usize; large.len()];
    aligned[offset..].copy_from_slice(small);
    let mut strides = compute_strides(&aligned);
    for (axis, stride) in strides.iter_mut().enumerate() {
        if aligned[axis] == 1 {
            *stride = 0;
        }
    }
    strides
}

fn broadcast(input: &[f32], input_dims: &[usize], out_dims: &[usize]) -> Vec<f32> {
    if input_dims == out_dims {
        return input.to_vec();
    }
    let strides = aligned_strides(input_dims, out_dims);
    let out_len: usize = out_dims.iter().product();
    (0..out_len)
        .map(|idx| {
            let coords = unravel_index(idx, out_dims);
            let offset: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
            input[offset]
        })
        .collect()
}

fn sum_to_size(input: &[f32], input_dims: &[usize], out_dims: &[usize]) -> Vec<f32> {
    if input_dims == out_dims {
        return input.to_vec();
    }
    let strides = aligned_strides(out_dims, input_dims);
    let mut out = vec![0.0f32; out_dims.iter().product()];
    for (idx, &value) in input.iter().enumerate() {
        let coords = unravel_index(idx, input_dims);
        let offset: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
        out[offset] += value;
    }
    out
}

fn matmul(lhs: &HostTensor, rhs: &HostTensor, out_dims: &[usize]) -> Vec<f32> {
    let (m, n) = (out_dims[0], out_dims[1]);
    let k = lhs.shape()[1];
    let (a, b) = (lhs.data(), rhs.data());
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut sum = 0.0f32;
            for inner in 0..k {
                sum += a[row * k + inner] * b[inner * n + col];
            }
            out[row * n + col] = sum;
        }
    }
    out
}

fn transpose(input: &HostTensor) -> Vec<f32> {
    let (rows, cols) = (input.shape()[0], input.shape()[1]);
    let values = input.data();
    let mut out = vec![0.0f32; rows * cols];
    for row in 0..rows {
        for col in 0..cols {
            out[col * rows + row] = values[row * cols + col];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[usize], data: &[f32]) -> HostTensor {
        HostTensor::new(shape.to_vec(), data.to_vec()).expect("valid tensor")
    }

    #[test]
    fn expand_and_sum_to_size_are_adjoint() {
        let row = tensor(&[1, 3], &[1.0, 2.0, 3.0]);
        let target = [Literal::Ints(vec![2, 3])];
        let expanded = execute("expand", &[&row], &target).expect("expand");
        assert_eq!(expanded.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);

        let back = execute("sum_to_size", &[&expanded], &[Literal::Ints(vec![1, 3])])
            .expect("sum_to_size");
        assert_eq!(back.data(), &[2.0, 4.0, 6.0]);

        let scalar = HostTensor::scalar(2.0);
        let filled = execute("expand", &[&scalar], &target).expect("expand scalar");
        assert_eq!(filled.data(), &[2.0; 6]);
        let total = execute("sum_to_size", &[&filled], &[Literal::Ints(vec![])]).expect("sum");
        assert_eq!(total.item(), Some(12.0));
    }

    #[test]
    fn matmul_and_transpose() {
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3, 1], &[1.0, 0.0, -1.0]);
        let product = execute("matmul", &[&a, &b], &[]).expect("matmul");
        assert_eq!(product.shape(), &[2, 1]);
        assert_eq!(product.data(), &[-2.0, -2.0]);

        let at = execute("transpose", &[&a], &[]).expect("transpose");
        assert_eq!(at.shape(), &[3, 2]);
        assert_eq!(at.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn shape_errors_are_reported() {
        assert!(infer_shape("add", &[&[2], &[3]], &[]).is_err());
        assert!(infer_shape("matmul", &[&[2, 3], &[2, 3]], &[]).is_err());
        assert!(infer_shape("expand", &[&[2]], &[Literal::Ints(vec![3])]).is_err());
        assert!(infer_shape("conv2d", &[&[2]], &[]).is_err());
        assert!(supported_ops().all(is_supported));
    }

    #[test]
    fn backward_kernels() {
        let grad = tensor(&[3], &[1.0, 1.0, 2.0]);
        let x = tensor(&[3], &[-1.0, 0.5, 2.0]);
        let relu = execute("relu_backward", &[&grad, &x], &[]).expect("relu_backward");
        assert_eq!(relu.data(), &[0.0, 1.0, 2.0]);

        let y = tensor(&[3], &[0.0, 0.5, 1.0]);
        let sig = execute("sigmoid_backward", &[&grad, &y], &[]).expect("sigmoid_backward");
        assert_eq!(sig.data(), &[0.0, 0.25, 0.0]);
    }
}
