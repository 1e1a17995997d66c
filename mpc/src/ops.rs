//! Tensor operations shared by plaintext values, ring shares and shape inference.
//!
//! Every kernel validates its operands with the same shape rule that [`infer_shape`]
//! exposes, so an operation on shares and the inferred shape of its result cannot disagree.

use std::fmt;

use ndarray::{arr0, ArrayD, ArrayView, Array4, Axis, Dimension, Ix1, Ix2, Ix4, LinalgScalar};
use serde::{Deserialize, Serialize};

use crate::error::ShapeError;

/// Parameters of a 2D convolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
            groups: 1,
        }
    }
}

/// Binary tensor operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Matmul,
    Conv2d(Conv2dParams),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Matmul => "matmul",
            Op::Conv2d(_) => "conv2d",
        }
    }

    /// Whether the result of this operation carries the fixed-point scale twice.
    pub fn is_multiplicative(&self) -> bool {
        matches!(self, Op::Mul | Op::Matmul | Op::Conv2d(_))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of `op(a, b)`. Fails if either shape is unset or the shapes are incompatible.
pub fn infer_shape(
    op: &Op,
    lhs: Option<&[usize]>,
    rhs: Option<&[usize]>,
) -> Result<Vec<usize>, ShapeError> {
    let (lhs, rhs) = match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        _ => {
            return Err(ShapeError::Unset {
                op: op.name().to_string(),
            })
        }
    };
    match op {
        Op::Add | Op::Sub | Op::Mul => broadcast_shape(op, lhs, rhs),
        Op::Matmul => matmul_shape(lhs, rhs),
        Op::Conv2d(params) => conv2d_shape(lhs, rhs, params),
    }
}

/// Shape resulting from broadcasting two shapes against each other.
pub fn broadcast_shape(op: &Op, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let ndim = lhs.len().max(rhs.len());
    let dim = |shape: &[usize], i: usize| {
        (i + shape.len())
            .checked_sub(ndim)
            .map(|j| shape[j])
            .unwrap_or(1)
    };
    (0..ndim)
        .map(|i| match (dim(lhs, i), dim(rhs, i)) {
            (a, b) if a == b => Ok(a),
            (1, b) => Ok(b),
            (a, 1) => Ok(a),
            _ => Err(incompatible(op, lhs, rhs)),
        })
        .collect()
}

fn matmul_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let result = match (lhs, rhs) {
        ([n], [m]) if n == m => vec![],
        ([n], [m, k]) if n == m => vec![*k],
        ([r, n], [m]) if n == m => vec![*r],
        ([r, n], [m, k]) if n == m => vec![*r, *k],
        ([_] | [_, _], [_] | [_, _]) => return Err(incompatible(&Op::Matmul, lhs, rhs)),
        ([_] | [_, _], _) => return Err(unsupported(&Op::Matmul, rhs)),
        _ => return Err(unsupported(&Op::Matmul, lhs)),
    };
    Ok(result)
}

fn conv2d_shape(
    input: &[usize],
    weight: &[usize],
    params: &Conv2dParams,
) -> Result<Vec<usize>, ShapeError> {
    let op = Op::Conv2d(*params);
    let (batch, channels, height, width) = match *input {
        [n, c, h, w] => (Some(n), c, h, w),
        [c, h, w] => (None, c, h, w),
        _ => return Err(unsupported(&op, input)),
    };
    let [out_channels, group_channels, kernel_h, kernel_w] = match *weight {
        [o, g, kh, kw] => [o, g, kh, kw],
        _ => return Err(unsupported(&op, weight)),
    };

    let Conv2dParams {
        stride,
        padding,
        dilation,
        groups,
    } = *params;
    if stride == 0 || dilation == 0 || groups == 0 {
        return Err(incompatible(&op, input, weight));
    }
    if channels != group_channels * groups || out_channels % groups != 0 {
        return Err(incompatible(&op, input, weight));
    }

    let out_dim = |size: usize, kernel: usize| {
        let span = dilation * (kernel.max(1) - 1) + 1;
        (size + 2 * padding)
            .checked_sub(span)
            .map(|free| free / stride + 1)
    };
    let (out_h, out_w) = match (out_dim(height, kernel_h), out_dim(width, kernel_w)) {
        (Some(h), Some(w)) if kernel_h > 0 && kernel_w > 0 => (h, w),
        _ => return Err(incompatible(&op, input, weight)),
    };

    Ok(batch
        .into_iter()
        .chain([out_channels, out_h, out_w])
        .collect())
}

fn incompatible(op: &Op, lhs: &[usize], rhs: &[usize]) -> ShapeError {
    ShapeError::Incompatible {
        op: op.name().to_string(),
        lhs: lhs.to_vec(),
        rhs: rhs.to_vec(),
    }
}

fn unsupported(op: &Op, shape: &[usize]) -> ShapeError {
    ShapeError::Unsupported {
        op: op.name().to_string(),
        shape: shape.to_vec(),
    }
}

/// Apply binary operation to two tensors.
pub fn apply<A: LinalgScalar>(
    op: &Op,
    lhs: &ArrayD<A>,
    rhs: &ArrayD<A>,
) -> Result<ArrayD<A>, ShapeError> {
    match op {
        Op::Add | Op::Sub | Op::Mul => {
            broadcast_shape(op, lhs.shape(), rhs.shape())?;
            Ok(match op {
                Op::Add => lhs + rhs,
                Op::Sub => lhs - rhs,
                _ => lhs * rhs,
            })
        }
        Op::Matmul => matmul(lhs, rhs),
        Op::Conv2d(params) => conv2d(lhs, rhs, params),
    }
}

fn fixed_view<'a, A, D: Dimension>(
    op: &Op,
    array: &'a ArrayD<A>,
) -> Result<ArrayView<'a, A, D>, ShapeError> {
    array
        .view()
        .into_dimensionality::<D>()
        .map_err(|_| unsupported(op, array.shape()))
}

/// Matrix product of 1D or 2D tensors.
pub fn matmul<A: LinalgScalar>(lhs: &ArrayD<A>, rhs: &ArrayD<A>) -> Result<ArrayD<A>, ShapeError> {
    let op = Op::Matmul;
    matmul_shape(lhs.shape(), rhs.shape())?;
    let result = match (lhs.ndim(), rhs.ndim()) {
        (1, 1) => {
            let dot = fixed_view::<_, Ix1>(&op, lhs)?.dot(&fixed_view::<_, Ix1>(&op, rhs)?);
            arr0(dot).into_dyn()
        }
        (1, _) => fixed_view::<_, Ix1>(&op, lhs)?
            .dot(&fixed_view::<_, Ix2>(&op, rhs)?)
            .into_dyn(),
        (_, 1) => fixed_view::<_, Ix2>(&op, lhs)?
            .dot(&fixed_view::<_, Ix1>(&op, rhs)?)
            .into_dyn(),
        _ => fixed_view::<_, Ix2>(&op, lhs)?
            .dot(&fixed_view::<_, Ix2>(&op, rhs)?)
            .into_dyn(),
    };
    Ok(result)
}

/// 2D convolution (cross-correlation) of `(N, C, H, W)` or `(C, H, W)` input
/// with `(O, C / groups, kH, kW)` weight.
pub fn conv2d<A: LinalgScalar>(
    input: &ArrayD<A>,
    weight: &ArrayD<A>,
    params: &Conv2dParams,
) -> Result<ArrayD<A>, ShapeError> {
    let op = Op::Conv2d(*params);
    let out_shape = conv2d_shape(input.shape(), weight.shape(), params)?;
    let batched = input.ndim() == 4;

    let input = if batched {
        input.view()
    } else {
        input.view().insert_axis(Axis(0))
    };
    let input = input
        .into_dimensionality::<Ix4>()
        .map_err(|_| unsupported(&op, &out_shape))?;
    let weight = fixed_view::<_, Ix4>(&op, weight)?;

    let (batch, _, height, width) = input.dim();
    let (out_channels, group_channels, kernel_h, kernel_w) = weight.dim();
    let out_per_group = out_channels / params.groups;
    let out_h = out_shape[out_shape.len() - 2];
    let out_w = out_shape[out_shape.len() - 1];

    let mut output = Array4::<A>::zeros((batch, out_channels, out_h, out_w));
    for ((n, oc, oy, ox), out) in output.indexed_iter_mut() {
        let first_channel = (oc / out_per_group) * group_channels;
        for ic in 0..group_channels {
            for ky in 0..kernel_h {
                for kx in 0..kernel_w {
                    let y = (oy * params.stride + ky * params.dilation).checked_sub(params.padding);
                    let x = (ox * params.stride + kx * params.dilation).checked_sub(params.padding);
                    if let (Some(y), Some(x)) = (y, x) {
                        if y < height && x < width {
                            *out = *out
                                + input[[n, first_channel + ic, y, x]] * weight[[oc, ic, ky, kx]];
                        }
                    }
                }
            }
        }
    }

    let output = output.into_dyn();
    Ok(if batched {
        output
    } else {
        output.index_axis_move(Axis(0), 0)
    })
}
