use super::{Forward, RawTensor, Tensor};
use crate::array::{Conv2dParams, DenseArray};
use crate::autograd::{GradContext, grad_fn};
use crate::backend::Backend;
use crate::error::Result;
use crate::shape::{MatMulShape, ReduceMode};
use std::rc::Rc;

/// Differentiable operations and graph controls on [`Tensor`]
///
/// Every op evaluates eagerly and records one gradient function per input.
pub trait TensorOps<B: Backend> {
    // ===== GRAPH CONTROL =====

    /// Current value, recomputed if an upstream value changed
    ///
    /// # Errors
    /// Errors raised while recomputing.
    fn val(&self) -> Result<DenseArray<B>>;
    fn grad(&self) -> Option<DenseArray<B>>;
    /// # Errors
    /// `IncompatibleShape` when the dims change.
    fn set_value(&self, value: DenseArray<B>) -> Result<()>;
    /// # Errors
    /// See [`RawTensor::update`].
    fn update<F>(&self, combiner: F) -> Result<bool>
    where
        F: FnOnce(&DenseArray<B>, &DenseArray<B>) -> Result<DenseArray<B>>;
    /// # Errors
    /// See [`RawTensor::backward_with`].
    fn backward(&self) -> Result<()>;
    /// # Errors
    /// See [`RawTensor::backward_with`].
    fn backward_with(&self, seed: &DenseArray<B>) -> Result<()>;
    fn zero_grad(&self);

    // ===== ELEMENTWISE =====

    /// # Errors
    /// `IncompatibleShape` when the operands do not broadcast.
    fn add(&self, other: &Tensor<B>) -> Result<Tensor<B>>;
    /// # Errors
    /// `IncompatibleShape` when the operands do not broadcast.
    fn sub(&self, other: &Tensor<B>) -> Result<Tensor<B>>;
    /// # Errors
    /// `IncompatibleShape` when the operands do not broadcast.
    fn mul(&self, other: &Tensor<B>) -> Result<Tensor<B>>;
    /// # Errors
    /// `IncompatibleShape` when the operands do not broadcast.
    fn div(&self, other: &Tensor<B>) -> Result<Tensor<B>>;
    fn neg(&self) -> Result<Tensor<B>>;
    fn sqr(&self) -> Result<Tensor<B>>;
    fn sqrt(&self) -> Result<Tensor<B>>;
    fn pow(&self, p: f32) -> Result<Tensor<B>>;
    fn exp(&self) -> Result<Tensor<B>>;
    fn log(&self) -> Result<Tensor<B>>;
    fn sin(&self) -> Result<Tensor<B>>;
    fn cos(&self) -> Result<Tensor<B>>;
    fn tanh(&self) -> Result<Tensor<B>>;
    fn sigmoid(&self) -> Result<Tensor<B>>;
    /// Leaky ReLU (`slope` 0 for plain ReLU)
    fn relu(&self, slope: f32) -> Result<Tensor<B>>;
    fn clip(&self, lo: f32, hi: f32) -> Result<Tensor<B>>;

    // ===== LINEAR ALGEBRA & CONVOLUTION =====

    /// # Errors
    /// `IncompatibleMatMulShape` for mismatched operands.
    fn matmul(&self, other: &Tensor<B>) -> Result<Tensor<B>>;
    /// # Errors
    /// Shape errors from [`DenseArray::conv2d`].
    fn conv2d(&self, filter: &Tensor<B>, params: Conv2dParams) -> Result<Tensor<B>>;
    /// # Errors
    /// Shape errors from [`DenseArray::max_pool2d`].
    fn max_pool2d(&self, ph: usize, pw: usize) -> Result<Tensor<B>>;

    // ===== REDUCTIONS =====

    /// # Errors
    /// `AxisOutOfBounds` / `DuplicateAxis` for bad axes.
    fn sum(&self, axes: &[isize], mode: ReduceMode) -> Result<Tensor<B>>;
    fn sum_all(&self) -> Result<Tensor<B>>;
    fn mean(&self) -> Result<Tensor<B>>;

    // ===== NEURAL NETWORK =====

    fn softmax(&self) -> Result<Tensor<B>>;
    /// Mean negative log-likelihood of `labels` under the softmax of the
    /// last axis; `labels` has one class index per row
    ///
    /// # Errors
    /// `InvalidShape` for a wrong label count, `IndexOutOfBounds` for a class
    /// past the last axis.
    fn softmax_cross_entropy(&self, labels: &[usize]) -> Result<Tensor<B>>;
    /// # Errors
    /// `InvalidParameter` unless `0 < keep_prob <= 1`.
    fn dropout(&self, keep_prob: f32) -> Result<Tensor<B>>;

    // ===== MOVEMENT =====

    /// # Errors
    /// `InvalidShape` when the element count changes.
    fn reshape(&self, dims: &[isize]) -> Result<Tensor<B>>;
    /// # Errors
    /// Axis errors from [`DenseArray::transpose`].
    fn transpose(&self, axes: Option<&[usize]>) -> Result<Tensor<B>>;
}

fn unary<B: Backend>(
    x: &Tensor<B>,
    forward: impl Fn(&DenseArray<B>) -> Result<Forward<B>> + 'static,
    grad: impl Fn(&GradContext<'_, B>) -> Result<DenseArray<B>> + 'static,
) -> Result<Tensor<B>> {
    RawTensor::from_op(
        std::slice::from_ref(x),
        Box::new(move |inputs: &[DenseArray<B>]| forward(&inputs[0])),
        vec![grad_fn(grad)],
    )
}

fn binary<B: Backend>(
    a: &Tensor<B>,
    b: &Tensor<B>,
    forward: impl Fn(&DenseArray<B>, &DenseArray<B>) -> Result<Forward<B>> + 'static,
    grad_a: impl Fn(&GradContext<'_, B>) -> Result<DenseArray<B>> + 'static,
    grad_b: impl Fn(&GradContext<'_, B>) -> Result<DenseArray<B>> + 'static,
) -> Result<Tensor<B>> {
    RawTensor::from_op(
        &[Rc::clone(a), Rc::clone(b)],
        Box::new(move |inputs: &[DenseArray<B>]| forward(&inputs[0], &inputs[1])),
        vec![grad_fn(grad_a), grad_fn(grad_b)],
    )
}

fn as_isize(dims: &[usize]) -> Vec<isize> {
    dims.iter().map(|&d| d as isize).collect()
}

/// Matmul gradient for one operand, in the promoted rank-2+ layout
fn matmul_grad<B: Backend>(g: &GradContext<'_, B>, left: bool) -> Result<DenseArray<B>> {
    let (a, b) = (&g.inputs[0], &g.inputs[1]);
    let mm = MatMulShape::resolve(a.dims(), b.dims())?;
    let mut out = mm.batch.clone();
    out.extend([mm.m, mm.n]);
    let grad = g.grad.reshape(&as_isize(&out))?;
    if left {
        let b2 = b.reshape(&as_isize(&mm.right))?;
        grad.matmul(&b2.swap_last()?)?
            .sum_to(&mm.left)?
            .reshape(&as_isize(a.dims()))
    } else {
        let a2 = a.reshape(&as_isize(&mm.left))?;
        a2.swap_last()?
            .matmul(&grad)?
            .sum_to(&mm.right)?
            .reshape(&as_isize(b.dims()))
    }
}

impl<B: Backend> TensorOps<B> for Tensor<B> {
    fn val(&self) -> Result<DenseArray<B>> {
        RawTensor::val(self)
    }

    fn grad(&self) -> Option<DenseArray<B>> {
        RawTensor::grad(self)
    }

    fn set_value(&self, value: DenseArray<B>) -> Result<()> {
        RawTensor::set_value(self, value)
    }

    fn update<F>(&self, combiner: F) -> Result<bool>
    where
        F: FnOnce(&DenseArray<B>, &DenseArray<B>) -> Result<DenseArray<B>>,
    {
        RawTensor::update(self, combiner)
    }

    fn backward(&self) -> Result<()> {
        RawTensor::backward(self)
    }

    fn backward_with(&self, seed: &DenseArray<B>) -> Result<()> {
        RawTensor::backward_with(self, seed)
    }

    fn zero_grad(&self) {
        RawTensor::zero_grad(self);
    }

    fn add(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        binary(
            self,
            other,
            |a, b| a.add(b).map(Forward::value),
            |g| Ok(g.grad.clone()),
            |g| Ok(g.grad.clone()),
        )
    }

    fn sub(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        binary(
            self,
            other,
            |a, b| a.sub(b).map(Forward::value),
            |g| Ok(g.grad.clone()),
            |g| g.grad.neg(),
        )
    }

    fn mul(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        binary(
            self,
            other,
            |a, b| a.mul(b).map(Forward::value),
            |g| g.grad.mul(&g.inputs[1]),
            |g| g.grad.mul(&g.inputs[0]),
        )
    }

    fn div(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        binary(
            self,
            other,
            |a, b| a.div(b).map(Forward::value),
            |g| g.grad.div(&g.inputs[1]),
            // d(a/b)/db = -(a/b)/b
            |g| g.grad.mul(g.output)?.div(&g.inputs[1])?.neg(),
        )
    }

    fn neg(&self) -> Result<Tensor<B>> {
        unary(self, |x| x.neg().map(Forward::value), |g| g.grad.neg())
    }

    fn sqr(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.square().map(Forward::value),
            |g| g.inputs[0].scale(2.0)?.mul(g.grad),
        )
    }

    fn sqrt(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.sqrt().map(Forward::value),
            |g| g.grad.div(g.output)?.scale(0.5),
        )
    }

    fn pow(&self, p: f32) -> Result<Tensor<B>> {
        unary(
            self,
            move |x| x.pow(p).map(Forward::value),
            move |g| g.inputs[0].pow(p - 1.0)?.scale(p)?.mul(g.grad),
        )
    }

    fn exp(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.exp().map(Forward::value),
            |g| g.grad.mul(g.output),
        )
    }

    fn log(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.log().map(Forward::value),
            |g| g.grad.div(&g.inputs[0]),
        )
    }

    fn sin(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.sin().map(Forward::value),
            |g| g.inputs[0].cos()?.mul(g.grad),
        )
    }

    fn cos(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.cos().map(Forward::value),
            |g| g.inputs[0].sin()?.mul(g.grad)?.neg(),
        )
    }

    fn tanh(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.tanh().map(Forward::value),
            |g| g.output.square()?.neg()?.add_scalar(1.0)?.mul(g.grad),
        )
    }

    fn sigmoid(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.sigmoid().map(Forward::value),
            |g| {
                g.output
                    .neg()?
                    .add_scalar(1.0)?
                    .mul(g.output)?
                    .mul(g.grad)
            },
        )
    }

    fn relu(&self, slope: f32) -> Result<Tensor<B>> {
        unary(
            self,
            move |x| {
                let (out, mask) = x.relu(slope)?;
                Ok(Forward::with_saved(out, vec![mask]))
            },
            |g| g.grad.mul(&g.saved[0]),
        )
    }

    fn clip(&self, lo: f32, hi: f32) -> Result<Tensor<B>> {
        unary(
            self,
            move |x| Ok(Forward::with_saved(x.clip(lo, hi)?, vec![x.in_range(lo, hi)?])),
            |g| g.grad.mul(&g.saved[0]),
        )
    }

    fn matmul(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        binary(
            self,
            other,
            |a, b| a.matmul(b).map(Forward::value),
            |g| matmul_grad(g, true),
            |g| matmul_grad(g, false),
        )
    }

    fn conv2d(&self, filter: &Tensor<B>, params: Conv2dParams) -> Result<Tensor<B>> {
        binary(
            self,
            filter,
            move |x, f| x.conv2d(f, params).map(Forward::value),
            move |g| {
                let d = g.inputs[0].dims();
                let r = d.len();
                g.grad
                    .conv2d_input_grad(&g.inputs[1], params, (d[r - 3], d[r - 2]))
            },
            move |g| {
                g.inputs[0].conv2d_filter_grad(g.grad, params, g.inputs[1].dims())
            },
        )
    }

    fn max_pool2d(&self, ph: usize, pw: usize) -> Result<Tensor<B>> {
        unary(
            self,
            move |x| {
                let (out, mask) = x.max_pool2d(ph, pw)?;
                Ok(Forward::with_saved(out, vec![mask]))
            },
            move |g| g.grad.max_pool2d_backward(&g.saved[0], ph, pw),
        )
    }

    fn sum(&self, axes: &[isize], mode: ReduceMode) -> Result<Tensor<B>> {
        let fwd_axes = axes.to_vec();
        let grad_axes = axes.to_vec();
        unary(
            self,
            move |x| x.sum_axes(&fwd_axes, mode).map(Forward::value),
            move |g| {
                let x = g.inputs[0].shape();
                let kept = x.reduce(&x.axes_selector(&grad_axes)?, ReduceMode::Keep)?;
                g.grad
                    .reshape(&as_isize(kept.dims()))?
                    .broadcast_to(x.dims())
            },
        )
    }

    fn sum_all(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.sum_all().map(Forward::value),
            |g| g.grad.broadcast_to(g.inputs[0].dims()),
        )
    }

    fn mean(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.mean_all().map(Forward::value),
            |g| {
                let x = &g.inputs[0];
                g.grad.scale(1.0 / x.size() as f32)?.broadcast_to(x.dims())
            },
        )
    }

    fn softmax(&self) -> Result<Tensor<B>> {
        unary(
            self,
            |x| x.softmax().map(Forward::value),
            |g| {
                // y * (g - sum(g * y))
                let y = g.output;
                let dot = g.grad.mul(y)?.sum_axes(&[-1], ReduceMode::Keep)?;
                g.grad.sub(&dot)?.mul(y)
            },
        )
    }

    fn softmax_cross_entropy(&self, labels: &[usize]) -> Result<Tensor<B>> {
        let labels: Rc<[usize]> = labels.into();
        let fwd_labels = Rc::clone(&labels);
        unary(
            self,
            move |x| {
                let log_p = x.log_softmax()?;
                let loss = log_p.gather(-1, &fwd_labels)?.mean_all()?.neg()?;
                Ok(Forward::with_saved(loss, vec![log_p.exp()?]))
            },
            move |g| {
                let p = &g.saved[0];
                let ctx = p.context();
                let mut picked = p.dims().to_vec();
                let last = picked.len() - 1;
                let rows = p.size() / picked[last];
                picked[last] = 1;
                let one_hot =
                    ctx.zeros(p.dims())?
                        .scatter_add(-1, &labels, &ctx.ones(&picked)?)?;
                p.sub(&one_hot)?.mul(g.grad)?.scale(1.0 / rows as f32)
            },
        )
    }

    fn dropout(&self, keep_prob: f32) -> Result<Tensor<B>> {
        unary(
            self,
            move |x| {
                let (out, mask) = x.dropout(keep_prob)?;
                Ok(Forward::with_saved(out, vec![mask]))
            },
            |g| g.grad.mul(&g.saved[0]),
        )
    }

    fn reshape(&self, dims: &[isize]) -> Result<Tensor<B>> {
        let dims = dims.to_vec();
        unary(
            self,
            move |x| x.reshape(&dims).map(Forward::value),
            |g| g.grad.reshape(&as_isize(g.inputs[0].dims())),
        )
    }

    fn transpose(&self, axes: Option<&[usize]>) -> Result<Tensor<B>> {
        let perm = axes.map(<[usize]>::to_vec);
        let inverse = perm.as_ref().map(|p| {
            let mut inv = vec![0; p.len()];
            for (i, &axis) in p.iter().enumerate() {
                if let Some(slot) = inv.get_mut(axis) {
                    *slot = i;
                }
            }
            inv
        });
        unary(
            self,
            move |x| x.transpose(perm.as_deref()).map(Forward::value),
            move |g| g.grad.transpose(inverse.as_deref()),
        )
    }
}
