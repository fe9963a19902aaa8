//! Autodiff graph nodes
//!
//! A [`Tensor`] wraps a [`DenseArray`] value plus the edges needed to
//! differentiate it. Values are computed eagerly when a node is built; each
//! node keeps its forward closure so the value can be recomputed after an
//! upstream [`RawTensor::set_value`].

mod gradcheck;
mod ops;

pub use gradcheck::{check_gradients, check_gradients_simple};
pub use ops::TensorOps;

use crate::array::DenseArray;
use crate::autograd::GradFn;
use crate::backend::Backend;
use crate::dispose::Retain;
use crate::error::{KilnError, Result};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reference-counted, interior-mutable graph node
///
/// Single-threaded: each thread builds its own graphs on its own context.
pub type Tensor<B> = Rc<RefCell<RawTensor<B>>>;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Output of a forward closure: the value plus side arrays for the gradient
pub struct Forward<B: Backend> {
    pub value: DenseArray<B>,
    pub saved: Vec<DenseArray<B>>,
}

impl<B: Backend> Forward<B> {
    #[must_use]
    pub fn value(value: DenseArray<B>) -> Self {
        Self {
            value,
            saved: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_saved(value: DenseArray<B>, saved: Vec<DenseArray<B>>) -> Self {
        Self { value, saved }
    }
}

pub type ForwardFn<B> = Box<dyn Fn(&[DenseArray<B>]) -> Result<Forward<B>>>;

/// One parent plus the vector-Jacobian product for it
pub struct Edge<B: Backend> {
    pub(crate) parent: Tensor<B>,
    pub(crate) grad_fn: Box<dyn GradFn<B>>,
}

pub struct RawTensor<B: Backend> {
    pub(crate) id: u64,
    pub(crate) value: DenseArray<B>,
    pub(crate) saved: Vec<DenseArray<B>>,
    pub(crate) grad: Option<DenseArray<B>>,
    pub(crate) requires_grad: bool,
    pub(crate) parents: Vec<Edge<B>>,
    pub(crate) forward: Option<ForwardFn<B>>,
    pub(crate) dirty: bool,
    pub(crate) consumers: Vec<Weak<RefCell<RawTensor<B>>>>,
    /// Ancestors in backward order, built by the first `backward()`
    pub(crate) backward_order: Option<Vec<Tensor<B>>>,
}

impl<B: Backend> std::fmt::Debug for RawTensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.value.dims())
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.is_some())
            .field("parents", &self.parents.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

// ===== CONSTRUCTORS =====

impl<B: Backend> RawTensor<B> {
    fn leaf(value: DenseArray<B>, requires_grad: bool) -> Tensor<B> {
        Rc::new(RefCell::new(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            value,
            saved: Vec::new(),
            grad: None,
            requires_grad,
            parents: Vec::new(),
            forward: None,
            dirty: false,
            consumers: Vec::new(),
            backward_order: None,
        }))
    }

    /// Trainable leaf
    #[must_use]
    pub fn param(value: DenseArray<B>) -> Tensor<B> {
        Self::leaf(value, true)
    }

    /// Leaf that never receives a gradient (inputs, labels)
    #[must_use]
    pub fn constant(value: DenseArray<B>) -> Tensor<B> {
        Self::leaf(value, false)
    }

    /// Build an op node: run `forward` on the inputs' values now and keep it
    /// for recomputation; `grad_fns[i]` differentiates input `i`
    ///
    /// # Errors
    /// Whatever the forward computation returns.
    pub fn from_op(
        inputs: &[Tensor<B>],
        forward: ForwardFn<B>,
        grad_fns: Vec<Box<dyn GradFn<B>>>,
    ) -> Result<Tensor<B>> {
        debug_assert_eq!(inputs.len(), grad_fns.len());
        let values = inputs.iter().map(Self::val).collect::<Result<Vec<_>>>()?;
        let Forward { value, saved } = forward(&values)?;
        let requires_grad = inputs.iter().any(|t| t.borrow().requires_grad);
        let parents = inputs
            .iter()
            .zip(grad_fns)
            .map(|(parent, grad_fn)| Edge {
                parent: Rc::clone(parent),
                grad_fn,
            })
            .collect();
        // The id is taken after every input exists, so edges point to older nodes.
        let node = Rc::new(RefCell::new(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            value,
            saved,
            grad: None,
            requires_grad,
            parents,
            forward: Some(forward),
            dirty: false,
            consumers: Vec::new(),
            backward_order: None,
        }));
        for input in inputs {
            let mut input = input.borrow_mut();
            input.consumers.retain(|c| c.strong_count() > 0);
            input.consumers.push(Rc::downgrade(&node));
        }
        Ok(node)
    }
}

// ===== VALUE, MUTATION & OPTIMIZER UPDATES =====

impl<B: Backend> RawTensor<B> {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current value, recomputing stale ancestors first
    ///
    /// # Errors
    /// Whatever a recomputed forward closure returns.
    pub fn val(tensor: &Tensor<B>) -> Result<DenseArray<B>> {
        if tensor.borrow().dirty {
            Self::refresh(tensor)?;
        }
        Ok(tensor.borrow().value.clone())
    }

    /// Recompute every dirty ancestor, oldest first
    fn refresh(tensor: &Tensor<B>) -> Result<()> {
        let mut stale = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![Rc::clone(tensor)];
        while let Some(node) = stack.pop() {
            let n = node.borrow();
            if !n.dirty || !seen.insert(n.id) {
                continue;
            }
            stack.extend(n.parents.iter().map(|e| Rc::clone(&e.parent)));
            drop(n);
            stale.push(node);
        }
        stale.sort_by_key(|n| n.borrow().id);

        for node in stale {
            let inputs: Vec<DenseArray<B>> = node
                .borrow()
                .parents
                .iter()
                .map(|e| e.parent.borrow().value.clone())
                .collect();
            let out = {
                let n = node.borrow();
                match &n.forward {
                    Some(forward) => Some(forward(&inputs)?),
                    None => None,
                }
            };
            let mut n = node.borrow_mut();
            if let Some(Forward { value, saved }) = out {
                n.value = value;
                n.saved = saved;
            }
            n.dirty = false;
        }
        Ok(())
    }

    /// Mark every transitive consumer stale, breadth-first
    pub(crate) fn invalidate_consumers(tensor: &Tensor<B>) {
        let mut queue: VecDeque<Weak<RefCell<Self>>> = {
            let mut t = tensor.borrow_mut();
            t.consumers.retain(|w| w.strong_count() > 0);
            t.consumers.iter().cloned().collect()
        };
        while let Some(weak) = queue.pop_front() {
            let Some(consumer) = weak.upgrade() else {
                continue;
            };
            let mut c = consumer.borrow_mut();
            if c.dirty {
                continue;
            }
            c.dirty = true;
            queue.extend(c.consumers.iter().cloned());
        }
    }

    /// Replace a node's value and mark its consumers stale
    ///
    /// # Errors
    /// `IncompatibleShape` when the dims change.
    pub fn set_value(tensor: &Tensor<B>, value: DenseArray<B>) -> Result<()> {
        {
            let mut t = tensor.borrow_mut();
            if t.value.dims() != value.dims() {
                return Err(KilnError::IncompatibleShape(
                    value.dims().to_vec(),
                    t.value.dims().to_vec(),
                ));
            }
            t.value = value;
            t.dirty = false;
        }
        Self::invalidate_consumers(tensor);
        Ok(())
    }

    /// Accumulated gradient, if `backward()` reached this node
    #[must_use]
    pub fn grad(tensor: &Tensor<B>) -> Option<DenseArray<B>> {
        tensor.borrow().grad.clone()
    }

    /// Optimizer step: `value = combiner(value, grad)`, then release and clear
    /// the gradient
    ///
    /// Returns `false` without calling `combiner` when there is no gradient.
    ///
    /// # Errors
    /// Whatever `combiner` returns, `IncompatibleShape` when it changes the
    /// dims, `AlreadyReleased` when the gradient was released elsewhere.
    pub fn update<F>(tensor: &Tensor<B>, combiner: F) -> Result<bool>
    where
        F: FnOnce(&DenseArray<B>, &DenseArray<B>) -> Result<DenseArray<B>>,
    {
        let (value, grad) = {
            let t = tensor.borrow();
            (t.value.clone(), t.grad.clone())
        };
        let Some(grad) = grad else {
            return Ok(false);
        };
        let next = combiner(&value, &grad)?;
        if next.dims() != value.dims() {
            return Err(KilnError::IncompatibleShape(
                next.dims().to_vec(),
                value.dims().to_vec(),
            ));
        }
        {
            let mut t = tensor.borrow_mut();
            t.value = next;
            t.grad = None;
        }
        let released = grad.dispose();
        Self::invalidate_consumers(tensor);
        released.map(|()| true)
    }
}

/// A tensor keeps its own arrays and those of every ancestor
impl<B: Backend> Retain for Tensor<B> {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        let mut seen = HashSet::new();
        let mut stack = vec![Rc::clone(self)];
        while let Some(node) = stack.pop() {
            // Skipped when mutably borrowed (a scope unwinding mid-update).
            let Ok(n) = node.try_borrow() else {
                continue;
            };
            if !seen.insert(n.id) {
                continue;
            }
            n.value.retain_into(keep);
            n.grad.retain_into(keep);
            n.saved.retain_into(keep);
            stack.extend(n.parents.iter().map(|e| Rc::clone(&e.parent)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Host;
    use crate::config::EngineConfig;
    use crate::context::Context;

    fn ctx() -> Context<Host> {
        Context::host_with(EngineConfig::default().with_threads(1)).unwrap()
    }

    #[test]
    fn ids_increase_along_edges() {
        let ctx = ctx();
        let a = RawTensor::param(ctx.literal(&[1.0, 2.0]).unwrap());
        let b = RawTensor::param(ctx.literal(&[3.0, 4.0]).unwrap());
        let c = a.add(&b).unwrap();
        assert!(c.borrow().id() > a.borrow().id());
        assert!(c.borrow().id() > b.borrow().id());
        assert!(c.borrow().requires_grad());
        let k = RawTensor::constant(ctx.literal(&[1.0]).unwrap());
        assert!(!k.neg().unwrap().borrow().requires_grad());
    }

    #[test]
    fn set_value_recomputes_consumers_lazily() {
        let ctx = ctx();
        let a = RawTensor::param(ctx.literal(&[1.0, 2.0]).unwrap());
        let b = a.sqr().unwrap();
        let c = b.sum_all().unwrap();
        assert_eq!(c.val().unwrap().item().unwrap(), 5.0);

        a.set_value(ctx.literal(&[3.0, 0.0]).unwrap()).unwrap();
        assert!(b.borrow().is_dirty());
        assert!(c.borrow().is_dirty());
        assert_eq!(c.val().unwrap().item().unwrap(), 9.0);
        assert!(!b.borrow().is_dirty());

        assert!(matches!(
            a.set_value(ctx.literal(&[1.0]).unwrap()),
            Err(KilnError::IncompatibleShape(_, _))
        ));
    }

    #[test]
    fn update_consumes_the_gradient() {
        let ctx = ctx();
        let w = RawTensor::param(ctx.literal(&[1.0, -1.0]).unwrap());
        let loss = w.sqr().unwrap().sum_all().unwrap();
        loss.backward().unwrap();
        let g = w.grad().unwrap();
        assert_eq!(g.to_vec().unwrap(), vec![2.0, -2.0]);

        let stepped = w.update(|v, g| v.sub(&g.scale(0.25)?)).unwrap();
        assert!(stepped);
        assert!(w.grad().is_none());
        assert!(g.is_released());
        assert_eq!(w.val().unwrap().to_vec().unwrap(), vec![0.5, -0.5]);
        assert!(loss.borrow().is_dirty());
        assert_eq!(loss.val().unwrap().item().unwrap(), 0.5);

        assert!(!w.update(|v, _| Ok(v.clone())).unwrap());
    }

    #[test]
    fn update_with_a_released_gradient_still_refreshes_consumers() {
        let ctx = ctx();
        let w = RawTensor::param(ctx.literal(&[1.0, 2.0]).unwrap());
        let loss = w.sqr().unwrap().sum_all().unwrap();
        assert_eq!(loss.val().unwrap().item().unwrap(), 5.0);
        loss.backward().unwrap();
        w.grad().unwrap().dispose().unwrap();

        let err = w.update(|v, _| v.add_scalar(1.0)).unwrap_err();
        assert!(matches!(err, KilnError::AlreadyReleased { .. }));
        assert!(w.grad().is_none());
        assert_eq!(w.val().unwrap().to_vec().unwrap(), vec![2.0, 3.0]);
        assert!(loss.borrow().is_dirty());
        assert_eq!(loss.val().unwrap().item().unwrap(), 13.0);
    }
}
