use crate::array::DenseArray;
use crate::backend::Backend;
use crate::error::{KilnError, Result};
use crate::tensor::{RawTensor, Tensor};
use log::trace;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

// ===== GRADIENT FUNCTION TRAIT =====

/// What a vector-Jacobian product sees for one node
pub struct GradContext<'a, B: Backend> {
    /// Gradient of the loss w.r.t. the node's output
    pub grad: &'a DenseArray<B>,
    /// Forward inputs, in edge order
    pub inputs: &'a [DenseArray<B>],
    pub output: &'a DenseArray<B>,
    /// Side arrays the forward pass kept (masks, probabilities)
    pub saved: &'a [DenseArray<B>],
}

/// Gradient of the loss w.r.t. one parent of a node
///
/// The result may have the output's (broadcast) dims; backward sums it down
/// to the parent's dims.
pub trait GradFn<B: Backend> {
    /// # Errors
    /// Any array error raised while computing the product.
    fn backward(&self, ctx: &GradContext<'_, B>) -> Result<DenseArray<B>>;
}

impl<B, F> GradFn<B> for F
where
    B: Backend,
    F: Fn(&GradContext<'_, B>) -> Result<DenseArray<B>>,
{
    fn backward(&self, ctx: &GradContext<'_, B>) -> Result<DenseArray<B>> {
        self(ctx)
    }
}

/// Box a closure as a [`GradFn`]
pub fn grad_fn<B, F>(f: F) -> Box<dyn GradFn<B>>
where
    B: Backend,
    F: Fn(&GradContext<'_, B>) -> Result<DenseArray<B>> + 'static,
{
    Box::new(f)
}

// ===== BACKPROPAGATION =====

impl<B: Backend> RawTensor<B> {
    /// Backpropagate from `root` with a gradient of ones
    ///
    /// # Errors
    /// See [`RawTensor::backward_with`].
    pub fn backward(root: &Tensor<B>) -> Result<()> {
        let value = Self::val(root)?;
        let seed = value.context().ones(value.dims())?;
        Self::backward_with(root, &seed)
    }

    /// Backpropagate from `root` with an explicit output gradient
    ///
    /// Previous gradients on the graph are cleared first, so calling it twice
    /// gives the same result. Nodes are visited in descending creation id,
    /// which puts every consumer before its producers. The visiting order is
    /// cached on `root` for later calls.
    ///
    /// # Errors
    /// `InvalidParameter` when `root` does not require gradients,
    /// `IncompatibleShape` when `seed` has the wrong dims, `GraphOrder` when
    /// an edge points to a newer node.
    pub fn backward_with(root: &Tensor<B>, seed: &DenseArray<B>) -> Result<()> {
        let value = Self::val(root)?;
        if !root.borrow().requires_grad {
            return Err(KilnError::InvalidParameter(
                "backward() on a tensor that does not require gradients".into(),
            ));
        }
        if seed.dims() != value.dims() {
            return Err(KilnError::IncompatibleShape(
                seed.dims().to_vec(),
                value.dims().to_vec(),
            ));
        }
        Self::zero_grad(root);
        let order = Self::backward_order(root)?;
        root.borrow_mut().grad = Some(seed.view()?);

        Self::propagate(root)?;
        for node in &order {
            Self::propagate(node)?;
        }
        Ok(())
    }

    /// Ancestors of `root` that need gradients, newest first
    fn backward_order(root: &Tensor<B>) -> Result<Vec<Tensor<B>>> {
        if let Some(order) = &root.borrow().backward_order {
            return Ok(order.clone());
        }

        let mut heap = BinaryHeap::new();
        let mut pending: HashMap<u64, Tensor<B>> = HashMap::new();
        let mut seen = HashSet::new();
        seen.insert(root.borrow().id);
        Self::expand(root, &mut heap, &mut pending, &mut seen)?;

        let mut order = Vec::with_capacity(pending.len());
        while let Some(id) = heap.pop() {
            let Some(node) = pending.remove(&id) else {
                continue;
            };
            Self::expand(&node, &mut heap, &mut pending, &mut seen)?;
            order.push(node);
        }
        trace!(
            "backward order for tensor {}: {} nodes",
            root.borrow().id,
            order.len() + 1
        );
        // The root is left out so the cache holds no reference to itself.
        root.borrow_mut().backward_order = Some(order.clone());
        Ok(order)
    }

    fn expand(
        node: &Tensor<B>,
        heap: &mut BinaryHeap<u64>,
        pending: &mut HashMap<u64, Tensor<B>>,
        seen: &mut HashSet<u64>,
    ) -> Result<()> {
        let n = node.borrow();
        for edge in &n.parents {
            let p = edge.parent.borrow();
            if !p.requires_grad {
                continue;
            }
            if p.id >= n.id {
                return Err(KilnError::GraphOrder {
                    parent: p.id,
                    child: n.id,
                });
            }
            if seen.insert(p.id) {
                heap.push(p.id);
                pending.insert(p.id, Rc::clone(&edge.parent));
            }
        }
        Ok(())
    }

    /// Push `node`'s accumulated gradient into its parents
    fn propagate(node: &Tensor<B>) -> Result<()> {
        let n = node.borrow();
        let Some(grad) = n.grad.clone() else {
            return Ok(());
        };
        if n.parents.is_empty() {
            return Ok(());
        }
        let inputs: Vec<DenseArray<B>> = n
            .parents
            .iter()
            .map(|e| e.parent.borrow().value.clone())
            .collect();
        let ctx = GradContext {
            grad: &grad,
            inputs: &inputs,
            output: &n.value,
            saved: &n.saved,
        };

        for edge in &n.parents {
            let dims = {
                let p = edge.parent.borrow();
                if !p.requires_grad {
                    continue;
                }
                p.value.dims().to_vec()
            };
            // sum_to always hands back a fresh handle, so a stored gradient
            // never shares its handle with another node's.
            let contribution = edge.grad_fn.backward(&ctx)?.sum_to(&dims)?;
            let mut p = edge.parent.borrow_mut();
            p.grad = Some(match p.grad.take() {
                None => contribution,
                Some(existing) => existing.add(&contribution)?,
            });
        }
        Ok(())
    }

    /// Clear the gradient of `root` and every ancestor
    pub fn zero_grad(root: &Tensor<B>) {
        let mut seen = HashSet::new();
        let mut stack = vec![Rc::clone(root)];
        while let Some(node) = stack.pop() {
            let mut n = node.borrow_mut();
            if !seen.insert(n.id) {
                continue;
            }
            n.grad = None;
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
    use crate::tensor::TensorOps;

    fn ctx() -> Context<Host> {
        Context::host_with(EngineConfig::default().with_threads(1)).unwrap()
    }

    #[test]
    fn diamond_accumulates_both_paths() {
        let ctx = ctx();
        let x = RawTensor::param(ctx.literal(&[3.0]).unwrap());
        let a = x.mul(&x).unwrap();
        let b = x.add(&x).unwrap();
        let y = a.add(&b).unwrap();
        y.backward().unwrap();
        // d/dx (x^2 + 2x) = 2x + 2
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![8.0]);
    }

    #[test]
    fn backward_twice_does_not_double() {
        let ctx = ctx();
        let x = RawTensor::param(ctx.literal(&[1.0, 2.0]).unwrap());
        let y = x.sqr().unwrap().sum_all().unwrap();
        y.backward().unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![2.0, 4.0]);
        assert!(y.borrow().backward_order.is_some());
    }

    #[test]
    fn constants_get_no_gradient() {
        let ctx = ctx();
        let w = RawTensor::param(ctx.literal(&[2.0]).unwrap());
        let k = RawTensor::constant(ctx.literal(&[5.0]).unwrap());
        let y = w.mul(&k).unwrap();
        y.backward().unwrap();
        assert_eq!(w.grad().unwrap().to_vec().unwrap(), vec![5.0]);
        assert!(k.grad().is_none());
    }

    #[test]
    fn backward_on_constant_graph_is_rejected() {
        let ctx = ctx();
        let k = RawTensor::constant(ctx.literal(&[5.0]).unwrap());
        let y = k.exp().unwrap();
        assert!(matches!(y.backward(), Err(KilnError::InvalidParameter(_))));
    }

    #[test]
    fn seed_dims_must_match() {
        let ctx = ctx();
        let x = RawTensor::param(ctx.literal(&[1.0, 2.0]).unwrap());
        let y = x.exp().unwrap();
        let seed = ctx.literal(&[1.0]).unwrap();
        assert!(matches!(
            y.backward_with(&seed),
            Err(KilnError::IncompatibleShape(_, _))
        ));
        let seed = ctx.literal(&[1.0, 0.0]).unwrap();
        y.backward_with(&seed).unwrap();
        let g = x.grad().unwrap().to_vec().unwrap();
        assert!((g[0] - 1f32.exp()).abs() < 1e-5);
        assert_eq!(g[1], 0.0);
    }

    #[test]
    fn broadcast_operand_gradient_is_summed() {
        let ctx = ctx();
        let m = RawTensor::param(ctx.ones(&[2, 3]).unwrap());
        let bias = RawTensor::param(ctx.literal(&[1.0, 2.0, 3.0]).unwrap());
        let y = m.add(&bias).unwrap().sum_all().unwrap();
        y.backward().unwrap();
        assert_eq!(bias.grad().unwrap().to_vec().unwrap(), vec![2.0; 3]);
        assert_eq!(m.grad().unwrap().dims(), &[2, 3]);
    }
}
