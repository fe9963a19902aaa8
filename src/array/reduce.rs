use super::DenseArray;
use crate::backend::Backend;
use crate::error::{KilnError, Result};
use crate::shape::{ReduceMode, Shape};

impl<B: Backend> DenseArray<B> {
    /// Sum over the axes flagged in `selector`
    ///
    /// # Errors
    /// `InvalidShape` when the selector length differs from the rank.
    pub fn sum(&self, selector: &[bool], mode: ReduceMode) -> Result<Self> {
        let kept = self.shape().reduce(selector, ReduceMode::Keep)?;
        let out_shape = self.shape().reduce(selector, mode)?;
        let reduced_axes: Vec<usize> = (0..self.rank()).filter(|&a| selector[a]).collect();
        let reduced_dims: Vec<usize> = reduced_axes.iter().map(|&a| self.dims()[a]).collect();
        let per_output: usize = reduced_dims.iter().product();
        let src = self.shape();

        let data = self.raw(|x| {
            let mut out = vec![0.0; kept.size()];
            self.context().partitioner().fill(&mut out, |start, chunk| {
                let mut coords = vec![0usize; src.rank()];
                for (i, o) in chunk.iter_mut().enumerate() {
                    kept.unravel(start + i, &mut coords);
                    let mut acc = 0.0;
                    for mut r in 0..per_output {
                        for (&axis, &d) in reduced_axes.iter().zip(&reduced_dims).rev() {
                            coords[axis] = r % d;
                            r /= d;
                        }
                        acc += x[src.offset(&coords)];
                    }
                    *o = acc;
                }
            });
            out
        })?;
        self.derive(data, out_shape)
    }

    /// Sum over a list of (possibly negative) axes
    ///
    /// # Errors
    /// `AxisOutOfBounds` / `DuplicateAxis` for bad axes.
    pub fn sum_axes(&self, axes: &[isize], mode: ReduceMode) -> Result<Self> {
        let selector = self.shape().axes_selector(axes)?;
        self.sum(&selector, mode)
    }

    fn fold_all(&self, init: f32, f: fn(f32, f32) -> f32) -> Result<f32> {
        let src = self.materialized()?;
        let part = self.context().partitioner();
        src.raw(|x| {
            let x = &x[..src.size()];
            part.map_reduce(
                x.len(),
                |r| x[r].iter().fold(init, |acc, &v| f(acc, v)),
                f,
            )
        })
    }

    /// Sum of every element, shape `[1]`
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn sum_all(&self) -> Result<Self> {
        let total = self.fold_all(0.0, |a, b| a + b)?;
        self.derive(vec![total], Shape::scalar())
    }

    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn mean_all(&self) -> Result<Self> {
        let total = self.fold_all(0.0, |a, b| a + b)?;
        self.derive(vec![total / self.size() as f32], Shape::scalar())
    }

    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn max_all(&self) -> Result<Self> {
        let max = self.fold_all(f32::NEG_INFINITY, f32::max)?;
        self.derive(vec![max], Shape::scalar())
    }

    /// Sum a broadcast result back down to `dims`
    ///
    /// Leading axes missing from `dims` and axes where `dims` has size 1 are
    /// summed away.
    ///
    /// # Errors
    /// `IncompatibleShape` when this array is not a broadcast of `dims`.
    pub fn sum_to(&self, dims: &[usize]) -> Result<Self> {
        if self.dims() == dims {
            return self.view();
        }
        let mismatch = || KilnError::IncompatibleShape(self.dims().to_vec(), dims.to_vec());
        if dims.len() > self.rank() {
            return Err(mismatch());
        }
        let lead = self.rank() - dims.len();
        let mut selector = vec![false; self.rank()];
        for (axis, &d) in self.dims().iter().enumerate() {
            if axis < lead {
                selector[axis] = true;
            } else {
                let target = dims[axis - lead];
                if target == d {
                    continue;
                }
                if target != 1 {
                    return Err(mismatch());
                }
                selector[axis] = true;
            }
        }
        let summed = self.sum(&selector, ReduceMode::Keep)?;
        let target: Vec<isize> = dims.iter().map(|&d| d as isize).collect();
        summed.reshape(&target)
    }
}
