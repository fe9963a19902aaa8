use super::DenseArray;
use crate::backend::Backend;
use crate::error::{KilnError, Result};
use crate::shape::Shape;
use rand::Rng;

impl<B: Backend> DenseArray<B> {
    /// Leaky ReLU; returns the output and the gradient mask (1 or `slope`)
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn relu(&self, slope: f32) -> Result<(Self, Self)> {
        let x = self.to_vec()?;
        let mask: Vec<f32> = x
            .iter()
            .map(|&v| if v > 0.0 { 1.0 } else { slope })
            .collect();
        let out: Vec<f32> = x.iter().zip(&mask).map(|(&v, &m)| v * m).collect();
        let shape = self.shape().to_canonical();
        Ok((self.derive(out, shape.clone())?, self.derive(mask, shape)?))
    }

    /// Softmax along the last axis, shifted by the row maximum
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn softmax(&self) -> Result<Self> {
        let x = self.to_vec()?;
        let cols = self.dims()[self.rank() - 1];
        let mut out = vec![0.0; x.len()];
        self.context()
            .partitioner()
            .fill_rows(&mut out, cols, 64, |first_row, chunk| {
                for (r, row) in chunk.chunks_mut(cols).enumerate() {
                    let src = &x[(first_row + r) * cols..(first_row + r + 1) * cols];
                    let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut total = 0.0;
                    for (o, &v) in row.iter_mut().zip(src) {
                        *o = (v - max).exp();
                        total += *o;
                    }
                    for o in row.iter_mut() {
                        *o /= total;
                    }
                }
            });
        self.derive(out, self.shape().to_canonical())
    }

    /// Log-softmax along the last axis, `x - max - ln(sum(exp(x - max)))`
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn log_softmax(&self) -> Result<Self> {
        let x = self.to_vec()?;
        let cols = self.dims()[self.rank() - 1];
        let mut out = vec![0.0; x.len()];
        self.context()
            .partitioner()
            .fill_rows(&mut out, cols, 64, |first_row, chunk| {
                for (r, row) in chunk.chunks_mut(cols).enumerate() {
                    let src = &x[(first_row + r) * cols..(first_row + r + 1) * cols];
                    let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let lse = max + src.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
                    for (o, &v) in row.iter_mut().zip(src) {
                        *o = v - lse;
                    }
                }
            });
        self.derive(out, self.shape().to_canonical())
    }

    /// Inverted dropout; returns the output and the scaled keep mask
    ///
    /// Each element survives with probability `keep_prob` and is scaled by
    /// `1 / keep_prob`. The mask is drawn from the context RNG.
    ///
    /// # Errors
    /// `InvalidParameter` unless `0 < keep_prob <= 1`.
    pub fn dropout(&self, keep_prob: f32) -> Result<(Self, Self)> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(KilnError::InvalidParameter(format!(
                "dropout keep probability {keep_prob} outside (0, 1]"
            )));
        }
        let scale = 1.0 / keep_prob;
        let mask: Vec<f32> = self.context().with_rng(|rng| {
            (0..self.size())
                .map(|_| {
                    if rng.random::<f32>() < keep_prob {
                        scale
                    } else {
                        0.0
                    }
                })
                .collect()
        });
        let mask = self.derive(mask, self.shape().to_canonical())?;
        let out = self.mul(&mask)?;
        Ok((out, mask))
    }

    /// Dims with `axis` collapsed to 1, and the resolved axis
    fn index_layout(&self, axis: isize) -> Result<(usize, Shape)> {
        let a = self.shape().resolve_axis(axis)?;
        let mut dims = self.dims().to_vec();
        dims[a] = 1;
        Ok((a, Shape::new(&dims)?))
    }

    fn check_indices(&self, axis: usize, picked: &Shape, indices: &[usize]) -> Result<()> {
        if indices.len() != picked.size() {
            return Err(KilnError::InvalidShape(format!(
                "{} indices for {} positions along axis {axis} of {}",
                indices.len(),
                picked.size(),
                self.shape()
            )));
        }
        let size = self.dims()[axis];
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            return Err(KilnError::IndexOutOfBounds { index: bad, size });
        }
        Ok(())
    }

    /// Pick one element along `axis` for every position of the other axes
    ///
    /// The result has `axis` collapsed to size 1; `indices` is row-major over
    /// that shape.
    ///
    /// # Errors
    /// `InvalidShape` for a wrong index count, `IndexOutOfBounds` for an index
    /// past the axis.
    pub fn gather(&self, axis: isize, indices: &[usize]) -> Result<Self> {
        let (a, picked) = self.index_layout(axis)?;
        self.check_indices(a, &picked, indices)?;
        let src = self.shape();
        let out = self.raw(|x| {
            let mut coords = vec![0usize; picked.rank()];
            indices
                .iter()
                .enumerate()
                .map(|(i, &idx)| {
                    picked.unravel(i, &mut coords);
                    coords[a] = idx;
                    x[src.offset(&coords)]
                })
                .collect::<Vec<f32>>()
        })?;
        self.derive(out, picked)
    }

    /// Copy of this array with `values` added at the gathered positions
    ///
    /// Inverse of [`DenseArray::gather`]; `values` has `axis` collapsed to 1.
    ///
    /// # Errors
    /// As for `gather`, plus `IncompatibleShape` when `values` has the wrong
    /// dims.
    pub fn scatter_add(&self, axis: isize, indices: &[usize], values: &Self) -> Result<Self> {
        let (a, picked) = self.index_layout(axis)?;
        if values.dims() != picked.dims() {
            return Err(KilnError::IncompatibleShape(
                values.dims().to_vec(),
                picked.dims().to_vec(),
            ));
        }
        self.check_indices(a, &picked, indices)?;
        let mut out = self.to_vec()?;
        let vals = values.to_vec()?;
        let dense = self.shape().to_canonical();
        let mut coords = vec![0usize; picked.rank()];
        for (i, (&idx, &v)) in indices.iter().zip(&vals).enumerate() {
            picked.unravel(i, &mut coords);
            coords[a] = idx;
            out[dense.offset(&coords)] += v;
        }
        self.derive(out, dense)
    }
}
