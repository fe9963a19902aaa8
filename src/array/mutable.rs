use super::DenseArray;
use crate::backend::Backend;
use crate::context::Context;
use crate::error::{KilnError, Result};
use crate::shape::Shape;

/// Host-side staging buffer for building an array element by element
///
/// [`MutableArray::freeze`] consumes the builder, so it cannot be written
/// after the array exists.
pub struct MutableArray<B: Backend> {
    ctx: Context<B>,
    shape: Shape,
    data: Vec<f32>,
}

impl<B: Backend> MutableArray<B> {
    pub(crate) fn new(ctx: Context<B>, shape: Shape) -> Result<Self> {
        let data = vec![0.0; shape.size()];
        Ok(Self { ctx, shape, data })
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    fn index(&self, coords: &[usize]) -> Result<usize> {
        if coords.len() != self.shape.rank() {
            return Err(KilnError::InvalidShape(format!(
                "{} coordinates for shape {}",
                coords.len(),
                self.shape
            )));
        }
        for (&c, &d) in coords.iter().zip(self.shape.dims()) {
            if c >= d {
                return Err(KilnError::IndexOutOfBounds { index: c, size: d });
            }
        }
        Ok(self.shape.offset(coords))
    }

    /// # Errors
    /// `InvalidShape` / `IndexOutOfBounds` for a bad coordinate.
    pub fn set(&mut self, coords: &[usize], value: f32) -> Result<()> {
        let i = self.index(coords)?;
        self.data[i] = value;
        Ok(())
    }

    /// # Errors
    /// `InvalidShape` / `IndexOutOfBounds` for a bad coordinate.
    pub fn get(&self, coords: &[usize]) -> Result<f32> {
        Ok(self.data[self.index(coords)?])
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Row-major backing slice
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Upload the staged values as an immutable array
    ///
    /// # Errors
    /// Allocation failures.
    pub fn freeze(self) -> Result<DenseArray<B>> {
        self.ctx.upload(self.data, self.shape)
    }
}
