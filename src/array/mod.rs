//! Dense arrays
//!
//! A [`DenseArray`] is a [`Shape`] plus a view handle onto a backend buffer.
//! Arrays are immutable: every operation allocates its output, registers it
//! in the context's innermost disposal scope and returns it. Cloning an array
//! shares its handle; [`DenseArray::view`] creates an independent handle onto
//! the same buffer.

mod conv;
mod elementwise;
mod linalg;
mod mutable;
mod nn;
mod reduce;

pub use conv::Conv2dParams;
pub use mutable::MutableArray;

use crate::backend::{Backend, host};
use crate::buffer::ArrayHandle;
use crate::context::Context;
use crate::dispose::Retain;
use crate::error::{KilnError, Result};
use crate::shape::Shape;
use std::collections::HashSet;
use std::sync::Arc;

pub struct DenseArray<B: Backend> {
    shape: Shape,
    handle: Arc<ArrayHandle<B::Storage>>,
    ctx: Context<B>,
}

impl<B: Backend> Clone for DenseArray<B> {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            handle: Arc::clone(&self.handle),
            ctx: self.ctx.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for DenseArray<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseArray")
            .field("id", &self.handle.id())
            .field("shape", &self.shape.dims())
            .field("layout", &self.shape.layout())
            .field("backend", &self.ctx.backend().name())
            .field("released", &self.handle.is_released())
            .finish()
    }
}

impl<B: Backend> Retain for DenseArray<B> {
    fn retain_into(&self, keep: &mut HashSet<u64>) {
        keep.insert(self.handle.id());
    }
}

impl<B: Backend> DenseArray<B> {
    pub(crate) fn from_parts(
        shape: Shape,
        handle: Arc<ArrayHandle<B::Storage>>,
        ctx: Context<B>,
    ) -> Self {
        Self { shape, handle, ctx }
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Id of this view's handle
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    #[must_use]
    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<ArrayHandle<B::Storage>> {
        &self.handle
    }

    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.shape.is_canonical()
    }

    /// # Errors
    /// `AlreadyReleased` after this view was released.
    pub fn storage(&self) -> Result<Arc<B::Storage>> {
        self.handle.storage()
    }

    /// Run `f` over the raw buffer (physical order, see [`DenseArray::shape`])
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device read-back failure.
    pub fn raw<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let storage = self.storage()?;
        self.ctx.backend().read(&storage, f)
    }

    // ===== LIFECYCLE =====

    /// Release this view
    ///
    /// # Errors
    /// `AlreadyReleased` when it was released before.
    pub fn dispose(&self) -> Result<()> {
        self.handle.release()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    /// New handle onto the same buffer, released independently
    ///
    /// # Errors
    /// `AlreadyReleased` after this view was released.
    pub fn view(&self) -> Result<Self> {
        self.relayout(self.shape.clone())
    }

    fn relayout(&self, shape: Shape) -> Result<Self> {
        let handle = self.handle.view(self.ctx.leak_detector())?;
        Ok(self.ctx.adopt_view(handle, shape))
    }

    /// Output array on the same context
    pub(crate) fn derive(&self, data: Vec<f32>, shape: Shape) -> Result<Self> {
        self.ctx.upload(data, shape)
    }

    // ===== READ-BACK =====

    /// Values in row-major logical order
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device read-back failure.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let size = self.size();
        if self.is_canonical() {
            return self.raw(|d| d[..size].to_vec());
        }
        self.raw(|d| host::gather_strided(self.ctx.partitioner(), d, &self.shape))
    }

    /// The only element of a single-element array
    ///
    /// # Errors
    /// `InvalidShape` when the array holds more than one element.
    pub fn item(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(KilnError::InvalidShape(format!(
                "item() on an array of shape {}",
                self.shape
            )));
        }
        let off = self.shape.offset_of_linear(0);
        self.raw(|d| d[off])
    }

    /// # Errors
    /// `InvalidShape` for a coordinate of the wrong rank, `IndexOutOfBounds`
    /// for one outside the shape.
    pub fn get(&self, coords: &[usize]) -> Result<f32> {
        self.check_rank(coords.len())?;
        for (&c, &d) in coords.iter().zip(self.dims()) {
            if c >= d {
                return Err(KilnError::IndexOutOfBounds { index: c, size: d });
            }
        }
        let off = self.shape.offset(coords);
        self.raw(|d| d[off])
    }

    /// Like [`DenseArray::get`] but coordinates outside the shape read as 0
    ///
    /// # Errors
    /// `InvalidShape` for a coordinate of the wrong rank.
    pub fn get_or_zero(&self, coords: &[isize]) -> Result<f32> {
        self.check_rank(coords.len())?;
        match self.shape.offset_signed(coords) {
            Some(off) => self.raw(|d| d[off]),
            None => Ok(0.0),
        }
    }

    fn check_rank(&self, len: usize) -> Result<()> {
        if len != self.rank() {
            return Err(KilnError::InvalidShape(format!(
                "{len} coordinates for an array of shape {}",
                self.shape
            )));
        }
        Ok(())
    }

    // ===== MOVEMENT =====

    /// Same elements in a row-major buffer
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_canonical() {
            return self.view();
        }
        let data = self.to_vec()?;
        self.derive(data, self.shape.to_canonical())
    }

    /// This array if already row-major, otherwise a copy
    pub(crate) fn materialized(&self) -> Result<Self> {
        if self.is_canonical() {
            Ok(self.clone())
        } else {
            self.contiguous()
        }
    }

    /// # Errors
    /// `InvalidShape` for a target that does not preserve the element count.
    pub fn reshape(&self, dims: &[isize]) -> Result<Self> {
        let shape = self.shape.reshape(dims)?;
        if self.is_canonical() {
            self.relayout(shape)
        } else {
            let data = self.to_vec()?;
            self.derive(data, shape)
        }
    }

    /// Zero-copy axis permutation; `None` reverses the axes
    ///
    /// # Errors
    /// `MissingAxis`, `DuplicateAxis` or `AxisOutOfBounds`.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Self> {
        let shape = self.shape.transpose(axes)?;
        self.relayout(shape)
    }

    /// Swap the last two axes
    ///
    /// # Errors
    /// `InvalidShape` below rank 2.
    pub fn swap_last(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(KilnError::InvalidShape(format!(
                "cannot swap the last two axes of {}",
                self.shape
            )));
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(rank - 2, rank - 1);
        self.transpose(Some(&perm))
    }

    /// Zero-copy reversal of the two leading axes
    ///
    /// # Errors
    /// `InvalidShape` below rank 2.
    pub fn rotate(&self) -> Result<Self> {
        let shape = self.shape.rotate()?;
        self.relayout(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Host;
    use crate::config::EngineConfig;

    fn ctx() -> Context<Host> {
        Context::host_with(EngineConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn transpose_reads_through_strides() {
        let ctx = ctx();
        let a = ctx.literal(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        let t = a.transpose(None).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(t.get(&[2, 1]).unwrap(), 6.0);
        assert!(Arc::ptr_eq(a.handle().core(), t.handle().core()));
    }

    #[test]
    fn reshape_of_transpose_copies() {
        let ctx = ctx();
        let a = ctx.literal(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let r = a.transpose(None).unwrap().reshape(&[-1]).unwrap();
        assert_eq!(r.to_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn out_of_range_reads() {
        let ctx = ctx();
        let a = ctx.literal(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(a.get_or_zero(&[-1, 0]).unwrap(), 0.0);
        assert_eq!(a.get_or_zero(&[1, 1]).unwrap(), 4.0);
        assert!(matches!(
            a.get(&[2, 0]),
            Err(KilnError::IndexOutOfBounds { index: 2, size: 2 })
        ));
        assert!(matches!(a.item(), Err(KilnError::InvalidShape(_))));
    }

    #[test]
    fn views_release_independently() {
        let ctx = ctx();
        let a = ctx.ones(&[4]).unwrap();
        let v = a.view().unwrap();
        a.dispose().unwrap();
        assert!(matches!(a.to_vec(), Err(KilnError::AlreadyReleased { .. })));
        assert_eq!(v.to_vec().unwrap(), vec![1.0; 4]);
        assert!(matches!(a.dispose(), Err(KilnError::AlreadyReleased { .. })));
    }
}
