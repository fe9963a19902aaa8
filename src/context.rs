//! Per-task engine context
//!
//! A [`Context`] carries everything an allocating call needs: the backend,
//! the disposal scope stack, the RNG, the optional leak detector and the
//! configuration. It is cheap to clone and single-threaded; each thread or
//! task builds its own.

use crate::array::{DenseArray, MutableArray};
use crate::backend::{Backend, Host};
use crate::buffer::ArrayHandle;
use crate::config::EngineConfig;
use crate::dispose::{Disposable, Retain, ScopeStack, release_frame};
use crate::error::{KilnError, Result};
use crate::leak::LeakDetector;
use crate::parallel::Partitioner;
use crate::shape::Shape;
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

struct ContextInner<B: Backend> {
    backend: Arc<B>,
    scopes: RefCell<ScopeStack>,
    rng: RefCell<StdRng>,
    leaks: Option<Arc<LeakDetector>>,
    config: EngineConfig,
}

pub struct Context<B: Backend> {
    inner: Rc<ContextInner<B>>,
}

impl<B: Backend> Clone for Context<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.backend.name())
            .field("scope_depth", &self.scope_depth())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Context<Host> {
    /// Host context configured from the environment
    ///
    /// # Errors
    /// `BackendUnavailable` when the worker pool cannot start.
    pub fn host() -> Result<Self> {
        Self::host_with(EngineConfig::from_env())
    }

    /// # Errors
    /// `BackendUnavailable` when the worker pool cannot start.
    pub fn host_with(config: EngineConfig) -> Result<Self> {
        let backend = Host::new(&config)?;
        Ok(Self::new(Arc::new(backend), config))
    }
}

#[cfg(feature = "gpu")]
impl Context<crate::backend::Accel> {
    /// Accelerator context configured from the environment
    ///
    /// # Errors
    /// `BackendUnavailable` when no adapter or device can be acquired.
    pub fn accelerator() -> Result<Self> {
        Self::accelerator_with(EngineConfig::from_env())
    }

    /// # Errors
    /// `BackendUnavailable` when no adapter or device can be acquired.
    pub fn accelerator_with(config: EngineConfig) -> Result<Self> {
        let backend = crate::backend::Accel::new(&config)?;
        Ok(Self::new(Arc::new(backend), config))
    }
}

/// Ends a scope when dropped, so temporaries are released on panic too
///
/// `state` is read at close time: parameters replaced during the scope keep
/// their new values.
struct ScopeGuard<'a, B: Backend, K: Retain + ?Sized> {
    ctx: &'a Context<B>,
    state: &'a K,
    keep: HashSet<u64>,
}

impl<B: Backend, K: Retain + ?Sized> Drop for ScopeGuard<'_, B, K> {
    fn drop(&mut self) {
        let Ok(mut scopes) = self.ctx.inner.scopes.try_borrow_mut() else {
            warn!("disposal scope stack busy while closing a scope; leaving it open");
            return;
        };
        let Some(frame) = scopes.pop() else {
            return;
        };
        drop(scopes);
        self.state.retain_into(&mut self.keep);
        let (kept, _) = release_frame(frame, &self.keep);
        self.ctx.inner.scopes.borrow_mut().adopt(kept);
    }
}

impl<B: Backend> Context<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, config: EngineConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let leaks = (config.leak_sample_every > 0).then(|| {
            Arc::new(LeakDetector::new(
                config.leak_sample_every,
                config.leak_report_epochs,
            ))
        });
        Self {
            inner: Rc::new(ContextInner {
                backend,
                scopes: RefCell::new(ScopeStack::default()),
                rng: RefCell::new(rng),
                leaks,
                config,
            }),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    #[must_use]
    pub fn partitioner(&self) -> &Partitioner {
        self.inner.backend.partitioner()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn leak_detector(&self) -> Option<&Arc<LeakDetector>> {
        self.inner.leaks.as_ref()
    }

    /// Whether two contexts are the same instance
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.inner.rng.borrow_mut())
    }

    // ===== DISPOSAL =====

    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.inner.scopes.borrow().depth()
    }

    /// Track `item` in the innermost scope (no-op without one)
    pub fn register(&self, item: Arc<dyn Disposable>) {
        self.inner.scopes.borrow_mut().register(item);
    }

    /// Run `f` in a new disposal scope
    ///
    /// Arrays reachable from the returned value survive and move to the
    /// enclosing scope; everything else registered inside is released, also
    /// when `f` fails or panics.
    ///
    /// # Errors
    /// Whatever `f` returns.
    pub fn scoped<R: Retain>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        self.run_scope(&(), f)
    }

    /// One training step: `keep` lists state that must outlive the step
    /// (parameters, optimizer moments)
    ///
    /// Advances the leak detector epoch when one is configured.
    ///
    /// # Errors
    /// Whatever `f` returns.
    pub fn model_iteration<K, R>(&self, keep: &K, f: impl FnOnce(&Self) -> Result<R>) -> Result<R>
    where
        K: Retain + ?Sized,
        R: Retain,
    {
        let result = self.run_scope(keep, f);
        if let Some(det) = &self.inner.leaks {
            det.advance_epoch();
        }
        result
    }

    fn run_scope<K: Retain + ?Sized, R: Retain>(
        &self,
        state: &K,
        f: impl FnOnce(&Self) -> Result<R>,
    ) -> Result<R> {
        self.inner.scopes.borrow_mut().push();
        let mut guard = ScopeGuard {
            ctx: self,
            state,
            keep: HashSet::new(),
        };
        let result = f(self);
        if let Ok(value) = &result {
            value.retain_into(&mut guard.keep);
        }
        drop(guard);
        result
    }

    // ===== FACTORIES =====

    /// Wrap freshly produced storage and register it
    pub(crate) fn wrap(&self, storage: B::Storage, shape: Shape) -> DenseArray<B> {
        let handle = Arc::new(ArrayHandle::new(storage, self.inner.leaks.as_ref()));
        self.register(handle.clone());
        DenseArray::from_parts(shape, handle, self.clone())
    }

    /// Register an additional view handle
    pub(crate) fn adopt_view(
        &self,
        handle: ArrayHandle<B::Storage>,
        shape: Shape,
    ) -> DenseArray<B> {
        let handle = Arc::new(handle);
        self.register(handle.clone());
        DenseArray::from_parts(shape, handle, self.clone())
    }

    /// Upload row-major data for `shape`
    pub(crate) fn upload(&self, data: Vec<f32>, shape: Shape) -> Result<DenseArray<B>> {
        let storage = self.inner.backend.upload(data)?;
        Ok(self.wrap(storage, shape))
    }

    /// # Errors
    /// `InvalidShape` for bad dims, `ShapeDataMismatch` when `data` does not
    /// fill the shape exactly.
    pub fn from_vec(&self, data: Vec<f32>, dims: &[usize]) -> Result<DenseArray<B>> {
        let shape = Shape::new(dims)?;
        if data.len() != shape.size() {
            return Err(KilnError::ShapeDataMismatch {
                shape: dims.to_vec(),
                elements: shape.size(),
                len: data.len(),
            });
        }
        self.upload(data, shape)
    }

    /// Single-element array of shape `[1]`
    ///
    /// # Errors
    /// Allocation failures.
    pub fn scalar(&self, value: f32) -> Result<DenseArray<B>> {
        self.upload(vec![value], Shape::scalar())
    }

    /// Array from nested arrays or vectors, e.g. `&[[1.0, 2.0], [3.0, 4.0]]`
    ///
    /// # Errors
    /// `InvalidShape` for empty or ragged input.
    pub fn literal<L: IntoLiteral + ?Sized>(&self, value: &L) -> Result<DenseArray<B>> {
        let mut dims = value.literal_dims()?;
        if dims.is_empty() {
            dims.push(1);
        }
        let mut data = Vec::with_capacity(dims.iter().product());
        value.push_values(&mut data);
        self.from_vec(data, &dims)
    }

    /// # Errors
    /// `InvalidShape` for bad dims.
    pub fn full(&self, dims: &[usize], value: f32) -> Result<DenseArray<B>> {
        let shape = Shape::new(dims)?;
        self.upload(vec![value; shape.size()], shape)
    }

    /// # Errors
    /// `InvalidShape` for bad dims.
    pub fn zeros(&self, dims: &[usize]) -> Result<DenseArray<B>> {
        self.full(dims, 0.0)
    }

    /// # Errors
    /// `InvalidShape` for bad dims.
    pub fn ones(&self, dims: &[usize]) -> Result<DenseArray<B>> {
        self.full(dims, 1.0)
    }

    /// Values drawn uniformly from `[low, high)`
    ///
    /// # Errors
    /// `InvalidParameter` unless `low < high`.
    pub fn uniform(&self, dims: &[usize], low: f32, high: f32) -> Result<DenseArray<B>> {
        if !(low < high) {
            return Err(KilnError::InvalidParameter(format!(
                "uniform range [{low}, {high}) is empty"
            )));
        }
        let shape = Shape::new(dims)?;
        let data = self.with_rng(|rng| {
            (0..shape.size())
                .map(|_| rng.random_range(low..high))
                .collect()
        });
        self.upload(data, shape)
    }

    /// Values drawn from N(mean, std²)
    ///
    /// # Errors
    /// `InvalidParameter` for a negative or non-finite `std`.
    pub fn normal(&self, dims: &[usize], mean: f32, std: f32) -> Result<DenseArray<B>> {
        if !(std >= 0.0 && std.is_finite() && mean.is_finite()) {
            return Err(KilnError::InvalidParameter(format!(
                "normal({mean}, {std}) needs a finite mean and a finite non-negative std"
            )));
        }
        let dist = Normal::new(mean, std)
            .map_err(|e| KilnError::InvalidParameter(format!("normal({mean}, {std}): {e}")))?;
        let shape = Shape::new(dims)?;
        let data = self.with_rng(|rng| (0..shape.size()).map(|_| dist.sample(rng)).collect());
        self.upload(data, shape)
    }

    /// Zero-filled staging buffer, frozen into an array once written
    ///
    /// # Errors
    /// `InvalidShape` for bad dims.
    pub fn mutable(&self, dims: &[usize]) -> Result<MutableArray<B>> {
        MutableArray::new(self.clone(), Shape::new(dims)?)
    }
}

/// Nested literal input for [`Context::literal`]
pub trait IntoLiteral {
    /// Dimensions of the literal (empty for a bare number)
    ///
    /// # Errors
    /// `InvalidShape` for empty or ragged nesting.
    fn literal_dims(&self) -> Result<Vec<usize>>;
    fn push_values(&self, out: &mut Vec<f32>);
}

impl IntoLiteral for f32 {
    fn literal_dims(&self) -> Result<Vec<usize>> {
        Ok(Vec::new())
    }

    fn push_values(&self, out: &mut Vec<f32>) {
        out.push(*self);
    }
}

impl IntoLiteral for f64 {
    fn literal_dims(&self) -> Result<Vec<usize>> {
        Ok(Vec::new())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_values(&self, out: &mut Vec<f32>) {
        out.push(*self as f32);
    }
}

impl<T: IntoLiteral> IntoLiteral for [T] {
    fn literal_dims(&self) -> Result<Vec<usize>> {
        let Some(first) = self.first() else {
            return Err(KilnError::InvalidShape("empty literal".into()));
        };
        let inner = first.literal_dims()?;
        for item in &self[1..] {
            if item.literal_dims()? != inner {
                return Err(KilnError::InvalidShape("ragged literal".into()));
            }
        }
        let mut dims = Vec::with_capacity(inner.len() + 1);
        dims.push(self.len());
        dims.extend(inner);
        Ok(dims)
    }

    fn push_values(&self, out: &mut Vec<f32>) {
        for item in self {
            item.push_values(out);
        }
    }
}

impl<T: IntoLiteral, const N: usize> IntoLiteral for [T; N] {
    fn literal_dims(&self) -> Result<Vec<usize>> {
        self.as_slice().literal_dims()
    }

    fn push_values(&self, out: &mut Vec<f32>) {
        self.as_slice().push_values(out);
    }
}

impl<T: IntoLiteral> IntoLiteral for Vec<T> {
    fn literal_dims(&self) -> Result<Vec<usize>> {
        self.as_slice().literal_dims()
    }

    fn push_values(&self, out: &mut Vec<f32>) {
        self.as_slice().push_values(out);
    }
}
