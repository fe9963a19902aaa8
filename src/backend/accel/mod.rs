//! wgpu accelerator backend
//!
//! Buffers live in device memory and are reached through the command queue.
//! Every kernel submission is asynchronous: the output [`GpuBuffer`] records
//! the submission index that produces it, and read-back and release wait on
//! that index. Allocation failures are retried with linear backoff.

mod context;
mod kernels;
mod pool;

pub use context::GpuContext;
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats};

use super::{Backend, BinaryOp, UnaryOp, host};
use crate::config::EngineConfig;
use crate::error::{KilnError, Result};
use crate::parallel::Partitioner;
use crate::shape::MatMulShape;
use log::warn;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Run `f` up to `attempts` times, sleeping `backoff * attempt` in between
///
/// # Errors
/// `DeviceOperationFailed` carrying the last failure.
pub fn with_retry<T>(
    op: &'static str,
    attempts: u32,
    backoff: Duration,
    mut f: impl FnMut() -> std::result::Result<T, String>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut reason = String::new();
    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{op} failed (attempt {attempt}/{attempts}): {e}");
                reason = e;
                if attempt < attempts {
                    std::thread::sleep(backoff * attempt);
                }
            }
        }
    }
    Err(KilnError::DeviceOperationFailed {
        op,
        attempts,
        reason,
    })
}

/// A buffer in device memory
///
/// Returned to the pool on drop once its producing submission has finished.
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
    pending: Mutex<Option<wgpu::SubmissionIndex>>,
    device: wgpu::Device,
    pool: Arc<BufferPool>,
    timeout: Duration,
}

impl GpuBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn byte_len(&self) -> u64 {
        (self.len * F32_BYTES) as u64
    }

    fn set_pending(&self, index: wgpu::SubmissionIndex) {
        *self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(index);
    }

    /// Whether a producing submission may still be running
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }

    /// Block until the producing submission completes
    ///
    /// # Errors
    /// `DeviceOperationFailed` when the wait times out or the device is lost.
    pub fn wait(&self) -> Result<()> {
        let index = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(index) = index else {
            return Ok(());
        };
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(index),
                timeout: Some(self.timeout),
            })
            .map_err(|e| KilnError::DeviceOperationFailed {
                op: "wait",
                attempts: 1,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            warn!("dropping a device buffer whose submission did not finish: {e}");
            return;
        }
        let bytes = self.len * F32_BYTES;
        self.pool.release(self.buffer.clone(), bytes);
    }
}

/// Accelerator provider over a wgpu device
pub struct Accel {
    gpu: GpuContext,
    pool: Arc<BufferPool>,
    staging: BufferPool,
    partitioner: Partitioner,
    retries: u32,
    backoff: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for Accel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accel")
            .field("device", &self.gpu.device_name())
            .field("pool", &self.pool.stats())
            .finish_non_exhaustive()
    }
}

impl Accel {
    /// # Errors
    /// `BackendUnavailable` when no adapter or device can be acquired.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_pool(config, BufferPoolConfig::default())
    }

    /// # Errors
    /// `BackendUnavailable` when no adapter or device can be acquired.
    pub fn with_pool(config: &EngineConfig, pool: BufferPoolConfig) -> Result<Self> {
        Ok(Self {
            gpu: GpuContext::new()?,
            pool: Arc::new(BufferPool::new(pool.clone())),
            staging: BufferPool::new(pool),
            partitioner: Partitioner::from_config(config)?,
            retries: config.device_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: Duration::from_secs(config.sync_timeout_secs),
        })
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        self.gpu.device_name()
    }

    #[must_use]
    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Whether `len` values can be bound to a single kernel
    fn fits(&self, len: usize) -> bool {
        let limit = self.gpu.device().limits().max_storage_buffer_binding_size;
        (len * F32_BYTES) as u64 <= u64::from(limit)
    }

    /// Create a device buffer, retrying out-of-memory failures
    fn create_buffer(
        &self,
        label: &str,
        bytes: usize,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer> {
        let device = self.gpu.device();
        with_retry("allocate", self.retries, self.backoff, || {
            device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes as u64,
                usage,
                mapped_at_creation: false,
            });
            let validation = pollster::block_on(device.pop_error_scope());
            let oom = pollster::block_on(device.pop_error_scope());
            match validation.or(oom) {
                Some(e) => Err(e.to_string()),
                None => Ok(buffer),
            }
        })
    }

    /// Storage buffer for `len` values, pooled when possible
    fn allocate(&self, len: usize) -> Result<GpuBuffer> {
        let bytes = len.max(1) * F32_BYTES;
        let buffer = match self.pool.acquire(bytes) {
            Some(buffer) => buffer,
            None => self.create_buffer(
                "kiln array",
                BufferPool::<wgpu::Buffer>::allocation_size(bytes),
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            )?,
        };
        Ok(GpuBuffer {
            buffer,
            len,
            pending: Mutex::new(None),
            device: self.gpu.device().clone(),
            pool: Arc::clone(&self.pool),
            timeout: self.timeout,
        })
    }

    fn read_back(&self, storage: &GpuBuffer) -> Result<Vec<f32>> {
        storage.wait()?;
        let bytes = storage.len * F32_BYTES;
        let staging = match self.staging.acquire(bytes) {
            Some(buffer) => buffer,
            None => self.create_buffer(
                "kiln staging",
                BufferPool::<wgpu::Buffer>::allocation_size(bytes),
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            )?,
        };

        let device = self.gpu.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kiln read-back"),
        });
        encoder.copy_buffer_to_buffer(storage.raw(), 0, &staging, 0, bytes as u64);
        let index = self.gpu.queue().submit(Some(encoder.finish()));

        let slice = staging.slice(..bytes as u64);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let failed = |reason: String| KilnError::DeviceOperationFailed {
            op: "read",
            attempts: 1,
            reason,
        };
        device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(index),
                timeout: Some(self.timeout),
            })
            .map_err(|e| failed(e.to_string()))?;
        receiver
            .recv()
            .map_err(|e| failed(e.to_string()))?
            .map_err(|e| failed(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let data = bytemuck::cast_slice::<u8, f32>(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        self.staging.release(staging, bytes);
        Ok(data)
    }
}

impl Backend for Accel {
    type Storage = GpuBuffer;

    fn name(&self) -> &'static str {
        "accel"
    }

    fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    fn upload(&self, data: Vec<f32>) -> Result<GpuBuffer> {
        let out = self.allocate(data.len())?;
        self.gpu
            .queue()
            .write_buffer(out.raw(), 0, bytemuck::cast_slice(&data));
        Ok(out)
    }

    fn read<R>(&self, storage: &GpuBuffer, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        let data = self.read_back(storage)?;
        Ok(f(&data))
    }

    fn len(&self, storage: &GpuBuffer) -> usize {
        storage.len
    }

    fn zip(&self, op: BinaryOp, a: &GpuBuffer, b: &GpuBuffer) -> Result<GpuBuffer> {
        if a.len != b.len {
            return Err(KilnError::ShapeDataMismatch {
                shape: vec![a.len],
                elements: a.len,
                len: b.len,
            });
        }
        if self.fits(a.len) {
            return self.binary_kernel(op, a, b);
        }
        let xa = self.read_back(a)?;
        let xb = self.read_back(b)?;
        self.upload(host::zip_slices(&self.partitioner, op, &xa, &xb)?)
    }

    fn map(&self, op: UnaryOp, a: &GpuBuffer) -> Result<GpuBuffer> {
        if self.fits(a.len) {
            return self.unary_kernel(op, a);
        }
        let xa = self.read_back(a)?;
        self.upload(host::map_slice(&self.partitioner, op, &xa))
    }

    fn matmul(&self, a: &GpuBuffer, b: &GpuBuffer, mm: &MatMulShape) -> Result<GpuBuffer> {
        let out_len = mm.batch_size() * mm.m * mm.n;
        if Self::matmul_fits(mm) && self.fits(a.len.max(b.len).max(out_len)) {
            return self.matmul_kernel(a, b, mm);
        }
        let xa = self.read_back(a)?;
        let xb = self.read_back(b)?;
        self.upload(host::matmul_slices(&self.partitioner, &xa, &xb, mm))
    }
}
