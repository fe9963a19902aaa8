//! Backend providers
//!
//! A [`Backend`] owns the physical storage behind dense arrays. Arrays are
//! generic over their backend, so mixing host and accelerator buffers in one
//! operation does not type-check.
//!
//! The contiguous fast paths (`zip`, `map`, `matmul`) are routed through the
//! backend; providers without native kernels inherit host implementations
//! that run on the partitioner.

pub mod host;

#[cfg(feature = "gpu")]
pub mod accel;

pub use host::Host;

#[cfg(feature = "gpu")]
pub use accel::Accel;

use crate::error::Result;
use crate::parallel::Partitioner;
use crate::shape::MatMulShape;

/// Elementwise binary operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    /// 1.0 where `a > b`
    Gt,
    /// 1.0 where `a < b`
    Lt,
    /// 1.0 where `a == b`
    Eq,
}

impl BinaryOp {
    #[inline]
    #[must_use]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Maximum => a.max(b),
            Self::Gt => f32::from(u8::from(a > b)),
            Self::Lt => f32::from(u8::from(a < b)),
            Self::Eq => f32::from(u8::from(a == b)),
        }
    }
}

/// Elementwise unary operations, with their scalar parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Neg,
    Square,
    Sqrt,
    Pow(f32),
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Abs,
    Clip(f32, f32),
    Scale(f32),
    AddScalar(f32),
    /// 1.0 inside `[lo, hi]`, else 0.0
    InRange(f32, f32),
}

impl UnaryOp {
    #[inline]
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Neg => -x,
            Self::Square => x * x,
            Self::Sqrt => x.sqrt(),
            Self::Pow(p) => x.powf(p),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Abs => x.abs(),
            Self::Clip(lo, hi) => x.clamp(lo, hi),
            Self::Scale(s) => x * s,
            Self::AddScalar(s) => x + s,
            Self::InRange(lo, hi) => f32::from(u8::from(x >= lo && x <= hi)),
        }
    }
}

pub trait Backend: Sized + 'static {
    /// Physical buffer type
    type Storage: 'static;

    fn name(&self) -> &'static str;

    /// Worker pool for host-side kernels
    fn partitioner(&self) -> &Partitioner;

    /// Move host data into a new buffer
    ///
    /// # Errors
    /// `DeviceOperationFailed` when the provider cannot allocate.
    fn upload(&self, data: Vec<f32>) -> Result<Self::Storage>;

    /// Run `f` over the raw buffer contents, waiting for pending writes first
    ///
    /// # Errors
    /// `DeviceOperationFailed` when the read-back fails.
    fn read<R>(&self, storage: &Self::Storage, f: impl FnOnce(&[f32]) -> R) -> Result<R>;

    /// Raw element count of a buffer
    fn len(&self, storage: &Self::Storage) -> usize;

    /// Position-for-position binary op over two equally sized buffers
    ///
    /// # Errors
    /// Read-back or allocation failures.
    fn zip(&self, op: BinaryOp, a: &Self::Storage, b: &Self::Storage) -> Result<Self::Storage> {
        let out = self.read(a, |xa| {
            self.read(b, |xb| host::zip_slices(self.partitioner(), op, xa, xb))
        })???;
        self.upload(out)
    }

    /// Scalar map over a buffer
    ///
    /// # Errors
    /// Read-back or allocation failures.
    fn map(&self, op: UnaryOp, a: &Self::Storage) -> Result<Self::Storage> {
        let out = self.read(a, |xa| host::map_slice(self.partitioner(), op, xa))?;
        self.upload(out)
    }

    /// Batched matrix product of two canonical buffers
    ///
    /// # Errors
    /// Read-back or allocation failures.
    fn matmul(
        &self,
        a: &Self::Storage,
        b: &Self::Storage,
        mm: &MatMulShape,
    ) -> Result<Self::Storage> {
        let out = self.read(a, |xa| {
            self.read(b, |xb| host::matmul_slices(self.partitioner(), xa, xb, mm))
        })??;
        self.upload(out)
    }
}
