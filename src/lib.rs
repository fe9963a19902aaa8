//! Dense f32 tensors with NumPy-style broadcasting, reverse-mode autodiff and
//! scoped buffer disposal.
//!
//! Arrays live on a [`Backend`]: the in-process [`Host`] provider, or with
//! the `gpu` feature the wgpu [`Accel`] provider. A [`Context`] owns the
//! provider, the worker pool and the disposal scopes.
//!
//! ```
//! use kiln::{Context, RawTensor, TensorOps};
//!
//! # fn main() -> kiln::Result<()> {
//! let ctx = Context::host()?;
//! let x = RawTensor::param(ctx.literal(&[1.0, 2.0, 3.0])?);
//! let loss = x.sqr()?.sum_all()?;
//! loss.backward()?;
//! assert_eq!(x.grad().unwrap().to_vec()?, vec![2.0, 4.0, 6.0]);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod autograd;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod dispose;
pub mod error;
pub mod leak;
pub mod parallel;
pub mod shape;
pub mod tensor;

pub use array::{Conv2dParams, DenseArray, MutableArray};
pub use autograd::{GradContext, GradFn, grad_fn};
pub use backend::{Backend, BinaryOp, Host, UnaryOp};
pub use config::EngineConfig;
pub use context::{Context, IntoLiteral};
pub use dispose::{Disposable, Retain};
pub use error::{KilnError, Result};
pub use leak::{LeakDetector, LeakReport};
pub use parallel::Partitioner;
pub use shape::{MatMulShape, ReduceMode, Shape};
pub use tensor::{
    Forward, RawTensor, Tensor, TensorOps, check_gradients, check_gradients_simple,
};

#[cfg(feature = "gpu")]
pub use backend::Accel;
