use super::DenseArray;
use crate::backend::{Backend, BinaryOp, UnaryOp, host};
use crate::error::Result;
use crate::shape::Shape;

impl<B: Backend> DenseArray<B> {
    /// Elementwise binary op with broadcasting
    ///
    /// Identical row-major shapes go straight to the backend; anything else
    /// is read through broadcast offsets.
    ///
    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn zip(&self, other: &Self, op: BinaryOp) -> Result<Self> {
        let ctx = self.context();
        if self.dims() == other.dims() && self.is_canonical() && other.is_canonical() {
            let out = ctx
                .backend()
                .zip(op, &*self.storage()?, &*other.storage()?)?;
            return Ok(ctx.wrap(out, self.shape().to_canonical()));
        }
        let out_shape = self.shape().broadcast(other.shape())?;
        let data = self.raw(|a| {
            other.raw(|b| {
                host::broadcast_zip(
                    ctx.partitioner(),
                    op,
                    (a, self.shape()),
                    (b, other.shape()),
                    &out_shape,
                )
            })
        })??;
        self.derive(data, out_shape)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Add)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Sub)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Mul)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn div(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Div)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn maximum(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Maximum)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn gt(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Gt)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn lt(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Lt)
    }

    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast.
    pub fn eq(&self, other: &Self) -> Result<Self> {
        self.zip(other, BinaryOp::Eq)
    }

    /// Scalar map over every element
    ///
    /// # Errors
    /// `AlreadyReleased`, or a device failure.
    pub fn map(&self, op: UnaryOp) -> Result<Self> {
        let src = self.materialized()?;
        let ctx = self.context();
        let out = ctx.backend().map(op, &*src.storage()?)?;
        Ok(ctx.wrap(out, self.shape().to_canonical()))
    }

    pub fn neg(&self) -> Result<Self> {
        self.map(UnaryOp::Neg)
    }

    pub fn square(&self) -> Result<Self> {
        self.map(UnaryOp::Square)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.map(UnaryOp::Sqrt)
    }

    pub fn pow(&self, p: f32) -> Result<Self> {
        self.map(UnaryOp::Pow(p))
    }

    pub fn exp(&self) -> Result<Self> {
        self.map(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.map(UnaryOp::Log)
    }

    pub fn sin(&self) -> Result<Self> {
        self.map(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Self> {
        self.map(UnaryOp::Cos)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.map(UnaryOp::Tanh)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.map(UnaryOp::Sigmoid)
    }

    pub fn abs(&self) -> Result<Self> {
        self.map(UnaryOp::Abs)
    }

    pub fn clip(&self, lo: f32, hi: f32) -> Result<Self> {
        self.map(UnaryOp::Clip(lo, hi))
    }

    pub fn scale(&self, s: f32) -> Result<Self> {
        self.map(UnaryOp::Scale(s))
    }

    pub fn add_scalar(&self, s: f32) -> Result<Self> {
        self.map(UnaryOp::AddScalar(s))
    }

    /// 1.0 where `lo <= x <= hi`
    pub fn in_range(&self, lo: f32, hi: f32) -> Result<Self> {
        self.map(UnaryOp::InRange(lo, hi))
    }

    /// Materialize a broadcast of this array to `dims`
    ///
    /// # Errors
    /// `IncompatibleShape` when the shapes do not broadcast to `dims`.
    pub fn broadcast_to(&self, dims: &[usize]) -> Result<Self> {
        let target = Shape::new(dims)?;
        let out = self.shape().broadcast(&target)?;
        if out.dims() != dims {
            return Err(crate::error::KilnError::IncompatibleShape(
                self.dims().to_vec(),
                dims.to_vec(),
            ));
        }
        if self.dims() == dims {
            return self.contiguous();
        }
        let src = self.shape();
        let data = self.raw(|a| {
            let mut buf = vec![0.0; out.size()];
            self.context().partitioner().fill(&mut buf, |start, chunk| {
                let mut coords = vec![0usize; out.rank()];
                for (i, o) in chunk.iter_mut().enumerate() {
                    out.unravel(start + i, &mut coords);
                    *o = a[src.broadcast_offset(&coords)];
                }
            });
            buf
        })?;
        self.derive(data, out)
    }
}
