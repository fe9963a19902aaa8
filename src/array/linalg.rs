use super::DenseArray;
use crate::backend::Backend;
use crate::error::Result;
use crate::shape::{MatMulShape, Shape};

impl<B: Backend> DenseArray<B> {
    /// Matrix product with rank-1 promotion and batch broadcasting
    ///
    /// - (m, k) @ (k, n) -> (m, n)
    /// - (k) @ (k, n) -> (n)
    /// - (b, m, k) @ (k, n) -> (b, m, n)
    ///
    /// # Errors
    /// `IncompatibleMatMulShape` when the contracted sizes differ or the
    /// batch axes do not broadcast.
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        let mm = MatMulShape::resolve(self.dims(), other.dims())?;
        let a = self.materialized()?;
        let b = other.materialized()?;
        let ctx = self.context();
        let out = ctx.backend().matmul(&*a.storage()?, &*b.storage()?, &mm)?;
        Ok(ctx.wrap(out, Shape::new(&mm.out)?))
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::Host;
    use crate::config::EngineConfig;
    use crate::context::Context;
    use crate::error::KilnError;

    fn ctx() -> Context<Host> {
        Context::host_with(EngineConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn matrix_times_matrix() {
        let ctx = ctx();
        let a = ctx.literal(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        let b = ctx.literal(&[[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.to_vec().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn vector_operands_are_squeezed() {
        let ctx = ctx();
        let v = ctx.literal(&[1.0, 1.0]).unwrap();
        let m = ctx.literal(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let left = v.matmul(&m).unwrap();
        assert_eq!(left.dims(), &[2]);
        assert_eq!(left.to_vec().unwrap(), vec![4.0, 6.0]);
        let right = m.matmul(&v).unwrap();
        assert_eq!(right.to_vec().unwrap(), vec![3.0, 7.0]);
        assert_eq!(v.matmul(&v).unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn transposed_operand() {
        let ctx = ctx();
        let a = ctx.literal(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let at = a.transpose(None).unwrap();
        assert_eq!(
            at.matmul(&a).unwrap().to_vec().unwrap(),
            vec![10.0, 14.0, 14.0, 20.0]
        );
    }

    #[test]
    fn contracted_mismatch() {
        let ctx = ctx();
        let a = ctx.zeros(&[2, 3]).unwrap();
        assert!(matches!(
            a.matmul(&a),
            Err(KilnError::IncompatibleMatMulShape { .. })
        ));
    }
}
