//! Host backend and the host kernels shared by every provider

use super::{Backend, BinaryOp, UnaryOp};
use crate::config::EngineConfig;
use crate::error::{KilnError, Result};
use crate::parallel::{Partitioner, matmul_min_rows};
use crate::shape::{MatMulShape, Shape};

/// In-process backend over `Vec<f32>`
#[derive(Debug)]
pub struct Host {
    partitioner: Partitioner,
}

impl Host {
    /// # Errors
    /// `BackendUnavailable` when the worker pool cannot start.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            partitioner: Partitioner::from_config(config)?,
        })
    }

    #[must_use]
    pub fn with_partitioner(partitioner: Partitioner) -> Self {
        Self { partitioner }
    }
}

impl Backend for Host {
    type Storage = Vec<f32>;

    fn name(&self) -> &'static str {
        "host"
    }

    fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    fn upload(&self, data: Vec<f32>) -> Result<Vec<f32>> {
        Ok(data)
    }

    fn read<R>(&self, storage: &Vec<f32>, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        Ok(f(storage))
    }

    fn len(&self, storage: &Vec<f32>) -> usize {
        storage.len()
    }
}

/// Position-for-position binary op
///
/// # Errors
/// `ShapeDataMismatch` when the slices differ in length.
pub fn zip_slices(part: &Partitioner, op: BinaryOp, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    if a.len() != b.len() {
        return Err(KilnError::ShapeDataMismatch {
            shape: vec![a.len()],
            elements: a.len(),
            len: b.len(),
        });
    }
    let mut out = vec![0.0; a.len()];
    part.fill(&mut out, |start, chunk| {
        let end = start + chunk.len();
        for ((o, &x), &y) in chunk.iter_mut().zip(&a[start..end]).zip(&b[start..end]) {
            *o = op.apply(x, y);
        }
    });
    Ok(out)
}

#[must_use]
pub fn map_slice(part: &Partitioner, op: UnaryOp, a: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; a.len()];
    part.fill(&mut out, |start, chunk| {
        let end = start + chunk.len();
        for (o, &x) in chunk.iter_mut().zip(&a[start..end]) {
            *o = op.apply(x);
        }
    });
    out
}

/// Copy a strided view into row-major order
#[must_use]
pub fn gather_strided(part: &Partitioner, data: &[f32], shape: &Shape) -> Vec<f32> {
    let mut out = vec![0.0; shape.size()];
    part.fill(&mut out, |start, chunk| {
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = data[shape.offset_of_linear(start + i)];
        }
    });
    out
}

/// Binary op reading both operands through broadcast offsets
#[must_use]
pub fn broadcast_zip(
    part: &Partitioner,
    op: BinaryOp,
    (a, a_shape): (&[f32], &Shape),
    (b, b_shape): (&[f32], &Shape),
    out_shape: &Shape,
) -> Vec<f32> {
    let mut out = vec![0.0; out_shape.size()];
    part.fill(&mut out, |start, chunk| {
        let mut coords = vec![0usize; out_shape.rank()];
        for (i, o) in chunk.iter_mut().enumerate() {
            out_shape.unravel(start + i, &mut coords);
            let x = a[a_shape.broadcast_offset(&coords)];
            let y = b[b_shape.broadcast_offset(&coords)];
            *o = op.apply(x, y);
        }
    });
    out
}

/// Offset of batch `linear` (over `out_batch`) inside a source whose batch
/// dims broadcast to it, in units of whole matrices
pub(crate) fn batch_index(out_batch: &[usize], src: &[usize], mut linear: usize) -> usize {
    let lead = out_batch.len() - src.len();
    let mut idx = 0;
    let mut stride = 1;
    for axis in (0..out_batch.len()).rev() {
        let c = linear % out_batch[axis];
        linear /= out_batch[axis];
        if axis >= lead {
            let d = src[axis - lead];
            if d != 1 {
                idx += c * stride;
            }
            stride *= d;
        }
    }
    idx
}

/// Batched row-major matrix product, partitioned by output rows
#[must_use]
pub fn matmul_slices(part: &Partitioner, a: &[f32], b: &[f32], mm: &MatMulShape) -> Vec<f32> {
    let (m, k, n) = (mm.m, mm.k, mm.n);
    let left_batch = &mm.left[..mm.left.len() - 2];
    let right_batch = &mm.right[..mm.right.len() - 2];
    let mut out = vec![0.0; mm.batch_size() * m * n];
    part.fill_rows(&mut out, n, matmul_min_rows(k, n), |first_row, chunk| {
        for (r, row) in chunk.chunks_mut(n).enumerate() {
            let global = first_row + r;
            let (bi, i) = (global / m, global % m);
            let a_row = batch_index(&mm.batch, left_batch, bi) * m * k + i * k;
            let b_mat = batch_index(&mm.batch, right_batch, bi) * k * n;
            for p in 0..k {
                let av = a[a_row + p];
                let b_row = &b[b_mat + p * n..b_mat + (p + 1) * n];
                for (o, &bv) in row.iter_mut().zip(b_row) {
                    *o += av * bv;
                }
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part() -> Partitioner {
        Partitioner::new(2, 4).unwrap()
    }

    #[test]
    fn zip_rejects_length_mismatch() {
        let err = zip_slices(&part(), BinaryOp::Add, &[1.0, 2.0], &[1.0]).unwrap_err();
        assert!(matches!(err, KilnError::ShapeDataMismatch { .. }));
    }

    #[test]
    fn broadcast_reuses_unit_axes() {
        let a = Shape::new(&[3, 1]).unwrap();
        let b = Shape::new(&[1, 2]).unwrap();
        let out = a.broadcast(&b).unwrap();
        let r = broadcast_zip(
            &part(),
            BinaryOp::Mul,
            (&[1.0, 2.0, 3.0], &a),
            (&[10.0, 100.0], &b),
            &out,
        );
        assert_eq!(r, vec![10.0, 100.0, 20.0, 200.0, 30.0, 300.0]);
    }

    #[test]
    fn batched_matmul_broadcasts_the_right_operand() {
        // two 2x2 left matrices against one shared 2x1 right matrix
        let mm = MatMulShape::resolve(&[2, 2, 2], &[2, 1]).unwrap();
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let b = [1.0, 1.0];
        assert_eq!(matmul_slices(&part(), &a, &b, &mm), vec![3.0, 7.0, 11.0, 15.0]);
    }

    #[test]
    fn matmul_keeps_non_finite_products_of_zero() {
        let mm = MatMulShape::resolve(&[1, 2], &[2, 1]).unwrap();
        let nan = matmul_slices(&part(), &[0.0, 1.0], &[f32::NAN, 2.0], &mm);
        assert!(nan[0].is_nan());
        let inf = matmul_slices(&part(), &[0.0, 1.0], &[f32::INFINITY, 2.0], &mm);
        assert!(inf[0].is_nan());
    }

    #[test]
    fn default_zip_and_map_go_through_host_kernels() {
        let host = Host::with_partitioner(part());
        let a = host.upload(vec![1.0, 2.0, 3.0]).unwrap();
        let b = host.upload(vec![4.0, 5.0, 6.0]).unwrap();
        assert_eq!(host.zip(BinaryOp::Mul, &a, &b).unwrap(), vec![4.0, 10.0, 18.0]);
        assert_eq!(host.map(UnaryOp::Neg, &a).unwrap(), vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn strided_gather_follows_transpose() {
        let s = Shape::new(&[2, 3]).unwrap().transpose(None).unwrap();
        let data = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(gather_strided(&part(), &data, &s), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }
}
