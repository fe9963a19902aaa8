//! Data-parallel partitioner
//!
//! Every call blocks until all sub-ranges have completed. Output slices are
//! split with `split_at_mut`, so no two workers ever write the same element.

use crate::config::EngineConfig;
use crate::error::{KilnError, Result};
use log::trace;
use std::ops::Range;

/// Minimum multiply-adds a matmul worker should own before splitting further
pub const MATMUL_MIN_WORK: usize = 32 * 1024;

/// Smallest number of output rows worth a separate matmul task
///
/// Each row costs `values_per_dot * outputs_per_row` multiply-adds.
#[must_use]
pub fn matmul_min_rows(values_per_dot: usize, outputs_per_row: usize) -> usize {
    let per_row = values_per_dot.saturating_mul(outputs_per_row).max(1);
    (MATMUL_MIN_WORK / per_row).max(1)
}

pub struct Partitioner {
    pool: rayon::ThreadPool,
    min_chunk: usize,
}

impl std::fmt::Debug for Partitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partitioner")
            .field("threads", &self.pool.current_num_threads())
            .field("min_chunk", &self.min_chunk)
            .finish()
    }
}

impl Partitioner {
    /// # Errors
    /// `BackendUnavailable` when the worker pool cannot be spawned.
    pub fn new(threads: usize, min_chunk: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| KilnError::BackendUnavailable(format!("worker pool: {e}")))?;
        Ok(Self {
            pool,
            min_chunk: min_chunk.max(1),
        })
    }

    /// # Errors
    /// See [`Partitioner::new`].
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.worker_threads(), config.min_chunk)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    #[must_use]
    pub fn min_chunk(&self) -> usize {
        self.min_chunk
    }

    /// Fill `out` in parallel; `f(start, chunk)` writes elements
    /// `start..start + chunk.len()`
    pub fn fill<F>(&self, out: &mut [f32], f: F)
    where
        F: Fn(usize, &mut [f32]) + Sync,
    {
        if out.len() <= self.min_chunk {
            f(0, out);
            return;
        }
        trace!(
            "partitioning {} elements, min chunk {}",
            out.len(),
            self.min_chunk
        );
        let min = self.min_chunk;
        self.pool.install(|| halve(out, 0, min, &f));
    }

    /// Like [`Partitioner::fill`] but never splits a row of `row_len`
    /// elements, and keeps at least `min_rows` rows per task
    pub fn fill_rows<F>(&self, out: &mut [f32], row_len: usize, min_rows: usize, f: F)
    where
        F: Fn(usize, &mut [f32]) + Sync,
    {
        let row_len = row_len.max(1);
        let rows = out.len() / row_len;
        let min_rows = min_rows.max(1);
        if rows <= min_rows {
            f(0, out);
            return;
        }
        trace!("partitioning {rows} rows of {row_len}, min {min_rows} rows per task");
        self.pool
            .install(|| halve_rows(out, 0, row_len, min_rows, &f));
    }

    /// Split `0..len` down to the minimum chunk, map each leaf range and merge
    /// sibling results pairwise
    pub fn map_reduce<T, M, R>(&self, len: usize, map: M, reduce: R) -> T
    where
        T: Send,
        M: Fn(Range<usize>) -> T + Sync,
        R: Fn(T, T) -> T + Sync,
    {
        if len <= self.min_chunk {
            return map(0..len);
        }
        let min = self.min_chunk;
        self.pool
            .install(|| split_range(0..len, min, &map, &reduce))
    }
}

fn halve<F>(out: &mut [f32], start: usize, min: usize, f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if out.len() <= min {
        f(start, out);
        return;
    }
    let mid = out.len() / 2;
    let (left, right) = out.split_at_mut(mid);
    rayon::join(
        || halve(left, start, min, f),
        || halve(right, start + mid, min, f),
    );
}

fn halve_rows<F>(out: &mut [f32], first_row: usize, row_len: usize, min_rows: usize, f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let rows = out.len() / row_len;
    if rows <= min_rows {
        f(first_row, out);
        return;
    }
    let mid = rows / 2;
    let (top, bottom) = out.split_at_mut(mid * row_len);
    rayon::join(
        || halve_rows(top, first_row, row_len, min_rows, f),
        || halve_rows(bottom, first_row + mid, row_len, min_rows, f),
    );
}

fn split_range<T, M, R>(range: Range<usize>, min: usize, map: &M, reduce: &R) -> T
where
    T: Send,
    M: Fn(Range<usize>) -> T + Sync,
    R: Fn(T, T) -> T + Sync,
{
    if range.len() <= min {
        return map(range);
    }
    let mid = range.start + range.len() / 2;
    let (a, b) = rayon::join(
        || split_range(range.start..mid, min, map, reduce),
        || split_range(mid..range.end, min, map, reduce),
    );
    reduce(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_covers_every_element_once() {
        let part = Partitioner::new(4, 7).unwrap();
        let mut out = vec![-1.0f32; 1000];
        part.fill(&mut out, |start, chunk| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = (start + i) as f32;
            }
        });
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as f32);
        }
    }

    #[test]
    fn fill_rows_keeps_rows_whole() {
        let part = Partitioner::new(3, 1).unwrap();
        let mut out = vec![0.0f32; 13 * 5];
        part.fill_rows(&mut out, 5, 2, |first_row, chunk| {
            assert_eq!(chunk.len() % 5, 0);
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = (first_row + i / 5) as f32;
            }
        });
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, (i / 5) as f32);
        }
    }

    #[test]
    fn map_reduce_merges_partial_sums() {
        let part = Partitioner::new(4, 10).unwrap();
        let total = part.map_reduce(1001, |r| r.map(|i| i as u64).sum::<u64>(), |a, b| a + b);
        assert_eq!(total, 1000 * 1001 / 2);
    }

    #[test]
    fn matmul_rows_heuristic() {
        assert_eq!(matmul_min_rows(0, 0), MATMUL_MIN_WORK);
        assert_eq!(matmul_min_rows(1024, 1024), 1);
        assert_eq!(matmul_min_rows(64, 64), MATMUL_MIN_WORK / 4096);
    }
}
