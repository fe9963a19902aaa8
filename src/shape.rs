//! Shape algebra
//!
//! A `Shape` is a list of dimension sizes plus a strided map from logical
//! coordinates to buffer offsets:
//!
//! `offset = base + Σ coord[i] * stride[i]`
//!
//! Strides are signed so the three layouts the engine needs share one
//! representation:
//! - canonical: row-major contiguous, `base == 0`
//! - reordered: a permutation of another shape's strides (zero-copy transpose)
//! - rotated: the two leading axes read back to front (negative strides)

use crate::error::{KilnError, Result};
use std::fmt;

/// Placeholder accepted by [`Shape::reshape`] for the inferred dimension
pub const INFER: isize = -1;

/// How a reduction treats the axes it collapses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceMode {
    /// Reduced axes disappear from the output
    Remove,
    /// Reduced axes stay with size 1
    Keep,
}

/// Which strided layout a shape describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Canonical,
    Reordered,
    Rotated,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
    strides: Vec<isize>,
    base: isize,
}

/// Row-major strides for `dims`
#[must_use]
pub fn canonical_strides(dims: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as isize;
    }
    strides
}

/// Broadcast two dimension lists following the trailing-axis rule
///
/// - (3, 1) + (1, 4) -> (3, 4)
/// - (5, 3, 1) + (1, 4) -> (5, 3, 4)
///
/// # Errors
/// `IncompatibleShape` when an aligned pair differs and neither side is 1.
pub fn broadcast_dims(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![1; rank];
    for i in 0..rank {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        out[rank - 1 - i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(KilnError::IncompatibleShape(a.to_vec(), b.to_vec()));
        };
    }
    Ok(out)
}

fn validate_dims(dims: &[usize]) -> Result<()> {
    if dims.is_empty() {
        return Err(KilnError::InvalidShape(
            "a shape needs at least one dimension".into(),
        ));
    }
    if let Some(pos) = dims.iter().position(|&d| d == 0) {
        return Err(KilnError::InvalidShape(format!(
            "dimension {pos} of {dims:?} is zero"
        )));
    }
    Ok(())
}

impl Shape {
    /// Canonical (row-major) shape
    ///
    /// # Errors
    /// `InvalidShape` for an empty list or a zero-sized dimension.
    pub fn new(dims: &[usize]) -> Result<Self> {
        validate_dims(dims)?;
        Ok(Self {
            dims: dims.to_vec(),
            strides: canonical_strides(dims),
            base: 0,
        })
    }

    /// Single-element shape `[1]`
    #[must_use]
    pub fn scalar() -> Self {
        Self {
            dims: vec![1],
            strides: vec![1],
            base: 0,
        }
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.base == 0 && self.strides == canonical_strides(&self.dims)
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        if self.is_canonical() {
            Layout::Canonical
        } else if self.strides.iter().any(|&s| s < 0) {
            Layout::Rotated
        } else {
            Layout::Reordered
        }
    }

    /// Same dimensions, row-major layout
    #[must_use]
    pub fn to_canonical(&self) -> Self {
        Self {
            dims: self.dims.clone(),
            strides: canonical_strides(&self.dims),
            base: 0,
        }
    }

    /// Resolve a possibly negative axis (`-1` is the last one)
    ///
    /// # Errors
    /// `AxisOutOfBounds` when the axis does not exist.
    pub fn resolve_axis(&self, axis: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let resolved = if axis < 0 { axis + rank } else { axis };
        if resolved < 0 || resolved >= rank {
            return Err(KilnError::AxisOutOfBounds {
                axis,
                rank: self.rank(),
            });
        }
        Ok(resolved as usize)
    }

    /// Size of an axis
    ///
    /// # Errors
    /// `AxisOutOfBounds` when the axis does not exist.
    pub fn at(&self, axis: isize) -> Result<usize> {
        Ok(self.dims[self.resolve_axis(axis)?])
    }

    /// Size of an axis, or `fallback` when it does not exist
    #[must_use]
    pub fn at_or(&self, axis: isize, fallback: usize) -> usize {
        self.resolve_axis(axis)
            .map_or(fallback, |a| self.dims[a])
    }

    /// Buffer offset of a logical coordinate (must be in range)
    #[must_use]
    pub fn offset(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.rank());
        let off = coords
            .iter()
            .zip(&self.strides)
            .fold(self.base, |acc, (&c, &s)| acc + c as isize * s);
        off as usize
    }

    /// Buffer offset of a coordinate that may fall outside the shape
    ///
    /// Returns `None` for out-of-range coordinates, which callers read as zero.
    #[must_use]
    pub fn offset_signed(&self, coords: &[isize]) -> Option<usize> {
        let mut off = self.base;
        for ((&c, &d), &s) in coords.iter().zip(&self.dims).zip(&self.strides) {
            if c < 0 || c >= d as isize {
                return None;
            }
            off += c * s;
        }
        Some(off as usize)
    }

    /// Buffer offset of the `linear`-th element in row-major logical order
    #[must_use]
    pub fn offset_of_linear(&self, mut linear: usize) -> usize {
        let mut off = self.base;
        for (&d, &s) in self.dims.iter().zip(&self.strides).rev() {
            off += (linear % d) as isize * s;
            linear /= d;
        }
        off as usize
    }

    /// Row-major coordinates of the `linear`-th element
    pub fn unravel(&self, mut linear: usize, coords: &mut [usize]) {
        for (slot, &d) in coords.iter_mut().zip(&self.dims).rev() {
            *slot = linear % d;
            linear /= d;
        }
    }

    /// Offset of `out_coords` (in a broadcast output of equal or higher rank)
    /// read through this shape, clamping size-1 axes to index 0
    #[must_use]
    pub fn broadcast_offset(&self, out_coords: &[usize]) -> usize {
        let lead = out_coords.len() - self.rank();
        let mut off = self.base;
        for (i, (&d, &s)) in self.dims.iter().zip(&self.strides).enumerate() {
            if d != 1 {
                off += out_coords[lead + i] as isize * s;
            }
        }
        off as usize
    }

    /// Dimensions after resolving a single `INFER` placeholder
    ///
    /// # Errors
    /// `InvalidShape` for several placeholders, non-positive sizes or a
    /// count that does not divide evenly.
    pub fn resolve_reshape(&self, new_dims: &[isize]) -> Result<Vec<usize>> {
        if new_dims.is_empty() {
            return Err(KilnError::InvalidShape("reshape to an empty shape".into()));
        }
        let mut infer_at = None;
        let mut known = 1usize;
        for (i, &d) in new_dims.iter().enumerate() {
            if d == INFER {
                if infer_at.replace(i).is_some() {
                    return Err(KilnError::InvalidShape(format!(
                        "more than one inferred dimension in {new_dims:?}"
                    )));
                }
            } else if d <= 0 {
                return Err(KilnError::InvalidShape(format!(
                    "dimension {d} in reshape target {new_dims:?}"
                )));
            } else {
                known *= d as usize;
            }
        }
        let size = self.size();
        let mut dims: Vec<usize> = new_dims.iter().map(|&d| d.max(1) as usize).collect();
        match infer_at {
            Some(i) => {
                if size % known != 0 {
                    return Err(KilnError::InvalidShape(format!(
                        "cannot infer a dimension reshaping {} elements to {new_dims:?}",
                        size
                    )));
                }
                dims[i] = size / known;
            }
            None if known != size => {
                return Err(KilnError::InvalidShape(format!(
                    "cannot reshape {:?} ({size} elements) to {new_dims:?}",
                    self.dims
                )));
            }
            None => {}
        }
        Ok(dims)
    }

    /// Canonical shape with new dimensions and the same element count
    ///
    /// The result always describes contiguous storage; the array layer
    /// materializes non-canonical data before reinterpreting it.
    ///
    /// # Errors
    /// See [`Shape::resolve_reshape`].
    pub fn reshape(&self, new_dims: &[isize]) -> Result<Self> {
        let dims = self.resolve_reshape(new_dims)?;
        Self::new(&dims)
    }

    /// Permuted view; `None` reverses the axis order
    ///
    /// # Errors
    /// `MissingAxis`, `DuplicateAxis` or `AxisOutOfBounds` for a malformed
    /// permutation.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Self> {
        let rank = self.rank();
        let perm: Vec<usize> = match axes {
            None => (0..rank).rev().collect(),
            Some(axes) => {
                let mut seen = vec![false; rank];
                for &a in axes {
                    if a >= rank {
                        return Err(KilnError::AxisOutOfBounds {
                            axis: a as isize,
                            rank,
                        });
                    }
                    if std::mem::replace(&mut seen[a], true) {
                        return Err(KilnError::DuplicateAxis { axis: a });
                    }
                }
                if let Some(missing) = seen.iter().position(|&s| !s) {
                    return Err(KilnError::MissingAxis {
                        axis: missing,
                        rank,
                    });
                }
                axes.to_vec()
            }
        };
        Ok(Self {
            dims: perm.iter().map(|&p| self.dims[p]).collect(),
            strides: perm.iter().map(|&p| self.strides[p]).collect(),
            base: self.base,
        })
    }

    /// View reading the two leading axes back to front
    ///
    /// For a `(FH, FW, Cin, Cout)` filter this is the 180° spatial rotation
    /// used by the convolution input gradient.
    ///
    /// # Errors
    /// `InvalidShape` below rank 2.
    pub fn rotate(&self) -> Result<Self> {
        if self.rank() < 2 {
            return Err(KilnError::InvalidShape(format!(
                "rotation needs rank >= 2, got {:?}",
                self.dims
            )));
        }
        let mut out = self.clone();
        for axis in 0..2 {
            out.base += (out.dims[axis] as isize - 1) * out.strides[axis];
            out.strides[axis] = -out.strides[axis];
        }
        Ok(out)
    }

    /// Canonical broadcast of two shapes
    ///
    /// # Errors
    /// `IncompatibleShape`, see [`broadcast_dims`].
    pub fn broadcast(&self, other: &Self) -> Result<Self> {
        let dims = broadcast_dims(&self.dims, &other.dims)?;
        Self::new(&dims)
    }

    /// Convert an axis list into a per-axis selector
    ///
    /// # Errors
    /// `AxisOutOfBounds` / `DuplicateAxis` for bad entries.
    pub fn axes_selector(&self, axes: &[isize]) -> Result<Vec<bool>> {
        let mut selector = vec![false; self.rank()];
        for &axis in axes {
            let a = self.resolve_axis(axis)?;
            if std::mem::replace(&mut selector[a], true) {
                return Err(KilnError::DuplicateAxis { axis: a });
            }
        }
        Ok(selector)
    }

    /// Output shape of a sum over the selected axes
    ///
    /// # Errors
    /// `InvalidShape` when the selector length differs from the rank.
    pub fn reduce(&self, selector: &[bool], mode: ReduceMode) -> Result<Self> {
        if selector.len() != self.rank() {
            return Err(KilnError::InvalidShape(format!(
                "reduction selector of length {} for rank {}",
                selector.len(),
                self.rank()
            )));
        }
        let dims: Vec<usize> = match mode {
            ReduceMode::Keep => self
                .dims
                .iter()
                .zip(selector)
                .map(|(&d, &r)| if r { 1 } else { d })
                .collect(),
            ReduceMode::Remove => self
                .dims
                .iter()
                .zip(selector)
                .filter(|&(_, &r)| !r)
                .map(|(&d, _)| d)
                .collect(),
        };
        if dims.is_empty() {
            return Ok(Self::scalar());
        }
        Self::new(&dims)
    }
}

/// Resolved geometry of a (possibly batched) matrix product
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatMulShape {
    /// Left operand dims after rank-1 promotion
    pub left: Vec<usize>,
    /// Right operand dims after rank-1 promotion
    pub right: Vec<usize>,
    /// Broadcast batch dims
    pub batch: Vec<usize>,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Result dims with promoted axes squeezed back out
    pub out: Vec<usize>,
}

impl MatMulShape {
    /// # Errors
    /// `IncompatibleMatMulShape` when the contracted sizes differ or the
    /// batch axes do not broadcast.
    pub fn resolve(a: &[usize], b: &[usize]) -> Result<Self> {
        let mismatch = || KilnError::IncompatibleMatMulShape {
            left: a.to_vec(),
            right: b.to_vec(),
        };
        let left: Vec<usize> = if a.len() == 1 {
            vec![1, a[0]]
        } else {
            a.to_vec()
        };
        let right: Vec<usize> = if b.len() == 1 {
            vec![b[0], 1]
        } else {
            b.to_vec()
        };
        let (m, k) = (left[left.len() - 2], left[left.len() - 1]);
        let (k2, n) = (right[right.len() - 2], right[right.len() - 1]);
        if k != k2 {
            return Err(mismatch());
        }
        let batch = broadcast_dims(&left[..left.len() - 2], &right[..right.len() - 2])
            .map_err(|_| mismatch())?;

        let mut out = batch.clone();
        if a.len() > 1 {
            out.push(m);
        }
        if b.len() > 1 {
            out.push(n);
        }
        if out.is_empty() {
            out.push(1);
        }
        Ok(Self {
            left,
            right,
            batch,
            m,
            k,
            n,
            out,
        })
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_offsets_are_row_major() {
        let s = Shape::new(&[2, 3, 4]).unwrap();
        assert_eq!(s.strides(), &[12, 4, 1]);
        assert_eq!(s.offset(&[1, 2, 3]), 23);
        assert_eq!(s.layout(), Layout::Canonical);
    }

    #[test]
    fn zero_and_empty_dims_are_rejected() {
        assert!(matches!(Shape::new(&[2, 0]), Err(KilnError::InvalidShape(_))));
        assert!(matches!(Shape::new(&[]), Err(KilnError::InvalidShape(_))));
    }

    #[test]
    fn negative_axes_address_from_the_end() {
        let s = Shape::new(&[2, 3, 4]).unwrap();
        assert_eq!(s.at(-1).unwrap(), 4);
        assert_eq!(s.at(0).unwrap(), 2);
        assert!(matches!(
            s.at(3),
            Err(KilnError::AxisOutOfBounds { axis: 3, rank: 3 })
        ));
        assert_eq!(s.at_or(-4, 1), 1);
    }

    #[test]
    fn reshape_infers_one_dimension() {
        let s = Shape::new(&[2, 3, 4]).unwrap();
        assert_eq!(s.reshape(&[INFER, 4]).unwrap().dims(), &[6, 4]);
        assert!(matches!(
            s.reshape(&[INFER, INFER]),
            Err(KilnError::InvalidShape(_))
        ));
        assert!(matches!(s.reshape(&[5, INFER]), Err(KilnError::InvalidShape(_))));
        assert!(matches!(s.reshape(&[0, 24]), Err(KilnError::InvalidShape(_))));
        assert!(matches!(s.reshape(&[25]), Err(KilnError::InvalidShape(_))));
    }

    #[test]
    fn transpose_permutes_strides_without_copying() {
        let s = Shape::new(&[2, 3]).unwrap();
        let t = s.transpose(None).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.layout(), Layout::Reordered);
        // logical (2, 1) of the transpose is physical (1, 2)
        assert_eq!(t.offset(&[2, 1]), s.offset(&[1, 2]));
    }

    #[test]
    fn malformed_permutations_fail() {
        let s = Shape::new(&[2, 3, 4]).unwrap();
        assert!(matches!(
            s.transpose(Some(&[0, 0, 1])),
            Err(KilnError::DuplicateAxis { axis: 0 })
        ));
        assert!(matches!(
            s.transpose(Some(&[0, 1])),
            Err(KilnError::MissingAxis { axis: 2, .. })
        ));
        assert!(matches!(
            s.transpose(Some(&[0, 1, 5])),
            Err(KilnError::AxisOutOfBounds { .. })
        ));
    }

    #[test]
    fn rotation_reverses_leading_axes() {
        let s = Shape::new(&[3, 2, 1]).unwrap();
        let r = s.rotate().unwrap();
        assert_eq!(r.layout(), Layout::Rotated);
        assert_eq!(r.offset(&[0, 0, 0]), s.offset(&[2, 1, 0]));
        assert_eq!(r.offset(&[2, 1, 0]), 0);
    }

    #[test]
    fn broadcasting_follows_trailing_alignment() {
        assert_eq!(broadcast_dims(&[3, 1], &[1, 4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_dims(&[5, 3, 1], &[4]).unwrap(), vec![5, 3, 4]);
        assert!(matches!(
            broadcast_dims(&[2, 3], &[4]),
            Err(KilnError::IncompatibleShape(_, _))
        ));
    }

    #[test]
    fn broadcast_offset_clamps_unit_axes() {
        let s = Shape::new(&[3, 1]).unwrap();
        assert_eq!(s.broadcast_offset(&[2, 2, 3]), 2);
        assert_eq!(s.broadcast_offset(&[0, 1, 0]), 1);
    }

    #[test]
    fn reduce_keep_and_remove() {
        let s = Shape::new(&[2, 3, 4]).unwrap();
        let sel = s.axes_selector(&[1, -1]).unwrap();
        assert_eq!(s.reduce(&sel, ReduceMode::Keep).unwrap().dims(), &[2, 1, 1]);
        assert_eq!(s.reduce(&sel, ReduceMode::Remove).unwrap().dims(), &[2]);
        let all = vec![true; 3];
        assert_eq!(s.reduce(&all, ReduceMode::Remove).unwrap().dims(), &[1]);
    }

    #[test]
    fn matmul_promotes_vectors() {
        let mm = MatMulShape::resolve(&[4], &[4, 5]).unwrap();
        assert_eq!((mm.m, mm.k, mm.n), (1, 4, 5));
        assert_eq!(mm.out, vec![5]);

        let mm = MatMulShape::resolve(&[2, 1, 3, 4], &[5, 4, 6]).unwrap();
        assert_eq!(mm.batch, vec![2, 5]);
        assert_eq!(mm.out, vec![2, 5, 3, 6]);

        assert!(matches!(
            MatMulShape::resolve(&[2, 3], &[4, 5]),
            Err(KilnError::IncompatibleMatMulShape { .. })
        ));
        assert!(matches!(
            MatMulShape::resolve(&[2, 3, 4], &[3, 4, 5]),
            Err(KilnError::IncompatibleMatMulShape { .. })
        ));
    }
}
