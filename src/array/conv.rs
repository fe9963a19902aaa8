//! 2-D convolution and max pooling over `(…, H, W, C)` arrays
//!
//! Both gradients of the convolution reuse the forward kernel: the input
//! gradient convolves the upstream gradient with the rotated filter, and the
//! filter gradient convolves the transposed input against the transposed
//! upstream gradient.

use super::DenseArray;
use crate::backend::Backend;
use crate::error::{KilnError, Result};
use crate::shape::Shape;

/// Placement of the filter relative to each output pixel
///
/// Output `(y, x)` reads input rows `y - offset_y .. y - offset_y + FH`.
/// Unset offsets centre the filter (`(FH - 1) / 2`), unset output sizes
/// match the input, which together give same-padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Conv2dParams {
    pub offset_y: Option<isize>,
    pub offset_x: Option<isize>,
    pub out_h: Option<usize>,
    pub out_w: Option<usize>,
}

impl Conv2dParams {
    #[must_use]
    pub const fn same() -> Self {
        Self {
            offset_y: None,
            offset_x: None,
            out_h: None,
            out_w: None,
        }
    }

    #[must_use]
    pub const fn with_offsets(mut self, y: isize, x: isize) -> Self {
        self.offset_y = Some(y);
        self.offset_x = Some(x);
        self
    }

    #[must_use]
    pub const fn with_output(mut self, h: usize, w: usize) -> Self {
        self.out_h = Some(h);
        self.out_w = Some(w);
        self
    }

    /// Offsets with defaults filled in for a filter of `fh x fw`
    #[must_use]
    pub fn offsets(&self, fh: usize, fw: usize) -> (isize, isize) {
        (
            self.offset_y.unwrap_or((fh as isize - 1) / 2),
            self.offset_x.unwrap_or((fw as isize - 1) / 2),
        )
    }
}

/// Leading dims collapsed into one batch axis: `(batch, H, W, C)`
fn spatial(dims: &[usize], what: &str) -> Result<(usize, usize, usize, usize)> {
    if dims.len() < 3 {
        return Err(KilnError::InvalidShape(format!(
            "{what} needs (.., H, W, C), got {dims:?}"
        )));
    }
    let r = dims.len();
    let batch = dims[..r - 3].iter().product();
    Ok((batch, dims[r - 3], dims[r - 2], dims[r - 1]))
}

impl<B: Backend> DenseArray<B> {
    /// Convolve `(…, H, W, Cin)` with a `(FH, FW, Cin, Cout)` filter
    ///
    /// Input positions outside the image read as zero.
    ///
    /// # Errors
    /// `InvalidShape` for ranks below 4 / other than 4, `IncompatibleShape`
    /// when the channel counts differ.
    pub fn conv2d(&self, filter: &Self, params: Conv2dParams) -> Result<Self> {
        if self.rank() < 4 {
            return Err(KilnError::InvalidShape(format!(
                "conv2d input needs rank >= 4, got {}",
                self.shape()
            )));
        }
        if filter.rank() != 4 {
            return Err(KilnError::InvalidShape(format!(
                "conv2d filter needs rank 4, got {}",
                filter.shape()
            )));
        }
        let (batch, h, w, cin) = spatial(self.dims(), "conv2d input")?;
        let fd = filter.dims();
        let (fh, fw, fcin, cout) = (fd[0], fd[1], fd[2], fd[3]);
        if fcin != cin {
            return Err(KilnError::IncompatibleShape(
                self.dims().to_vec(),
                fd.to_vec(),
            ));
        }
        let (oy, ox) = params.offsets(fh, fw);
        let oh = params.out_h.unwrap_or(h);
        let ow = params.out_w.unwrap_or(w);

        let x = self.to_vec()?;
        let f = filter.to_vec()?;
        let mut out = vec![0.0; batch * oh * ow * cout];
        let row_len = ow * cout;
        self.context()
            .partitioner()
            .fill_rows(&mut out, row_len, 1, |first_row, chunk| {
                for (r, row) in chunk.chunks_mut(row_len).enumerate() {
                    let (b, y) = ((first_row + r) / oh, (first_row + r) % oh);
                    for (xo, px) in row.chunks_mut(cout).enumerate() {
                        for fy in 0..fh {
                            let yy = y as isize + fy as isize - oy;
                            if yy < 0 || yy >= h as isize {
                                continue;
                            }
                            for fx in 0..fw {
                                let xx = xo as isize + fx as isize - ox;
                                if xx < 0 || xx >= w as isize {
                                    continue;
                                }
                                let in_base = ((b * h + yy as usize) * w + xx as usize) * cin;
                                let f_base = (fy * fw + fx) * cin * cout;
                                for ci in 0..cin {
                                    let v = x[in_base + ci];
                                    let taps = &f[f_base + ci * cout..f_base + (ci + 1) * cout];
                                    for (o, &t) in px.iter_mut().zip(taps) {
                                        *o += v * t;
                                    }
                                }
                            }
                        }
                    }
                }
            });

        let mut dims = self.dims()[..self.rank() - 3].to_vec();
        dims.extend([oh, ow, cout]);
        self.derive(out, Shape::new(&dims)?)
    }

    /// Gradient of [`DenseArray::conv2d`] with respect to its input
    ///
    /// `self` is the upstream gradient; `input_hw` the input's spatial size.
    ///
    /// # Errors
    /// Shape errors from the underlying convolution.
    pub fn conv2d_input_grad(
        &self,
        filter: &Self,
        params: Conv2dParams,
        input_hw: (usize, usize),
    ) -> Result<Self> {
        let fd = filter.dims();
        let (fh, fw) = (fd[0], fd[1]);
        let (oy, ox) = params.offsets(fh, fw);
        let flipped = filter.rotate()?.transpose(Some(&[0, 1, 3, 2]))?;
        let back = Conv2dParams::same()
            .with_offsets(fh as isize - 1 - oy, fw as isize - 1 - ox)
            .with_output(input_hw.0, input_hw.1);
        self.conv2d(&flipped, back)
    }

    /// Gradient of [`DenseArray::conv2d`] with respect to its filter
    ///
    /// `self` is the forward input, `grad` the upstream gradient and
    /// `filter_dims` the filter's `(FH, FW, Cin, Cout)`.
    ///
    /// # Errors
    /// Shape errors from the underlying convolution.
    pub fn conv2d_filter_grad(
        &self,
        grad: &Self,
        params: Conv2dParams,
        filter_dims: &[usize],
    ) -> Result<Self> {
        let (batch, h, w, cin) = spatial(self.dims(), "conv2d input")?;
        let (_, gh, gw, cout) = spatial(grad.dims(), "conv2d gradient")?;
        let (fh, fw) = (filter_dims[0], filter_dims[1]);
        let (oy, ox) = params.offsets(fh, fw);

        // (B, H, W, Cin) -> (Cin, H, W, B): batch becomes the contracted channel
        let x = self
            .reshape(&[batch as isize, h as isize, w as isize, cin as isize])?
            .transpose(Some(&[3, 1, 2, 0]))?;
        // (B, OH, OW, Cout) -> (OH, OW, B, Cout): the gradient acts as the filter
        let g = grad
            .reshape(&[batch as isize, gh as isize, gw as isize, cout as isize])?
            .transpose(Some(&[1, 2, 0, 3]))?;
        let p = Conv2dParams::same().with_offsets(oy, ox).with_output(fh, fw);
        // (Cin, FH, FW, Cout) -> (FH, FW, Cin, Cout)
        x.conv2d(&g, p)?.transpose(Some(&[1, 2, 0, 3]))?.contiguous()
    }

    /// Max pooling with a `ph x pw` window and equal stride
    ///
    /// Partial windows at the bottom/right edge are pooled too. Returns the
    /// pooled array and a mask shaped like the input holding 1.0 at the first
    /// maximum of each window.
    ///
    /// # Errors
    /// `InvalidParameter` for an empty window.
    pub fn max_pool2d(&self, ph: usize, pw: usize) -> Result<(Self, Self)> {
        if ph == 0 || pw == 0 {
            return Err(KilnError::InvalidParameter(format!(
                "pool window {ph}x{pw}"
            )));
        }
        let (batch, h, w, c) = spatial(self.dims(), "max_pool2d input")?;
        let (oh, ow) = (h.div_ceil(ph), w.div_ceil(pw));
        let x = self.to_vec()?;
        let mut out = vec![f32::NEG_INFINITY; batch * oh * ow * c];
        let mut mask = vec![0.0; x.len()];
        for b in 0..batch {
            for y in 0..oh {
                for xo in 0..ow {
                    for ch in 0..c {
                        let mut best = f32::NEG_INFINITY;
                        let mut at = None;
                        for yy in y * ph..((y + 1) * ph).min(h) {
                            for xx in xo * pw..((xo + 1) * pw).min(w) {
                                let i = ((b * h + yy) * w + xx) * c + ch;
                                if at.is_none() || x[i] > best {
                                    best = x[i];
                                    at = Some(i);
                                }
                            }
                        }
                        out[((b * oh + y) * ow + xo) * c + ch] = best;
                        if let Some(i) = at {
                            mask[i] = 1.0;
                        }
                    }
                }
            }
        }
        let mut dims = self.dims()[..self.rank() - 3].to_vec();
        dims.extend([oh, ow, c]);
        let pooled = self.derive(out, Shape::new(&dims)?)?;
        let mask = self.derive(mask, self.shape().to_canonical())?;
        Ok((pooled, mask))
    }

    /// Route a pooled gradient (`self`) back through the argmax `mask`
    ///
    /// # Errors
    /// `IncompatibleShape` when the gradient does not match the pooled size.
    pub fn max_pool2d_backward(&self, mask: &Self, ph: usize, pw: usize) -> Result<Self> {
        let (batch, h, w, c) = spatial(mask.dims(), "max_pool2d mask")?;
        let (oh, ow) = (h.div_ceil(ph), w.div_ceil(pw));
        let (gb, gh, gw, gc) = spatial(self.dims(), "max_pool2d gradient")?;
        if (gb, gh, gw, gc) != (batch, oh, ow, c) {
            return Err(KilnError::IncompatibleShape(
                self.dims().to_vec(),
                mask.dims().to_vec(),
            ));
        }
        let g = self.to_vec()?;
        let m = mask.to_vec()?;
        let mut out = vec![0.0; m.len()];
        self.context().partitioner().fill(&mut out, |start, chunk| {
            for (k, o) in chunk.iter_mut().enumerate() {
                let i = start + k;
                if m[i] == 0.0 {
                    continue;
                }
                let ch = i % c;
                let xx = (i / c) % w;
                let yy = (i / (c * w)) % h;
                let b = i / (c * w * h);
                *o = g[((b * oh + yy / ph) * ow + xx / pw) * c + ch];
            }
        });
        self.derive(out, mask.shape().to_canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Host;
    use crate::config::EngineConfig;
    use crate::context::Context;

    fn ctx() -> Context<Host> {
        Context::host_with(EngineConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn default_offsets_centre_the_filter() {
        assert_eq!(Conv2dParams::same().offsets(3, 5), (1, 2));
        assert_eq!(Conv2dParams::same().with_offsets(0, 0).offsets(3, 3), (0, 0));
    }

    #[test]
    fn identity_filter_copies_input() {
        let ctx = ctx();
        let x = ctx
            .from_vec((0..18).map(|v| v as f32).collect(), &[1, 3, 3, 2])
            .unwrap();
        let mut f = ctx.mutable(&[3, 3, 2, 2]).unwrap();
        f.set(&[1, 1, 0, 0], 1.0).unwrap();
        f.set(&[1, 1, 1, 1], 1.0).unwrap();
        let f = f.freeze().unwrap();
        let y = x.conv2d(&f, Conv2dParams::same()).unwrap();
        assert_eq!(y.to_vec().unwrap(), x.to_vec().unwrap());
    }

    #[test]
    fn channel_mismatch() {
        let ctx = ctx();
        let x = ctx.zeros(&[1, 4, 4, 3]).unwrap();
        let f = ctx.zeros(&[3, 3, 2, 1]).unwrap();
        assert!(matches!(
            x.conv2d(&f, Conv2dParams::same()),
            Err(KilnError::IncompatibleShape(_, _))
        ));
    }

    #[test]
    fn pooling_marks_first_max() {
        let ctx = ctx();
        let x = ctx
            .from_vec(vec![1.0, 3.0, 3.0, 2.0, 5.0, 0.0, 4.0, 4.0, 6.0], &[1, 3, 3, 1])
            .unwrap();
        let (p, mask) = x.max_pool2d(2, 2).unwrap();
        assert_eq!(p.dims(), &[1, 2, 2, 1]);
        assert_eq!(p.to_vec().unwrap(), vec![5.0, 3.0, 4.0, 6.0]);
        assert_eq!(
            mask.to_vec().unwrap(),
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]
        );
        let g = ctx.from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 2, 2, 1]).unwrap();
        let dx = g.max_pool2d_backward(&mask, 2, 2).unwrap();
        assert_eq!(
            dx.to_vec().unwrap(),
            vec![0.0, 0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 4.0]
        );
    }
}
