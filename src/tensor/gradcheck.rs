// ===== NUMERICAL GRADIENT CHECKING =====

use super::{RawTensor, Tensor, TensorOps};
use crate::backend::Backend;
use crate::error::{KilnError, Result};
use log::warn;

/// Check gradients numerically using central differences
///
/// Builds `loss_fn(tensor)` once and backpropagates for the analytical
/// gradient. Each element is then nudged by `±epsilon` through
/// [`RawTensor::set_value`] and the loss re-read, so the same graph is
/// recomputed instead of rebuilt. The tensor's value is restored afterwards.
///
/// Errors are relative where the numerical gradient exceeds 1 in magnitude
/// and absolute below that.
///
/// Returns `(max_error, mean_error, passed)`.
///
/// # Errors
/// `InvalidParameter` when the loss does not reach `tensor`, plus anything
/// `loss_fn` or recomputation raises.
pub fn check_gradients<B, F>(
    tensor: &Tensor<B>,
    loss_fn: F,
    epsilon: f32,
    tolerance: f32,
) -> Result<(f32, f32, bool)>
where
    B: Backend,
    F: Fn(&Tensor<B>) -> Result<Tensor<B>>,
{
    let loss = loss_fn(tensor)?;
    loss.backward()?;

    let analytical = tensor
        .grad()
        .ok_or_else(|| KilnError::InvalidParameter("loss does not depend on the tensor".into()))?
        .to_vec()?;

    let original = tensor.val()?;
    let base = original.to_vec()?;
    let dims = original.dims().to_vec();
    let ctx = original.context().clone();

    let loss_at = |data: Vec<f32>| -> Result<f32> {
        tensor.set_value(ctx.from_vec(data, &dims)?)?;
        loss.val()?.item()
    };

    let mut numerical = vec![0.0; base.len()];
    for (i, slot) in numerical.iter_mut().enumerate() {
        let mut plus = base.clone();
        plus[i] += epsilon;
        let mut minus = base.clone();
        minus[i] -= epsilon;
        *slot = (loss_at(plus)? - loss_at(minus)?) / (2.0 * epsilon);
    }
    RawTensor::set_value(tensor, original)?;

    let mut max_error: f32 = 0.0;
    let mut total_error: f32 = 0.0;
    for (i, (&a, &n)) in analytical.iter().zip(&numerical).enumerate() {
        let error = (a - n).abs();
        let error = if n.abs() > 1.0 { error / n.abs() } else { error };
        max_error = max_error.max(error);
        total_error += error;
        if error > tolerance {
            warn!("gradient mismatch at index {i}: analytical={a:.6e}, numerical={n:.6e}, error={error:.6e}");
        }
    }

    let mean_error = total_error / analytical.len() as f32;
    Ok((max_error, mean_error, max_error < tolerance))
}

/// [`check_gradients`] with `epsilon = 1e-2` and `tolerance = 1e-3`
///
/// # Errors
/// As for [`check_gradients`].
pub fn check_gradients_simple<B, F>(tensor: &Tensor<B>, loss_fn: F) -> Result<bool>
where
    B: Backend,
    F: Fn(&Tensor<B>) -> Result<Tensor<B>>,
{
    let (max_err, mean_err, passed) = check_gradients(tensor, loss_fn, 1e-2, 1e-3)?;
    if !passed {
        warn!("gradient check failed: max_error={max_err:.6e}, mean_error={mean_err:.6e}");
    }
    Ok(passed)
}
