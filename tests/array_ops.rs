//! Array-level behaviour: broadcasting, movement, reductions, matmul

use approx::assert_relative_eq;
use kiln::{Context, EngineConfig, Host, KilnError, ReduceMode};
use proptest::prelude::*;

fn ctx() -> Context<Host> {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::host_with(EngineConfig::default().with_threads(2).with_seed(7)).unwrap()
}

fn ramp(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32 * 0.5 - 3.0).collect()
}

/// Row-major coordinates of `linear` in `dims`
fn unravel(mut linear: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for axis in (0..dims.len()).rev() {
        coords[axis] = linear % dims[axis];
        linear /= dims[axis];
    }
    coords
}

/// Dims of `full` with some axes collapsed to 1 and some leading axes dropped
fn broadcastable(full: Vec<usize>) -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    let rank = full.len();
    (prop::collection::vec(any::<bool>(), rank), 0..rank).prop_map(move |(ones, drop)| {
        let other: Vec<usize> = full
            .iter()
            .zip(&ones)
            .skip(drop)
            .map(|(&d, &one)| if one { 1 } else { d })
            .collect();
        (full.clone(), other)
    })
}

// ===== BROADCASTING =====

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn broadcast_add_matches_elementwise_definition(
        (a_dims, b_dims) in prop::collection::vec(1usize..4, 1..4).prop_flat_map(broadcastable)
    ) {
        let ctx = ctx();
        let a_len: usize = a_dims.iter().product();
        let b_len: usize = b_dims.iter().product();
        let a = ctx.from_vec(ramp(a_len), &a_dims).unwrap();
        let b = ctx.from_vec(ramp(b_len).iter().map(|v| v * 10.0).collect(), &b_dims).unwrap();

        let ab = a.add(&b).unwrap();
        let ba = b.add(&a).unwrap();
        prop_assert_eq!(ab.dims(), a_dims.as_slice());
        prop_assert_eq!(ab.to_vec().unwrap(), ba.to_vec().unwrap());

        let lead = a_dims.len() - b_dims.len();
        let out = ab.to_vec().unwrap();
        for (i, &v) in out.iter().enumerate() {
            let coords = unravel(i, &a_dims);
            let b_coords: Vec<usize> = coords[lead..]
                .iter()
                .zip(&b_dims)
                .map(|(&c, &d)| if d == 1 { 0 } else { c })
                .collect();
            let expected = a.get(&coords).unwrap() + b.get(&b_coords).unwrap();
            prop_assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn sum_to_inverts_broadcast_counts(
        (a_dims, b_dims) in prop::collection::vec(1usize..4, 1..4).prop_flat_map(broadcastable)
    ) {
        let ctx = ctx();
        let ones = ctx.ones(&b_dims).unwrap();
        let spread = ones.broadcast_to(&a_dims).unwrap();
        let folded = spread.sum_to(&b_dims).unwrap();
        let copies = (a_dims.iter().product::<usize>() / b_dims.iter().product::<usize>()) as f32;
        prop_assert_eq!(folded.dims(), b_dims.as_slice());
        prop_assert!(folded.to_vec().unwrap().iter().all(|&v| v == copies));
    }
}

#[test]
fn incompatible_operands_are_rejected() {
    let ctx = ctx();
    let a = ctx.zeros(&[2, 3]).unwrap();
    let b = ctx.zeros(&[4]).unwrap();
    assert!(matches!(
        a.add(&b).unwrap_err(),
        KilnError::IncompatibleShape(_, _)
    ));
}

// ===== MOVEMENT =====

#[test]
fn transpose_and_reshape_round_trip() {
    let ctx = ctx();
    let a = ctx.from_vec(ramp(24), &[2, 3, 4]).unwrap();

    let t = a.transpose(Some(&[2, 0, 1])).unwrap();
    assert_eq!(t.dims(), &[4, 2, 3]);
    assert_eq!(t.get(&[3, 1, 2]).unwrap(), a.get(&[1, 2, 3]).unwrap());

    let back = t.transpose(Some(&[1, 2, 0])).unwrap();
    assert_eq!(back.to_vec().unwrap(), a.to_vec().unwrap());

    let flat = t.reshape(&[-1]).unwrap();
    assert_eq!(flat.dims(), &[24]);
    assert_eq!(flat.to_vec().unwrap(), t.to_vec().unwrap());
    assert!(t.reshape(&[5, -1]).is_err());
}

#[test]
fn views_share_storage_but_release_independently() {
    let ctx = ctx();
    let a = ctx.from_vec(ramp(6), &[2, 3]).unwrap();
    let t = a.transpose(None).unwrap();
    a.dispose().unwrap();
    assert!(a.is_released());
    assert_eq!(t.get(&[2, 1]).unwrap(), ramp(6)[5]);
    assert!(matches!(
        a.dispose().unwrap_err(),
        KilnError::AlreadyReleased { .. }
    ));
}

// ===== REDUCTIONS =====

#[test]
fn keep_and_remove_reductions_hold_the_same_values() {
    let ctx = ctx();
    let a = ctx.from_vec(ramp(24), &[2, 3, 4]).unwrap();
    for axes in [&[0isize][..], &[1], &[-1], &[0, 2], &[0, 1, 2]] {
        let kept = a.sum_axes(axes, ReduceMode::Keep).unwrap();
        let removed = a.sum_axes(axes, ReduceMode::Remove).unwrap();
        assert_eq!(kept.size(), removed.size());
        assert_eq!(kept.rank(), 3);
        assert_eq!(kept.to_vec().unwrap(), removed.to_vec().unwrap());
    }
    let total = a.sum_all().unwrap().item().unwrap();
    assert_relative_eq!(total, ramp(24).iter().sum::<f32>(), epsilon = 1e-4);
}

#[test]
fn bad_reduction_axes_fail() {
    let ctx = ctx();
    let a = ctx.zeros(&[2, 3]).unwrap();
    assert!(matches!(
        a.sum_axes(&[2], ReduceMode::Keep).unwrap_err(),
        KilnError::AxisOutOfBounds { .. }
    ));
    assert!(matches!(
        a.sum_axes(&[1, -1], ReduceMode::Keep).unwrap_err(),
        KilnError::DuplicateAxis { .. }
    ));
}

// ===== MATMUL =====

#[test]
fn batched_matmul_equals_per_matrix_products() {
    let ctx = ctx();
    let a = ctx.from_vec(ramp(2 * 3 * 4), &[2, 3, 4]).unwrap();
    let b = ctx.from_vec(ramp(4 * 5), &[4, 5]).unwrap();
    let batched = a.matmul(&b).unwrap();
    assert_eq!(batched.dims(), &[2, 3, 5]);

    let all = batched.to_vec().unwrap();
    for batch in 0..2 {
        let slice = ctx
            .from_vec(ramp(24)[batch * 12..(batch + 1) * 12].to_vec(), &[3, 4])
            .unwrap();
        let single = slice.matmul(&b).unwrap().to_vec().unwrap();
        for (x, y) in single.iter().zip(&all[batch * 15..(batch + 1) * 15]) {
            assert_relative_eq!(x, y, epsilon = 1e-4);
        }
    }
}

#[test]
fn matmul_reads_transposed_views() {
    let ctx = ctx();
    let a = ctx.literal(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).unwrap();
    let at = a.transpose(None).unwrap();
    let gram = at.matmul(&a).unwrap();
    assert_eq!(gram.to_vec().unwrap(), vec![35.0, 44.0, 44.0, 56.0]);
}

#[test]
fn mismatched_inner_dims_fail() {
    let ctx = ctx();
    let a = ctx.zeros(&[2, 3]).unwrap();
    let b = ctx.zeros(&[2, 3]).unwrap();
    assert!(matches!(
        a.matmul(&b).unwrap_err(),
        KilnError::IncompatibleMatMulShape { .. }
    ));
}
