//! Training loops under disposal scopes

use kiln::{Context, DenseArray, EngineConfig, Host, RawTensor, Tensor, TensorOps};
use std::cell::RefCell;

fn ctx(config: EngineConfig) -> Context<Host> {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::host_with(config.with_threads(2).with_seed(3)).unwrap()
}

/// Points on `y = 2x - 1` with a bias column
fn dataset(ctx: &Context<Host>) -> (Tensor<Host>, Tensor<Host>) {
    let xs: Vec<f32> = (0..8).map(|i| i as f32 / 4.0 - 1.0).collect();
    let inputs: Vec<f32> = xs.iter().flat_map(|&x| [x, 1.0]).collect();
    let targets: Vec<f32> = xs.iter().map(|&x| 2.0 * x - 1.0).collect();
    (
        RawTensor::constant(ctx.from_vec(inputs, &[8, 2]).unwrap()),
        RawTensor::constant(ctx.from_vec(targets, &[8, 1]).unwrap()),
    )
}

fn sgd(lr: f32) -> impl Fn(&DenseArray<Host>, &DenseArray<Host>) -> kiln::Result<DenseArray<Host>> {
    move |value, grad| value.sub(&grad.scale(lr)?)
}

fn step(
    ctx: &Context<Host>,
    weights: &Tensor<Host>,
    (inputs, targets): (&Tensor<Host>, &Tensor<Host>),
    spy: &RefCell<Vec<DenseArray<Host>>>,
) -> kiln::Result<f32> {
    ctx.model_iteration(std::slice::from_ref(weights), |_| {
        let pred = inputs.matmul(weights)?;
        let loss = pred.sub(targets)?.sqr()?.mean()?;
        spy.borrow_mut().push(pred.val()?);
        loss.backward()?;
        weights.update(sgd(0.3))?;
        loss.val()?.item()
    })
}

#[test]
fn linear_regression_converges_without_leaking_temporaries() {
    let ctx = ctx(EngineConfig::default());
    let data = dataset(&ctx);
    let weights = RawTensor::param(ctx.zeros(&[2, 1]).unwrap());
    let spy = RefCell::new(Vec::new());

    let mut losses = Vec::new();
    for _ in 0..200 {
        losses.push(step(&ctx, &weights, (&data.0, &data.1), &spy).unwrap());
    }
    assert!(losses[199] < losses[0] * 1e-3, "{} -> {}", losses[0], losses[199]);

    let w = weights.val().unwrap().to_vec().unwrap();
    assert!((w[0] - 2.0).abs() < 0.05 && (w[1] + 1.0).abs() < 0.05, "{w:?}");

    // intermediates from every step were released when the step closed
    assert!(spy.borrow().iter().all(DenseArray::is_released));
    assert!(!weights.val().unwrap().is_released());
    assert!(weights.grad().is_none());
    assert_eq!(ctx.scope_depth(), 0);
}

#[test]
fn live_allocations_stay_flat_across_steps() {
    let ctx = ctx(EngineConfig::default().with_leak_detection(1, 1_000));
    let data = dataset(&ctx);
    let weights = RawTensor::param(ctx.uniform(&[2, 1], -0.1, 0.1).unwrap());
    let spy = RefCell::new(Vec::new());
    let detector = ctx.leak_detector().unwrap().clone();

    step(&ctx, &weights, (&data.0, &data.1), &spy).unwrap();
    spy.borrow_mut().clear();
    let after_first = detector.tracked();
    for _ in 0..10 {
        step(&ctx, &weights, (&data.0, &data.1), &spy).unwrap();
        spy.borrow_mut().clear();
    }
    assert_eq!(detector.tracked(), after_first);
    assert_eq!(detector.epoch(), 11);
}

#[test]
fn failed_step_releases_its_temporaries_and_keeps_parameters() {
    let ctx = ctx(EngineConfig::default());
    let (inputs, _) = dataset(&ctx);
    let weights = RawTensor::param(ctx.ones(&[2, 1]).unwrap());
    let spy = RefCell::new(Vec::new());

    let result: kiln::Result<f32> = ctx.model_iteration(std::slice::from_ref(&weights), |_| {
        let pred = inputs.matmul(&weights)?;
        spy.borrow_mut().push(pred.val()?);
        // wrong label count for 8 rows
        pred.softmax_cross_entropy(&[0])?.val()?.item()
    });
    assert!(result.is_err());
    assert!(spy.borrow()[0].is_released());
    assert_eq!(weights.val().unwrap().to_vec().unwrap(), vec![1.0, 1.0]);
}

#[test]
fn returned_loss_can_still_be_differentiated() {
    let ctx = ctx(EngineConfig::default());
    let (inputs, targets) = dataset(&ctx);
    let weights = RawTensor::param(ctx.ones(&[2, 1]).unwrap());

    let loss = ctx
        .scoped(|_| inputs.matmul(&weights)?.sub(&targets)?.sqr()?.sum_all())
        .unwrap();
    loss.backward().unwrap();
    assert_eq!(weights.grad().unwrap().dims(), &[2, 1]);
}
