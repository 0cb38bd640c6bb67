use std::sync::Arc;

use qgemm::qgemm::{GenericBackend, QuantizedMatmul};
use qgemm::{DType, ExecutionContext, KernelTable, QgemmConfig, StreamHandle, TensorRef};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::fixtures::{download_i8, release, BackendFixture, HostProblem};

fn generic_only() -> QgemmConfig {
    QgemmConfig::default().with_fused_enabled(false)
}

/// Runs `problem` once and returns the downloaded output and its dims.
fn run_problem<G: GenericBackend + 'static>(
    fixture: &BackendFixture<G>,
    ctx: &ExecutionContext,
    dispatcher: &QuantizedMatmul<G>,
    problem: &HostProblem,
) -> (Vec<usize>, Vec<i8>) {
    let driver = fixture.driver.as_ref();
    let device = problem.upload(driver).expect("upload problem");
    let output = dispatcher
        .quantized_matmul(ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap_or_else(|err| panic!("quantized_matmul failed: {err}"));
    let values = download_i8(driver, &output).expect("download output");
    let dims = output.dims.to_vec();
    release(driver, &output).expect("release output");
    device.release(driver).expect("release inputs");
    (dims, values)
}

fn assert_close(actual: &[i8], expected: &[i8], tolerance: i32) {
    assert_eq!(actual.len(), expected.len(), "output length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let diff = (*a as i32 - *e as i32).abs();
        assert!(
            diff <= tolerance,
            "element {idx}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}

/// Activation `[32, 64]` of 2 and weight `[128, 64]` of 1 accumulate to 128.
/// The output scale of 2.0 stores 64, which dequantizes back to 128.0.
pub fn end_to_end_dequantizes_to_128<G: GenericBackend + 'static>(fixture: &BackendFixture<G>) {
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, QgemmConfig::default());
    let problem = HostProblem::filled(32, 64, 128, 2, 1).with_scales(1.0, 1.0, 2.0);

    let (dims, values) = run_problem(fixture, &ctx, &dispatcher, &problem);

    assert_eq!(dims, vec![32, 128]);
    assert_eq!(values.len(), 32 * 128);
    for value in values {
        assert_eq!(value as f32 * problem.output_scale, 128.0);
    }
    assert!(ctx.status().is_ok());
}

/// With every scale at 1.0 the requantized value 128 does not fit int8.
pub fn unit_scales_saturate_at_127<G: GenericBackend + 'static>(fixture: &BackendFixture<G>) {
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, QgemmConfig::default());
    let problem = HostProblem::filled(32, 64, 128, 2, 1);

    let (_, values) = run_problem(fixture, &ctx, &dispatcher, &problem);

    assert!(values.iter().all(|value| *value == i8::MAX));
}

/// The generic path always reads the activation row-major `[m, k]` and the
/// weight as `[n, k]`, whatever the problem shape.
pub fn generic_path_layout_matches_reference<G: GenericBackend + 'static>(
    fixture: &BackendFixture<G>,
) {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, generic_only());
    let problem = HostProblem::random(&mut rng, 32, 64, 128);

    let (dims, values) = run_problem(fixture, &ctx, &dispatcher, &problem);

    assert_eq!(dims, vec![32, 128]);
    assert_close(&values, &problem.reference(), 1);

    // The same weight values stored transposed describe a different matrix.
    let mut transposed = problem.clone();
    transposed.weight = (0..problem.n * problem.k)
        .map(|idx| {
            let (row, col) = (idx / problem.n, idx % problem.n);
            problem.weight[col * problem.k + row]
        })
        .collect();
    let (_, other) = run_problem(fixture, &ctx, &dispatcher, &transposed);
    assert_close(&other, &transposed.reference(), 1);
    assert_ne!(other, values);
}

pub fn fused_and_fallback_agree<G: GenericBackend + 'static>(fixture: &BackendFixture<G>) {
    let mut rng = StdRng::seed_from_u64(17);
    let problem = HostProblem::random(&mut rng, 24, 64, 48);

    let fused_ctx = fixture.context();
    let fused = fixture.dispatcher(&fused_ctx, QgemmConfig::default());
    let (_, fast) = run_problem(fixture, &fused_ctx, &fused, &problem);

    let generic_ctx = fixture.context();
    let generic = fixture.dispatcher(&generic_ctx, generic_only());
    let (_, fallback) = run_problem(fixture, &generic_ctx, &generic, &problem);

    assert_close(&fast, &fallback, 1);
    assert_close(&fallback, &problem.reference(), 1);
}

/// Shapes the fused kernel may decline still produce correct output.
pub fn unaligned_shape_matches_reference<G: GenericBackend + 'static>(
    fixture: &BackendFixture<G>,
) {
    let mut rng = StdRng::seed_from_u64(3);
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, QgemmConfig::default());
    let problem = HostProblem::random(&mut rng, 5, 7, 9);

    let (dims, values) = run_problem(fixture, &ctx, &dispatcher, &problem);

    assert_eq!(dims, vec![5, 9]);
    assert_close(&values, &problem.reference(), 1);
}

pub fn rank3_activation_flattens_leading_dims<G: GenericBackend + 'static>(
    fixture: &BackendFixture<G>,
) {
    let mut rng = StdRng::seed_from_u64(99);
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, QgemmConfig::default());
    let flat = HostProblem::random(&mut rng, 8, 32, 16);
    let batched = flat.clone().with_activation_dims(&[2, 4, 32]);

    let (flat_dims, flat_values) = run_problem(fixture, &ctx, &dispatcher, &flat);
    let (batched_dims, batched_values) = run_problem(fixture, &ctx, &dispatcher, &batched);

    assert_eq!(flat_dims, vec![8, 16]);
    assert_eq!(batched_dims, vec![2, 4, 16]);
    assert_eq!(flat_values, batched_values);
}

pub fn empty_activation_returns_empty_output<G: GenericBackend + 'static>(
    fixture: &BackendFixture<G>,
) {
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, QgemmConfig::default());
    let problem = HostProblem::filled(0, 64, 128, 1, 1);
    let driver = fixture.driver.as_ref();
    let device = problem.upload(driver).expect("upload problem");

    let output = dispatcher
        .quantized_matmul(&ctx, StreamHandle::DEFAULT, &device.args())
        .expect("empty qgemm");

    assert_eq!(output.dtype, DType::Si8);
    assert_eq!(output.dims.as_slice(), &[0, 128]);
    assert!(output.data.is_null());
    assert_eq!(dispatcher.scale_cache().stats().misses, 0);
    assert_eq!(dispatcher.descriptor_cache().stats().misses, 0);
    device.release(driver).expect("release inputs");
}

pub fn repeated_calls_reuse_caches<G: GenericBackend + 'static>(fixture: &BackendFixture<G>) {
    let mut rng = StdRng::seed_from_u64(5);
    let ctx = fixture.context();
    let dispatcher = fixture.dispatcher(&ctx, generic_only());
    let problem = HostProblem::random(&mut rng, 16, 32, 8);
    let driver = fixture.driver.as_ref();
    let device = problem.upload(driver).expect("upload problem");

    let mut outputs = Vec::new();
    for _ in 0..3 {
        let output = dispatcher
            .quantized_matmul(&ctx, StreamHandle::DEFAULT, &device.args())
            .expect("qgemm");
        outputs.push(download_i8(driver, &output).expect("download"));
        release(driver, &output).expect("release output");
    }

    assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
    let descriptors = dispatcher.descriptor_cache().stats();
    assert_eq!((descriptors.misses, descriptors.hits), (1, 2));
    let scales = dispatcher.scale_cache().stats();
    assert_eq!((scales.misses, scales.hits), (1, 2));

    // A second dispatcher on the same context shares both caches.
    let sibling = fixture.dispatcher(&ctx, generic_only());
    assert!(Arc::ptr_eq(dispatcher.scale_cache(), sibling.scale_cache()));
    assert!(Arc::ptr_eq(
        dispatcher.descriptor_cache(),
        sibling.descriptor_cache()
    ));
    device.release(driver).expect("release inputs");
}

pub fn kernel_table_dispatches_by_rank<G: GenericBackend + 'static>(fixture: &BackendFixture<G>) {
    let mut rng = StdRng::seed_from_u64(11);
    let ctx = fixture.context();
    let table = KernelTable::from_context(&ctx).expect("kernel table");
    table
        .register_qgemm(Arc::new(fixture.dispatcher(&ctx, QgemmConfig::default())))
        .expect("register qgemm");
    let driver = fixture.driver.as_ref();

    let problem = HostProblem::random(&mut rng, 6, 16, 8).with_activation_dims(&[2, 3, 16]);
    let device = problem.upload(driver).expect("upload problem");
    let output: TensorRef = table
        .launch_qgemm(&ctx, StreamHandle::DEFAULT, &device.args())
        .expect("launch rank 3");
    assert_eq!(output.dims.as_slice(), &[2, 3, 8]);
    assert_close(
        &download_i8(driver, &output).expect("download"),
        &problem.reference(),
        1,
    );
    release(driver, &output).expect("release output");
    device.release(driver).expect("release inputs");

    let rank4 = HostProblem::random(&mut rng, 4, 16, 8).with_activation_dims(&[1, 2, 2, 16]);
    let device = rank4.upload(driver).expect("upload problem");
    assert!(table
        .launch_qgemm(&ctx, StreamHandle::DEFAULT, &device.args())
        .is_err());
    assert!(ctx.status().is_err());
    device.release(driver).expect("release inputs");
}
