use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use anyhow::Result;
use qgemm::qgemm::{
    FusedBackend, FusedGemmArgs, GemmCall, GemmPlan, GenericBackend, QuantizedMatmul, Transpose,
};
use qgemm::{
    BackendError, BackendResult, DType, ErrorKind, ExecutionContext, QgemmConfig, StreamHandle,
};
use qgemm_backend_ref_cpu::{HostDriver, RefFusedBackend, RefLtBackend, RefLtBundle};
use qgemm_backend_tests::fixtures::{
    download_i8, release, upload_f32_scalar, upload_i32_scalar, HostProblem,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Generic backend that counts calls, records plans and can be told to fail.
struct CountingGeneric {
    inner: RefLtBackend,
    bundles: AtomicUsize,
    calls: AtomicUsize,
    plans: Mutex<Vec<GemmPlan>>,
    fail_status: Option<i32>,
}

impl CountingGeneric {
    fn new(driver: &Arc<HostDriver>) -> Self {
        Self {
            inner: RefLtBackend::new(Arc::clone(driver)),
            bundles: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            plans: Mutex::new(Vec::new()),
            fail_status: None,
        }
    }

    fn failing(driver: &Arc<HostDriver>, status: i32) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::new(driver)
        }
    }
}

impl GenericBackend for CountingGeneric {
    type Bundle = RefLtBundle;

    fn backend_name(&self) -> &str {
        "counting"
    }

    fn create_bundle(&self, plan: &GemmPlan) -> BackendResult<RefLtBundle> {
        self.bundles.fetch_add(1, Ordering::SeqCst);
        self.plans.lock().unwrap().push(plan.clone());
        self.inner.create_bundle(plan)
    }

    fn matmul(
        &self,
        stream: StreamHandle,
        bundle: &RefLtBundle,
        call: &GemmCall,
    ) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_status {
            return Err(BackendError::BackendCall {
                call: "cublasLtMatmul",
                status,
            });
        }
        self.inner.matmul(stream, bundle, call)
    }
}

/// Fused backend that either delegates to the reference kernel or declines.
struct ScriptedFused {
    inner: RefFusedBackend,
    accept: bool,
    calls: AtomicUsize,
    last_args: Mutex<Option<FusedGemmArgs>>,
}

impl ScriptedFused {
    fn new(driver: &Arc<HostDriver>, accept: bool) -> Self {
        Self {
            inner: RefFusedBackend::new(Arc::clone(driver)),
            accept,
            calls: AtomicUsize::new(0),
            last_args: Mutex::new(None),
        }
    }
}

impl FusedBackend for ScriptedFused {
    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn gemm(&self, args: &FusedGemmArgs) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_args.lock().unwrap() = Some(*args);
        self.accept && self.inner.gemm(args)
    }
}

struct Harness {
    driver: Arc<HostDriver>,
    generic: Arc<CountingGeneric>,
    fused: Arc<ScriptedFused>,
    ctx: ExecutionContext,
}

impl Harness {
    fn new(generic: impl FnOnce(&Arc<HostDriver>) -> CountingGeneric, accept_fused: bool) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let driver = Arc::new(HostDriver::new());
        let generic = Arc::new(generic(&driver));
        let fused = Arc::new(ScriptedFused::new(&driver, accept_fused));
        let ctx = ExecutionContext::new(driver.clone());
        Self {
            driver,
            generic,
            fused,
            ctx,
        }
    }

    fn dispatcher(&self, config: QgemmConfig) -> QuantizedMatmul<CountingGeneric> {
        QuantizedMatmul::from_context(
            &self.ctx,
            Arc::clone(&self.generic),
            Some(self.fused.clone() as Arc<dyn FusedBackend>),
            config,
        )
        .expect("dispatcher")
    }

    fn bundles(&self) -> usize {
        self.generic.bundles.load(Ordering::SeqCst)
    }

    fn generic_calls(&self) -> usize {
        self.generic.calls.load(Ordering::SeqCst)
    }

    fn fused_calls(&self) -> usize {
        self.fused.calls.load(Ordering::SeqCst)
    }
}

fn run(harness: &Harness, config: QgemmConfig, problem: &HostProblem) -> Result<Vec<i8>> {
    let dispatcher = harness.dispatcher(config);
    let device = problem.upload(harness.driver.as_ref())?;
    let output = dispatcher.quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())?;
    let values = download_i8(harness.driver.as_ref(), &output)?;
    release(harness.driver.as_ref(), &output)?;
    device.release(harness.driver.as_ref())?;
    Ok(values)
}

#[test]
fn empty_operands_issue_no_backend_work() {
    let harness = Harness::new(CountingGeneric::new, true);
    let dispatcher = harness.dispatcher(QgemmConfig::default());

    for (m, k, n) in [(0, 64, 128), (4, 0, 8), (4, 16, 0)] {
        let problem = HostProblem::filled(m, k, n, 1, 1);
        let device = problem.upload(harness.driver.as_ref()).unwrap();
        let before = harness.driver.stats();

        let output = dispatcher
            .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
            .unwrap();

        assert_eq!(output.dims.as_slice(), &[m, n]);
        assert!(output.data.is_null());
        let after = harness.driver.stats();
        assert_eq!(after.allocations, before.allocations);
        assert_eq!(after.device_to_host_copies, before.device_to_host_copies);
        device.release(harness.driver.as_ref()).unwrap();
    }

    assert_eq!(harness.fused_calls(), 0);
    assert_eq!(harness.generic_calls(), 0);
    assert_eq!(harness.bundles(), 0);
    assert!(harness.ctx.status().is_ok());
}

#[test]
fn fused_success_skips_generic_backend() {
    let harness = Harness::new(CountingGeneric::new, true);
    let mut rng = StdRng::seed_from_u64(1);
    let problem = HostProblem::random(&mut rng, 8, 16, 12);

    let values = run(&harness, QgemmConfig::default(), &problem).unwrap();

    assert_eq!(values, problem.reference());
    assert_eq!(harness.fused_calls(), 1);
    assert_eq!(harness.generic_calls(), 0);
    assert_eq!(harness.bundles(), 0);

    let args = harness.fused.last_args.lock().unwrap().expect("fused args");
    assert_eq!((args.a.rows, args.a.cols), (8, 16));
    assert!(!args.a.transposed);
    assert_eq!((args.b.rows, args.b.cols), (12, 16));
    assert!(args.b.transposed);
    assert_eq!((args.c.rows, args.c.cols), (8, 12));
    assert_eq!(args.batch, 1);
    assert_eq!(args.beta, 1.0);
    assert_eq!(args.alpha, problem.combined_scale());
}

#[test]
fn fused_decline_falls_back_to_generic() {
    let harness = Harness::new(CountingGeneric::new, false);
    let mut rng = StdRng::seed_from_u64(2);
    let problem = HostProblem::random(&mut rng, 8, 16, 12);

    let values = run(&harness, QgemmConfig::default(), &problem).unwrap();

    assert_eq!(values, problem.reference());
    assert_eq!(harness.fused_calls(), 1);
    assert_eq!(harness.generic_calls(), 1);
    assert!(harness.ctx.status().is_ok());
}

#[test]
fn disabled_fused_path_is_never_tried() {
    let harness = Harness::new(CountingGeneric::new, true);
    let mut rng = StdRng::seed_from_u64(3);
    let problem = HostProblem::random(&mut rng, 4, 8, 4);

    run(
        &harness,
        QgemmConfig::default().with_fused_enabled(false),
        &problem,
    )
    .unwrap();

    assert_eq!(harness.fused_calls(), 0);
    assert_eq!(harness.generic_calls(), 1);
}

#[test]
fn large_k_accumulator_wraps_on_generic_path() {
    let harness = Harness::new(CountingGeneric::new, true);
    // 127 * 127 * 140_000 exceeds i32::MAX and wraps negative.
    let problem = HostProblem::filled(1, 140_000, 4, 127, 127);

    let values = run(
        &harness,
        QgemmConfig::default().with_fused_enabled(false),
        &problem,
    )
    .unwrap();

    assert_eq!(values, problem.reference());
    assert_eq!(values, vec![-128; 4]);
    assert_eq!(harness.generic_calls(), 1);
}

#[test]
fn large_k_accumulator_wraps_on_fused_path() {
    let harness = Harness::new(CountingGeneric::new, true);
    let problem = HostProblem::filled(1, 140_000, 4, 127, 127);

    let values = run(&harness, QgemmConfig::default(), &problem).unwrap();

    assert_eq!(values, problem.reference());
    assert_eq!(values, vec![-128; 4]);
    assert_eq!(harness.fused_calls(), 1);
    assert_eq!(harness.generic_calls(), 0);
}

#[test]
fn generic_plan_swaps_operands_into_column_major() {
    let harness = Harness::new(CountingGeneric::new, false);
    let mut rng = StdRng::seed_from_u64(4);
    let problem = HostProblem::random(&mut rng, 32, 64, 128);

    run(&harness, QgemmConfig::default(), &problem).unwrap();

    let plans = harness.generic.plans.lock().unwrap();
    assert_eq!(plans.len(), 1);
    let plan = &plans[0];
    assert_eq!((plan.m, plan.n, plan.k), (128, 32, 64));
    assert_eq!(plan.transa, Transpose::Transpose);
    assert_eq!(plan.transb, Transpose::None);
    assert_eq!((plan.a.ld, plan.b.ld, plan.c.ld), (64, 64, 128));
}

#[test]
fn generic_failure_signals_context_and_frees_output() {
    let harness = Harness::new(|driver| CountingGeneric::failing(driver, 13), false);
    let mut rng = StdRng::seed_from_u64(5);
    let problem = HostProblem::random(&mut rng, 4, 8, 4);
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let device = problem.upload(harness.driver.as_ref()).unwrap();
    let live_before = harness.driver.stats().live_allocations;

    let err = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap_err();

    assert!(matches!(
        err,
        BackendError::BackendCall {
            call: "cublasLtMatmul",
            status: 13
        }
    ));
    let signalled = harness.ctx.status().unwrap_err();
    assert_eq!(signalled.kind, ErrorKind::Failure);
    assert!(signalled.message.contains("counting"));
    assert!(signalled.message.contains("cublasLtMatmul"));
    assert_eq!(harness.driver.stats().live_allocations, live_before);
    device.release(harness.driver.as_ref()).unwrap();
}

#[test]
fn zero_points_are_ignored() {
    let harness = Harness::new(CountingGeneric::new, true);
    let mut rng = StdRng::seed_from_u64(6);
    let problem = HostProblem::random(&mut rng, 4, 8, 8);
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let driver = harness.driver.as_ref();
    let mut device = problem.upload(driver).unwrap();
    release(driver, &device.zero_point).unwrap();
    device.zero_point = upload_i32_scalar(driver, 17).unwrap();

    let output = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap();

    assert_eq!(download_i8(driver, &output).unwrap(), problem.reference());
    assert!(driver.is_live(output.data));
    release(driver, &output).unwrap();
    assert!(!driver.is_live(output.data));
    device.release(driver).unwrap();
}

#[test]
fn zero_output_scale_is_rejected_before_allocation() {
    let harness = Harness::new(CountingGeneric::new, true);
    let mut rng = StdRng::seed_from_u64(7);
    let problem = HostProblem::random(&mut rng, 4, 8, 8);
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let driver = harness.driver.as_ref();
    let mut device = problem.upload(driver).unwrap();
    release(driver, &device.output_scale).unwrap();
    device.output_scale = upload_f32_scalar(driver, 0.0).unwrap();
    let allocations = driver.stats().allocations;

    let err = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap_err();

    assert!(matches!(err, BackendError::InvalidOperand(_)));
    assert_eq!(driver.stats().allocations, allocations);
    assert_eq!(harness.fused_calls(), 0);
    assert_eq!(dispatcher.scale_cache().stats().misses, 1);
    device.release(driver).unwrap();
}

#[test]
fn cached_scale_skips_device_reads() {
    let harness = Harness::new(CountingGeneric::new, true);
    let mut rng = StdRng::seed_from_u64(8);
    let problem = HostProblem::random(&mut rng, 4, 8, 8);
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let driver = harness.driver.as_ref();
    let device = problem.upload(driver).unwrap();

    let first = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap();
    let after_first = driver.stats();
    assert_eq!(after_first.device_to_host_copies, 3);
    assert_eq!(after_first.synchronizations, 1);

    let second = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
        .unwrap();
    let after_second = driver.stats();
    assert_eq!(after_second.device_to_host_copies, 3);
    assert_eq!(after_second.synchronizations, 1);

    release(driver, &first).unwrap();
    release(driver, &second).unwrap();
    device.release(driver).unwrap();
}

#[test]
fn malformed_operands_are_rejected() {
    let harness = Harness::new(CountingGeneric::new, true);
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let driver = harness.driver.as_ref();
    let problem = HostProblem::filled(4, 8, 8, 1, 1);

    let mut wrong_k = problem.upload(driver).unwrap();
    wrong_k.activation.dims[1] = 6;
    let err = dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &wrong_k.args())
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidOperand(_)));
    wrong_k.release(driver).unwrap();

    let mut wrong_bias = problem.upload(driver).unwrap();
    wrong_bias.bias.dims[0] = 7;
    assert!(dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &wrong_bias.args())
        .is_err());
    wrong_bias.release(driver).unwrap();

    let mut wrong_dtype = problem.upload(driver).unwrap();
    wrong_dtype.input_scale.dtype = DType::Si32;
    assert!(dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &wrong_dtype.args())
        .is_err());
    wrong_dtype.release(driver).unwrap();

    let mut vector_activation = problem.upload(driver).unwrap();
    vector_activation.activation.dims.remove(0);
    assert!(dispatcher
        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &vector_activation.args())
        .is_err());
    vector_activation.release(driver).unwrap();

    assert_eq!(harness.generic_calls() + harness.fused_calls(), 0);
}

#[test]
fn concurrent_first_calls_build_one_bundle_and_load_scales_once() {
    const THREADS: usize = 8;
    let harness = Harness::new(CountingGeneric::new, false);
    let mut rng = StdRng::seed_from_u64(9);
    let problem = HostProblem::random(&mut rng, 16, 32, 24);
    let expected = problem.reference();
    let dispatcher = harness.dispatcher(QgemmConfig::default());
    let driver = harness.driver.as_ref();
    let device = problem.upload(driver).unwrap();
    let barrier = Barrier::new(THREADS);

    let outputs: Vec<Vec<i8>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    let output = dispatcher
                        .quantized_matmul(&harness.ctx, StreamHandle::DEFAULT, &device.args())
                        .unwrap();
                    let values = download_i8(driver, &output).unwrap();
                    release(driver, &output).unwrap();
                    values
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outputs.iter().all(|values| *values == expected));
    assert_eq!(harness.bundles(), 1);
    assert_eq!(harness.generic_calls(), THREADS);
    assert_eq!(dispatcher.scale_cache().stats().misses, 1);
    assert_eq!(driver.stats().device_to_host_copies, 3 + THREADS as u64);
    device.release(driver).unwrap();
}
