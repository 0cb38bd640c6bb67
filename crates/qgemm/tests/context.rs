use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use qgemm::backend::driver::DeviceDriver;
use qgemm::qgemm::{QGEMM_DEVICE, QGEMM_KERNEL_NAME};
use qgemm::{
    BackendError, BackendResult, DType, DevicePtr, ErrorKind, ExecutionContext, KernelTable,
    NativeStream, QgemmArgs, QgemmKernel, QuantParams, StreamHandle, TensorRef,
};

struct NullDriver;

impl DeviceDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn allocate(&self, _bytes: usize) -> BackendResult<DevicePtr> {
        Ok(DevicePtr(0x1000))
    }

    fn deallocate(&self, _ptr: DevicePtr) -> BackendResult<()> {
        Ok(())
    }

    fn copy_host_to_device(
        &self,
        _stream: StreamHandle,
        _dst: DevicePtr,
        _src: &[u8],
    ) -> BackendResult<()> {
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        _stream: StreamHandle,
        _src: DevicePtr,
        dst: &mut [u8],
    ) -> BackendResult<()> {
        dst.fill(0);
        Ok(())
    }

    fn synchronize_stream(&self, _stream: StreamHandle) -> BackendResult<()> {
        Ok(())
    }

    fn native_stream_handle(&self, stream: StreamHandle) -> BackendResult<NativeStream> {
        Ok(NativeStream(stream.0))
    }
}

fn context() -> ExecutionContext {
    ExecutionContext::new(Arc::new(NullDriver))
}

#[test]
fn resources_are_created_once_per_name() {
    let ctx = context();
    let created = AtomicUsize::new(0);
    let first: Arc<Vec<u32>> = ctx
        .get_or_create_resource("demo.buffer", || {
            created.fetch_add(1, Ordering::SeqCst);
            vec![1, 2, 3]
        })
        .unwrap();
    let second: Arc<Vec<u32>> = ctx
        .get_or_create_resource("demo.buffer", || {
            created.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        })
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(ctx.has_resource("demo.buffer"));
    assert!(!ctx.has_resource("demo.other"));
}

#[test]
fn resource_with_wrong_type_is_an_error() {
    let ctx = context();
    ctx.get_or_create_resource("demo.value", || 7u64).unwrap();
    let err = ctx
        .get_or_create_resource("demo.value", || String::from("seven"))
        .unwrap_err();
    assert!(matches!(err, BackendError::ResourceType { ref name } if name == "demo.value"));
}

#[test]
fn first_signalled_error_wins() {
    let ctx = context();
    assert!(ctx.status().is_ok());

    ctx.signal_error(ErrorKind::Failure, "first");
    ctx.signal_error(ErrorKind::Unsupported, "second");

    let err = ctx.status().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Failure);
    assert_eq!(err.message, "first");

    assert_eq!(ctx.take_error().map(|err| err.message), Some("first".to_string()));
    assert!(ctx.status().is_ok());
}

struct EchoKernel {
    launches: AtomicUsize,
}

impl QgemmKernel for EchoKernel {
    fn launch(
        &self,
        _ctx: &ExecutionContext,
        _stream: StreamHandle,
        args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(args.activation.clone())
    }
}

struct FailingKernel;

impl QgemmKernel for FailingKernel {
    fn launch(
        &self,
        _ctx: &ExecutionContext,
        _stream: StreamHandle,
        _args: &QgemmArgs<'_>,
    ) -> BackendResult<TensorRef> {
        Err(BackendError::invalid_operand("bias length mismatch"))
    }
}

fn launch_with_rank(
    table: &KernelTable,
    ctx: &ExecutionContext,
    rank: usize,
) -> BackendResult<TensorRef> {
    let dims = vec![2; rank];
    let activation = TensorRef::new(DType::Si8, dims, DevicePtr(0x10));
    let weight = TensorRef::new(DType::Si8, [2, 2], DevicePtr(0x20));
    let bias = TensorRef::new(DType::Si8, [2], DevicePtr(0x30));
    let scale = TensorRef::scalar(DType::F32, DevicePtr(0x40));
    let zero_point = TensorRef::scalar(DType::Si32, DevicePtr(0x50));
    let quant = QuantParams {
        scale: &scale,
        zero_point: &zero_point,
    };
    let args = QgemmArgs {
        activation: &activation,
        weight: &weight,
        bias: &bias,
        input: quant,
        weight_quant: quant,
        output: quant,
    };
    table.launch_qgemm(ctx, StreamHandle::DEFAULT, &args)
}

#[test]
fn qgemm_is_registered_for_ranks_two_and_three() {
    let ctx = context();
    let table = KernelTable::from_context(&ctx).unwrap();
    let kernel = Arc::new(EchoKernel {
        launches: AtomicUsize::new(0),
    });
    table.register_qgemm(kernel.clone()).unwrap();

    assert_eq!(
        table.registered(),
        vec![
            (QGEMM_KERNEL_NAME.to_string(), QGEMM_DEVICE.to_string(), 2),
            (QGEMM_KERNEL_NAME.to_string(), QGEMM_DEVICE.to_string(), 3),
        ]
    );
    assert!(table.lookup("ral_pdll_qgemm", "gpu", 2).is_some());
    assert!(table.lookup("ral_pdll_qgemm", "cpu", 2).is_none());

    assert_eq!(launch_with_rank(&table, &ctx, 2).unwrap().rank(), 2);
    assert_eq!(launch_with_rank(&table, &ctx, 3).unwrap().rank(), 3);
    assert_eq!(kernel.launches.load(Ordering::SeqCst), 2);
    assert!(ctx.status().is_ok());

    // Same table through the context registry.
    let again = KernelTable::from_context(&ctx).unwrap();
    assert!(Arc::ptr_eq(&table, &again));
}

#[test]
fn unregistered_rank_is_unsupported() {
    let ctx = context();
    let table = KernelTable::new();
    table
        .register_qgemm(Arc::new(EchoKernel {
            launches: AtomicUsize::new(0),
        }))
        .unwrap();

    let err = launch_with_rank(&table, &ctx, 4).unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { .. }));
    assert_eq!(ctx.status().unwrap_err().kind, ErrorKind::Unsupported);
}

#[test]
fn kernel_errors_are_signalled_on_the_context() {
    let ctx = context();
    let table = KernelTable::new();
    table.register_qgemm(Arc::new(FailingKernel)).unwrap();

    let err = launch_with_rank(&table, &ctx, 2).unwrap_err();
    assert!(matches!(err, BackendError::InvalidOperand(_)));
    let signalled = ctx.status().unwrap_err();
    assert_eq!(signalled.kind, ErrorKind::Failure);
    assert!(signalled.message.contains("ral_pdll_qgemm"));
    assert!(signalled.message.contains("bias length mismatch"));
}
