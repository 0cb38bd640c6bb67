//! Device-side fixtures for quantized GEMM tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use qgemm::backend::driver::DeviceDriver;
use qgemm::qgemm::{requantize_s8, CombinedScale, FusedBackend, GenericBackend};
use qgemm::{
    BufferToken, DType, ExecutionContext, QgemmArgs, QgemmConfig, QuantParams,
    QuantizedMatmul, StreamHandle, TensorRef,
};
use rand::rngs::StdRng;
use rand::Rng;

/// A driver plus the backends under test.
pub struct BackendFixture<G: GenericBackend> {
    pub driver: Arc<dyn DeviceDriver>,
    pub generic: Arc<G>,
    pub fused: Option<Arc<dyn FusedBackend>>,
}

impl<G: GenericBackend + 'static> BackendFixture<G> {
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(&self.driver))
    }

    pub fn dispatcher(&self, ctx: &ExecutionContext, config: QgemmConfig) -> QuantizedMatmul<G> {
        QuantizedMatmul::from_context(ctx, Arc::clone(&self.generic), self.fused.clone(), config)
            .expect("dispatcher resources")
    }
}

pub fn upload_i8(
    driver: &dyn DeviceDriver,
    dims: &[usize],
    values: &[i8],
) -> Result<TensorRef> {
    let expected: usize = dims.iter().product();
    ensure!(
        expected == values.len(),
        "dims {dims:?} need {expected} values, got {}",
        values.len()
    );
    if values.is_empty() {
        return Ok(TensorRef::empty(DType::Si8, dims.iter().copied()));
    }
    let ptr = driver.allocate(values.len())?;
    let bytes: Vec<u8> = values.iter().map(|value| *value as u8).collect();
    driver.copy_host_to_device(StreamHandle::DEFAULT, ptr, &bytes)?;
    Ok(TensorRef::new(DType::Si8, dims.iter().copied(), ptr))
}

pub fn upload_f32_scalar(driver: &dyn DeviceDriver, value: f32) -> Result<TensorRef> {
    let ptr = driver.allocate(4)?;
    driver.copy_host_to_device(StreamHandle::DEFAULT, ptr, &value.to_ne_bytes())?;
    Ok(TensorRef::scalar(DType::F32, ptr))
}

pub fn upload_i32_scalar(driver: &dyn DeviceDriver, value: i32) -> Result<TensorRef> {
    let ptr = driver.allocate(4)?;
    driver.copy_host_to_device(StreamHandle::DEFAULT, ptr, &value.to_ne_bytes())?;
    Ok(TensorRef::scalar(DType::Si32, ptr))
}

pub fn download_i8(driver: &dyn DeviceDriver, tensor: &TensorRef) -> Result<Vec<i8>> {
    let len = tensor.num_elements()?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut bytes = vec![0u8; len];
    driver
        .copy_device_to_host(StreamHandle::DEFAULT, tensor.data, &mut bytes)
        .context("download int8 tensor")?;
    driver.synchronize_stream(StreamHandle::DEFAULT)?;
    Ok(bytes.into_iter().map(|byte| byte as i8).collect())
}

pub fn release(driver: &dyn DeviceDriver, tensor: &TensorRef) -> Result<()> {
    if !tensor.data.is_null() {
        driver.deallocate(tensor.data)?;
    }
    Ok(())
}

/// Host-side description of one quantized GEMM problem.
#[derive(Debug, Clone)]
pub struct HostProblem {
    pub activation_dims: Vec<usize>,
    pub activation: Vec<i8>,
    /// Row-major `[n, k]`.
    pub weight: Vec<i8>,
    pub bias: Vec<i8>,
    pub n: usize,
    pub k: usize,
    pub input_scale: f32,
    pub weight_scale: f32,
    pub output_scale: f32,
}

impl HostProblem {
    pub fn filled(m: usize, k: usize, n: usize, activation: i8, weight: i8) -> Self {
        Self {
            activation_dims: vec![m, k],
            activation: vec![activation; m * k],
            weight: vec![weight; n * k],
            bias: vec![0; n],
            n,
            k,
            input_scale: 1.0,
            weight_scale: 1.0,
            output_scale: 1.0,
        }
    }

    pub fn random(rng: &mut StdRng, m: usize, k: usize, n: usize) -> Self {
        Self {
            activation_dims: vec![m, k],
            activation: random_i8(rng, m * k, 8),
            weight: random_i8(rng, n * k, 8),
            bias: random_i8(rng, n, 16),
            n,
            k,
            input_scale: 0.05,
            weight_scale: 0.05,
            output_scale: 0.1,
        }
    }

    pub fn with_scales(mut self, input: f32, weight: f32, output: f32) -> Self {
        self.input_scale = input;
        self.weight_scale = weight;
        self.output_scale = output;
        self
    }

    pub fn with_activation_dims(mut self, dims: &[usize]) -> Self {
        self.activation_dims = dims.to_vec();
        self
    }

    pub fn rows(&self) -> usize {
        self.activation_dims[..self.activation_dims.len() - 1]
            .iter()
            .product()
    }

    pub fn combined_scale(&self) -> f32 {
        CombinedScale::compose(self.input_scale, self.weight_scale, self.output_scale)
            .expect("fixture scales are valid")
            .value()
    }

    /// Integer matmul with the same requantization the kernels apply.
    pub fn reference(&self) -> Vec<i8> {
        let (m, k, n) = (self.rows(), self.k, self.n);
        let alpha = self.combined_scale();
        let mut out = Vec::with_capacity(m * n);
        for i in 0..m {
            for j in 0..n {
                let acc = (0..k).fold(0i32, |acc, kk| {
                    let prod = (self.activation[i * k + kk] as i32)
                        .wrapping_mul(self.weight[j * k + kk] as i32);
                    acc.wrapping_add(prod)
                });
                out.push(requantize_s8(acc, alpha, self.bias[j] as f32));
            }
        }
        out
    }

    pub fn upload(&self, driver: &dyn DeviceDriver) -> Result<DeviceProblem> {
        Ok(DeviceProblem {
            activation: upload_i8(driver, &self.activation_dims, &self.activation)?,
            weight: upload_i8(driver, &[self.n, self.k], &self.weight)?,
            bias: upload_i8(driver, &[self.n], &self.bias)?,
            input_scale: upload_f32_scalar(driver, self.input_scale)?
                .with_token(next_token()),
            weight_scale: upload_f32_scalar(driver, self.weight_scale)?
                .with_token(next_token()),
            output_scale: upload_f32_scalar(driver, self.output_scale)?
                .with_token(next_token()),
            zero_point: upload_i32_scalar(driver, 0)?,
        })
    }
}

/// Device copies of a [`HostProblem`].
pub struct DeviceProblem {
    pub activation: TensorRef,
    pub weight: TensorRef,
    pub bias: TensorRef,
    pub input_scale: TensorRef,
    pub weight_scale: TensorRef,
    pub output_scale: TensorRef,
    pub zero_point: TensorRef,
}

impl DeviceProblem {
    pub fn args(&self) -> QgemmArgs<'_> {
        QgemmArgs {
            activation: &self.activation,
            weight: &self.weight,
            bias: &self.bias,
            input: QuantParams {
                scale: &self.input_scale,
                zero_point: &self.zero_point,
            },
            weight_quant: QuantParams {
                scale: &self.weight_scale,
                zero_point: &self.zero_point,
            },
            output: QuantParams {
                scale: &self.output_scale,
                zero_point: &self.zero_point,
            },
        }
    }

    pub fn release(self, driver: &dyn DeviceDriver) -> Result<()> {
        for tensor in [
            &self.activation,
            &self.weight,
            &self.bias,
            &self.input_scale,
            &self.weight_scale,
            &self.output_scale,
            &self.zero_point,
        ] {
            release(driver, tensor)?;
        }
        Ok(())
    }
}

pub fn random_i8(rng: &mut StdRng, len: usize, magnitude: i8) -> Vec<i8> {
    (0..len)
        .map(|_| rng.gen_range(-magnitude..=magnitude))
        .collect()
}

/// Fresh compiler-style buffer token, unique within the process.
pub fn next_token() -> BufferToken {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    BufferToken(NEXT.fetch_add(1, Ordering::Relaxed))
}
