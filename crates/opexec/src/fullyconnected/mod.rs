//! Fully-connected operation: attributes, accessors and the implementation catalog.
//!
//! Backend crates register their implementations into [`FULLYCONNECTED_REGISTRARS`]; the
//! catalog orders them by registrar priority once per process.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::executor::{
    Config, ExecResult, ExecutorContext, ExecutorContextPtr, ExecutorFactory,
    ImplementationCatalog, ImplementationRegistrar, OperationAttrs,
};
use crate::memory::{Dimension, MemoryPtr, TensorData};
use crate::post_ops::FloatVec;
use crate::precision::Precision;

pub mod type_mapping;

pub use type_mapping::{
    convolution_1x1_type_mapping, fullyconnected_type_mapping, planar_layout_config,
};

pub const SRC_PORT: usize = 0;
pub const WEI_PORT: usize = 1;
pub const BIAS_PORT: usize = 2;

/// Static parameters of a fully-connected node.
///
/// Weights are `[N, K]` unless `weights_non_transposed`, in which case they are `[K, N]`.
#[derive(Debug, Clone, Default)]
pub struct FcAttrs {
    pub with_bias: bool,
    pub weights_non_transposed: bool,
    pub sparse_weights: bool,
    /// Per-output-channel (or broadcast) scales applied to the accumulator.
    pub dequantization_scales: FloatVec,
    /// Per-output-channel weights zero points, subtracted before multiplication.
    pub decompression_subtract: Option<MemoryPtr>,
    /// Per-output-channel weights scales.
    pub decompression_multiply: Option<MemoryPtr>,
}

impl FcAttrs {
    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    pub fn non_transposed(mut self, non_transposed: bool) -> Self {
        self.weights_non_transposed = non_transposed;
        self
    }

    pub fn with_dequantization_scales(mut self, scales: Vec<f32>) -> Self {
        self.dequantization_scales = FloatVec(scales);
        self
    }

    pub fn with_decompression(
        mut self,
        multiply: Option<MemoryPtr>,
        subtract: Option<MemoryPtr>,
    ) -> Self {
        self.decompression_multiply = multiply;
        self.decompression_subtract = subtract;
        self
    }

    pub fn has_decompression(&self) -> bool {
        self.decompression_multiply.is_some() || self.decompression_subtract.is_some()
    }

    /// Marks the weights sparse when they clear the context's zero-rate threshold.
    pub fn detect_sparse_weights(
        mut self,
        src: Precision,
        weights: &MemoryPtr,
        context: &ExecutorContext,
    ) -> ExecResult<Self> {
        self.sparse_weights =
            use_sparse_weights(src, weights, context.config().sparse_weights_rate)?;
        Ok(self)
    }
}

// Decompression constants are identified by buffer identity and shape.
fn constant_identity(memory: &Option<MemoryPtr>) -> Option<(u64, &[Dimension])> {
    memory
        .as_ref()
        .map(|memory| (memory.id(), memory.desc().shape().dims()))
}

impl PartialEq for FcAttrs {
    fn eq(&self, other: &Self) -> bool {
        self.with_bias == other.with_bias
            && self.weights_non_transposed == other.weights_non_transposed
            && self.sparse_weights == other.sparse_weights
            && self.dequantization_scales == other.dequantization_scales
            && constant_identity(&self.decompression_subtract)
                == constant_identity(&other.decompression_subtract)
            && constant_identity(&self.decompression_multiply)
                == constant_identity(&other.decompression_multiply)
    }
}

impl Eq for FcAttrs {}

impl Hash for FcAttrs {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.with_bias.hash(state);
        self.weights_non_transposed.hash(state);
        self.sparse_weights.hash(state);
        self.dequantization_scales.hash(state);
        constant_identity(&self.decompression_subtract).hash(state);
        constant_identity(&self.decompression_multiply).hash(state);
    }
}

impl fmt::Display for FcAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fc{{bias={}, non_transposed={}, sparse={}, dq_scales={}",
            self.with_bias,
            self.weights_non_transposed,
            self.sparse_weights,
            self.dequantization_scales.len()
        )?;
        if let Some(memory) = &self.decompression_multiply {
            write!(f, ", dec_mul={}", memory.desc().shape())?;
        }
        if let Some(memory) = &self.decompression_subtract {
            write!(f, ", dec_sub={}", memory.desc().shape())?;
        }
        f.write_str("}")
    }
}

impl OperationAttrs for FcAttrs {
    const OPERATION: &'static str = "FullyConnected";

    fn constant_input_mask(&self) -> u32 {
        1 << WEI_PORT
    }
}

pub type FcConfig = Config<FcAttrs>;

pub fn src_type(config: &FcConfig) -> Precision {
    config.src_precision(SRC_PORT)
}

pub fn wei_type(config: &FcConfig) -> Precision {
    config.src_precision(WEI_PORT)
}

pub fn bia_type(config: &FcConfig) -> Precision {
    config.src_precision(BIAS_PORT)
}

pub fn dst_type(config: &FcConfig) -> Precision {
    config.dst_precision(0)
}

/// Static dims of the input, `None` while any axis is dynamic.
pub fn src_dims(config: &FcConfig) -> Option<Vec<usize>> {
    config.src(SRC_PORT)?.shape().static_dims()
}

pub fn wei_dims(config: &FcConfig) -> Option<Vec<usize>> {
    config.src(WEI_PORT)?.shape().static_dims()
}

pub fn src_rank(config: &FcConfig) -> usize {
    config.src(SRC_PORT).map(|d| d.shape().rank()).unwrap_or(0)
}

pub fn wei_rank(config: &FcConfig) -> usize {
    config.src(WEI_PORT).map(|d| d.shape().rank()).unwrap_or(0)
}

pub fn wei_mem_size(config: &FcConfig) -> usize {
    config
        .src(WEI_PORT)
        .map(|d| d.current_mem_size())
        .unwrap_or(0)
}

pub fn has_bias(config: &FcConfig) -> bool {
    config
        .src(BIAS_PORT)
        .is_some_and(|d| d.current_mem_size() != 0)
}

/// Float activations with integer or 4-bit weights that are expanded inside the kernel.
pub fn uses_weights_decompression(src: Precision, wei: Precision) -> bool {
    matches!(src, Precision::F32 | Precision::Bf16)
        && matches!(
            wei,
            Precision::U8 | Precision::Nf4 | Precision::U4 | Precision::I4
        )
}

/// Decides whether int8 weights are sparse enough to be stored compressed.
pub fn use_sparse_weights(
    src: Precision,
    weights: &MemoryPtr,
    sparse_rate: f32,
) -> ExecResult<bool> {
    if sparse_rate >= 1.0
        || weights.precision() != Precision::I8
        || !matches!(src, Precision::U8 | Precision::I8)
    {
        return Ok(false);
    }
    let Some(dims) = weights.desc().shape().static_dims() else {
        return Ok(false);
    };
    if dims.len() != 2 || dims.iter().any(|dim| dim % 64 != 0) {
        return Ok(false);
    }
    let data = weights.read()?;
    let TensorData::I8(values) = &*data else {
        return Ok(false);
    };
    if values.is_empty() {
        return Ok(false);
    }
    let zeros = values.iter().filter(|value| **value == 0).count();
    let rate = zeros as f32 / values.len() as f32;
    log::debug!("fully connected weights zero rate {rate:.3}, threshold {sparse_rate:.3}");
    Ok(rate >= sparse_rate)
}

#[linkme::distributed_slice]
pub static FULLYCONNECTED_REGISTRARS: [ImplementationRegistrar<FcAttrs>] = [..];

/// Process-wide catalog built from every linked registrar.
///
/// Backends register at link time. A binary that depends on a backend crate without naming any
/// of its symbols can lose it to the linker, so call the backend's `register_*_backend` function
/// (e.g. `opexec_backend_faer::register_faer_backend`) before the first lookup.
pub fn fullyconnected_catalog() -> &'static ImplementationCatalog<FcAttrs> {
    static CATALOG: OnceLock<ImplementationCatalog<FcAttrs>> = OnceLock::new();
    CATALOG.get_or_init(|| ImplementationCatalog::from_registrars(&FULLYCONNECTED_REGISTRARS))
}

/// Factory over the process-wide catalog.
pub fn fullyconnected_factory(
    config: &FcConfig,
    context: ExecutorContextPtr,
) -> ExecResult<ExecutorFactory<FcAttrs>> {
    ExecutorFactory::new(config, fullyconnected_catalog(), context)
}
