use std::sync::{Arc, Mutex};

use opexec::executor::{
    Compliance, ExecResult, Executor, ExecutorContextPtr, ExecutorError, ExecutorImplementation,
    ExecutorKind, ExecutorPtr, ImplType, OperationKind, ShapeTolerance,
};
use opexec::fullyconnected::{self as fc, FcAttrs, FcConfig};
use opexec::memory::{arg, MemoryArgs, MemoryDescArgs};
use opexec::{ArgId, Precision};
use opexec_backend_ref_cpu::{kernels, packed_weights};

use crate::primitive::{FaerGemmKey, FaerGemmPrimitive};

/// Plain `f32` GEMM with optional bias; accepts every shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaerGemmFullyConnected;

impl FaerGemmFullyConnected {
    pub const NAME: &'static str = "fullyconnected_faer_gemm";
}

impl ExecutorImplementation<FcAttrs> for FaerGemmFullyConnected {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn executor_kind(&self) -> ExecutorKind {
        ExecutorKind::Faer
    }

    fn operation_kind(&self) -> OperationKind {
        OperationKind::MatMul
    }

    fn shape_tolerance(&self) -> ShapeTolerance {
        ShapeTolerance::Agnostic
    }

    fn is_supported(&self, config: &FcConfig) -> bool {
        let attrs = &config.attrs;
        if !config.post_ops.is_empty() || attrs.sparse_weights || attrs.has_decompression() {
            return false;
        }
        if fc::uses_weights_decompression(fc::src_type(config), fc::wei_type(config)) {
            return false;
        }
        fc::src_type(config) == Precision::F32
            && fc::wei_type(config) == Precision::F32
            && fc::dst_type(config) == Precision::F32
            && matches!(fc::bia_type(config), Precision::F32 | Precision::Undefined)
    }

    fn is_fully_compliant(&self, config: &FcConfig) -> Compliance<FcAttrs> {
        Compliance::accepted(config)
    }

    fn instantiate(
        &self,
        config: &FcConfig,
        _memory: &MemoryArgs,
        context: &ExecutorContextPtr,
    ) -> ExecResult<ExecutorPtr> {
        Ok(Arc::new(FaerGemmExecutor::new(config, context.clone())))
    }
}

struct Bound {
    primitive: Arc<FaerGemmPrimitive>,
    weights: Arc<Vec<f32>>,
}

pub struct FaerGemmExecutor {
    attrs: FcAttrs,
    context: ExecutorContextPtr,
    bound: Mutex<Option<Bound>>,
}

impl FaerGemmExecutor {
    pub fn new(config: &FcConfig, context: ExecutorContextPtr) -> Self {
        Self {
            attrs: config.attrs.clone(),
            context,
            bound: Mutex::new(None),
        }
    }

    /// Primitive bound by the last [`update`](Executor::update).
    pub fn primitive(&self) -> Option<Arc<FaerGemmPrimitive>> {
        self.bound
            .lock()
            .ok()
            .and_then(|bound| bound.as_ref().map(|bound| bound.primitive.clone()))
    }
}

impl Executor for FaerGemmExecutor {
    fn update(&self, descs: &MemoryDescArgs, memory: &MemoryArgs) -> ExecResult<()> {
        let key = FaerGemmKey::new(descs, self.attrs.weights_non_transposed, &self.context)?;
        let primitive = FaerGemmPrimitive::get_or_create(key, &self.context)?;
        let weights = packed_weights(&self.context, memory, primitive.problem(), &self.attrs)?;
        *self
            .bound
            .lock()
            .map_err(|_| ExecutorError::execution("gemm executor state poisoned"))? =
            Some(Bound { primitive, weights });
        Ok(())
    }

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()> {
        let (primitive, weights) = {
            let bound = self
                .bound
                .lock()
                .map_err(|_| ExecutorError::execution("gemm executor state poisoned"))?;
            let bound = bound
                .as_ref()
                .ok_or_else(|| ExecutorError::execution("execute called before update"))?;
            (bound.primitive.clone(), bound.weights.clone())
        };
        let problem = primitive.problem();
        let dst = arg(memory, ArgId::Dst)?;
        let src = arg(memory, ArgId::Src)?;
        // the input is read in place while the output is written
        if src.id() == dst.id() {
            return Err(ExecutorError::InvalidMemory(
                "gemm input and output must be distinct buffers".into(),
            ));
        }
        let bias = kernels::read_bias(memory)?;

        let src = src.read()?;
        let src = src
            .as_f32()
            .ok_or_else(|| ExecutorError::InvalidMemory("gemm input must be f32".into()))?;
        let mut out = dst.write()?;
        let out = out
            .as_f32_mut()
            .ok_or_else(|| ExecutorError::InvalidMemory("gemm output must be f32".into()))?;
        primitive.execute(src, &weights, out)?;
        kernels::finalize(out, problem.n, &self.attrs, bias.as_deref(), &[])
    }

    fn impl_type(&self) -> ImplType {
        self.primitive()
            .map(|primitive| primitive.impl_type())
            .unwrap_or(ImplType::GemmSequential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec::memory::{Memory, MemoryDesc};
    use opexec::ExecutorContext;

    #[test]
    fn aliased_input_and_output_are_rejected() {
        let shared = Memory::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("shared");
        let memory = MemoryArgs::from([
            (ArgId::Src, shared.clone()),
            (ArgId::Wei, Memory::from_f32(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).expect("wei")),
            (ArgId::Dst, shared),
        ]);
        let descs = MemoryDescArgs::new(
            [
                MemoryDesc::planar(Precision::F32, &[2, 2]),
                MemoryDesc::planar(Precision::F32, &[2, 2]),
                MemoryDesc::empty(),
            ],
            [MemoryDesc::planar(Precision::F32, &[2, 2])],
        );
        let config = FcConfig::new(descs.clone(), FcAttrs::default(), Vec::new());
        let executor = FaerGemmExecutor::new(&config, ExecutorContext::default().into_shared());
        executor.update(&descs, &memory).expect("update");
        assert!(matches!(
            executor.execute(&memory),
            Err(ExecutorError::InvalidMemory(_))
        ));
    }
}
