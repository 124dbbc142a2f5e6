use std::sync::{Arc, Mutex};

use log::debug;
use opexec::executor::{
    Compliance, ExecResult, Executor, ExecutorContextPtr, ExecutorError, ExecutorImplementation,
    ExecutorKind, ExecutorPtr, ImplType, ImplementationPtr, OperationKind, ShapeTolerance,
};
use opexec::fullyconnected::{
    fullyconnected_type_mapping, planar_layout_config, FcAttrs, FcConfig, SRC_PORT, WEI_PORT,
};
use opexec::memory::{arg, MemoryArgs, MemoryDesc, MemoryDescArgs, MemoryDescPtr};
use opexec::post_ops::PostOps;
use opexec::ArgId;

use crate::kernels::{self, FcProblem};

/// Identity of a packed `f32` weights buffer inside the context weight cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackedWeightsKey {
    pub memory_id: u64,
    pub desc: MemoryDesc,
    pub problem: FcProblem,
    pub attrs: FcAttrs,
}

/// Returns the `[n, k]` `f32` weights for `memory`, packing them on first use.
pub fn packed_weights(
    context: &ExecutorContextPtr,
    memory: &MemoryArgs,
    problem: FcProblem,
    attrs: &FcAttrs,
) -> ExecResult<Arc<Vec<f32>>> {
    let weights = arg(memory, ArgId::Wei)?;
    let key = PackedWeightsKey {
        memory_id: weights.id(),
        desc: MemoryDesc::clone(weights.desc()),
        problem,
        attrs: attrs.clone(),
    };
    let (packed, created) = context
        .weight_cache()
        .get_or_create(key, || kernels::pack_weights(weights, problem, attrs))?;
    context.diagnostics().cache_event("packed_weights", !created);
    if created {
        debug!("packed {}x{} weights from {}", problem.n, problem.k, weights.desc());
    }
    Ok(packed)
}

fn port(descs: &MemoryDescArgs, index: usize) -> ExecResult<&MemoryDescPtr> {
    descs
        .src
        .get(index)
        .ok_or_else(|| ExecutorError::InvalidMemory(format!("missing input descriptor {index}")))
}

/// Portable catch-all: any precision combination, any shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefFullyConnected;

impl RefFullyConnected {
    pub const NAME: &'static str = "fullyconnected_ref";
}

impl ExecutorImplementation<FcAttrs> for RefFullyConnected {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn executor_kind(&self) -> ExecutorKind {
        ExecutorKind::Reference
    }

    fn operation_kind(&self) -> OperationKind {
        OperationKind::FullyConnected
    }

    fn shape_tolerance(&self) -> ShapeTolerance {
        ShapeTolerance::Agnostic
    }

    fn is_supported(&self, _config: &FcConfig) -> bool {
        true
    }

    fn is_fully_compliant(&self, config: &FcConfig) -> Compliance<FcAttrs> {
        Compliance::negotiate(config, fullyconnected_type_mapping(), planar_layout_config())
    }

    fn instantiate(
        &self,
        config: &FcConfig,
        _memory: &MemoryArgs,
        context: &ExecutorContextPtr,
    ) -> ExecResult<ExecutorPtr> {
        Ok(Arc::new(RefFcExecutor::new(config, context.clone())))
    }
}

pub fn ref_fullyconnected() -> ImplementationPtr<FcAttrs> {
    Arc::new(RefFullyConnected)
}

struct Prepared {
    problem: FcProblem,
    weights: Arc<Vec<f32>>,
}

/// Naive `f32` executor; narrow operands are widened per call.
pub struct RefFcExecutor {
    attrs: FcAttrs,
    post_ops: PostOps,
    context: ExecutorContextPtr,
    prepared: Mutex<Option<Prepared>>,
}

impl RefFcExecutor {
    pub fn new(config: &FcConfig, context: ExecutorContextPtr) -> Self {
        Self {
            attrs: config.attrs.clone(),
            post_ops: config.post_ops.clone(),
            context,
            prepared: Mutex::new(None),
        }
    }
}

impl Executor for RefFcExecutor {
    fn update(&self, descs: &MemoryDescArgs, memory: &MemoryArgs) -> ExecResult<()> {
        let problem = FcProblem::from_descs(
            port(descs, SRC_PORT)?,
            port(descs, WEI_PORT)?,
            self.attrs.weights_non_transposed,
        )?;
        let weights = packed_weights(&self.context, memory, problem, &self.attrs)?;
        let mut prepared = self
            .prepared
            .lock()
            .map_err(|_| ExecutorError::execution("reference executor state poisoned"))?;
        *prepared = Some(Prepared { problem, weights });
        Ok(())
    }

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()> {
        let (problem, weights) = {
            let prepared = self
                .prepared
                .lock()
                .map_err(|_| ExecutorError::execution("reference executor state poisoned"))?;
            let prepared = prepared
                .as_ref()
                .ok_or_else(|| ExecutorError::execution("execute called before update"))?;
            (prepared.problem, prepared.weights.clone())
        };

        let src = kernels::read_f32(arg(memory, ArgId::Src)?)?;
        if src.len() != problem.m * problem.k {
            return Err(ExecutorError::InvalidMemory(format!(
                "input holds {} elements, expected {}",
                src.len(),
                problem.m * problem.k
            )));
        }
        let bias = kernels::read_bias(memory)?;

        let scratch = self.context.scratch_pad();
        let mut out = scratch.take(problem.output_len());
        kernels::matmul_reference(&src, &weights, problem, &mut out);
        let result = kernels::finalize(
            &mut out,
            problem.n,
            &self.attrs,
            bias.as_deref(),
            &self.post_ops,
        )
        .and_then(|()| kernels::write_f32(arg(memory, ArgId::Dst)?, &out));
        scratch.give(out);
        result
    }

    fn impl_type(&self) -> ImplType {
        ImplType::Reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec::memory::{Memory, TensorData};
    use opexec::post_ops::{Activation, PostOp};
    use opexec::{ExecutorContext, Precision};

    fn bind(src: &[f32], weights: Vec<i8>, dst: Precision) -> (FcConfig, MemoryArgs) {
        let src_mem = Memory::from_data(
            MemoryDesc::planar(Precision::U8, &[1, src.len()]),
            TensorData::U8(src.iter().map(|v| *v as u8).collect()),
        )
        .expect("src");
        let n = weights.len() / src.len();
        let wei_mem = Memory::from_data(
            MemoryDesc::planar(Precision::I8, &[n, src.len()]),
            TensorData::I8(weights),
        )
        .expect("wei");
        let dst_mem = Memory::new(MemoryDesc::planar(dst, &[1, n])).expect("dst");
        let config = FcConfig::new(
            MemoryDescArgs::new(
                [
                    src_mem.desc().clone(),
                    wei_mem.desc().clone(),
                    MemoryDesc::empty(),
                ],
                [dst_mem.desc().clone()],
            ),
            FcAttrs::default().with_dequantization_scales(vec![0.5]),
            vec![PostOp::Activation(Activation::Relu)],
        );
        let memory = MemoryArgs::from([
            (ArgId::Src, src_mem),
            (ArgId::Wei, wei_mem),
            (ArgId::Dst, dst_mem),
        ]);
        (config, memory)
    }

    #[test]
    fn int8_config_is_accepted_as_is() {
        let (config, _) = bind(&[1.0, 2.0], vec![1, 1, -1, -1], Precision::F32);
        assert!(RefFullyConnected.is_fully_compliant(&config).compliant);
    }

    #[test]
    fn computes_scaled_rectified_products() {
        let (config, memory) = bind(&[2.0, 4.0], vec![1, 1, -1, -1, 3, 0], Precision::F32);
        let context = ExecutorContext::default().into_shared();
        let executor = RefFullyConnected
            .instantiate(&config, &memory, &context)
            .expect("instantiate");
        executor.update(&config.descs, &memory).expect("update");
        executor.execute(&memory).expect("execute");
        let out = memory[&ArgId::Dst].read().expect("read").clone();
        assert_eq!(out, TensorData::F32(vec![3.0, 0.0, 3.0]));
        assert_eq!(executor.impl_type(), ImplType::Reference);
    }

    #[test]
    fn execute_before_update_fails() {
        let (config, memory) = bind(&[1.0], vec![1], Precision::F32);
        let executor = RefFcExecutor::new(&config, ExecutorContext::default().into_shared());
        assert!(executor.execute(&memory).is_err());
    }

    #[test]
    fn packed_weights_are_shared_between_executors() {
        let (config, memory) = bind(&[1.0, 1.0], vec![1, 2, 3, 4], Precision::F32);
        let context = ExecutorContext::default().into_shared();
        let first = RefFcExecutor::new(&config, context.clone());
        let second = RefFcExecutor::new(&config, context.clone());
        first.update(&config.descs, &memory).expect("first");
        second.update(&config.descs, &memory).expect("second");
        let stats = context.weight_cache().stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }
}
