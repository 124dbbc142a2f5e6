//! Row-blocked kernel with fused epilogue.
//!
//! Rows are processed in blocks small enough for the block's accumulator to stay in cache while
//! bias, scales and post-ops are applied. Only profitable for mid-sized weights, hence the shape
//! heuristic in [`FaerBlockedFullyConnected::is_shape_suitable`].

use std::sync::{Arc, Mutex};

use faer::Par;
use log::debug;
use opexec::executor::{
    Compliance, ExecResult, Executor, ExecutorContextPtr, ExecutorError, ExecutorImplementation,
    ExecutorKind, ExecutorPtr, ImplType, OperationKind, ShapeTolerance,
};
use opexec::fullyconnected::{
    self as fc, convolution_1x1_type_mapping, planar_layout_config, FcAttrs, FcConfig, SRC_PORT,
    WEI_PORT,
};
use opexec::memory::{arg, MemoryArgs, MemoryDescArgs};
use opexec::post_ops::PostOps;
use opexec::{ArgId, Precision};
use opexec_backend_ref_cpu::{kernels, packed_weights, FcProblem};

use crate::gemm_into;

pub const BLOCK_ROWS: usize = 64;

const MAX_WEIGHTS_BYTES: usize = 16 << 20;
const MIN_WIDTH: usize = 2;
const MAX_WIDTH: usize = 3136;
const MIN_CHANNELS: usize = 96;
const MAX_INPUT_CHANNELS: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct FaerBlockedFullyConnected;

impl FaerBlockedFullyConnected {
    pub const NAME: &'static str = "fullyconnected_faer_blocked";
}

impl ExecutorImplementation<FcAttrs> for FaerBlockedFullyConnected {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn executor_kind(&self) -> ExecutorKind {
        ExecutorKind::Faer
    }

    fn operation_kind(&self) -> OperationKind {
        OperationKind::Convolution
    }

    fn shape_tolerance(&self) -> ShapeTolerance {
        ShapeTolerance::Dependent
    }

    // Narrow weights are accepted here; negotiation widens them to f32. Unlike a plain 1x1
    // convolution this kernel deliberately takes weights decompression too, applying the
    // subtract/multiply constants while packing.
    fn is_supported(&self, config: &FcConfig) -> bool {
        if config.attrs.sparse_weights || fc::src_type(config) != Precision::F32 {
            return false;
        }
        if !matches!(fc::src_rank(config), 2 | 3) || fc::wei_rank(config) != 2 {
            return false;
        }
        config.dst(0).is_some_and(|dst| dst.offset() == 0)
    }

    fn is_shape_suitable(&self, config: &FcConfig) -> bool {
        let (Some(src), Some(wei)) = (fc::src_dims(config), fc::wei_dims(config)) else {
            return false;
        };
        if fc::wei_mem_size(config) >= MAX_WEIGHTS_BYTES || src.len() < 2 || wei.len() != 2 {
            return false;
        }
        let width = src[src.len() - 2];
        let input_channels = src[src.len() - 1];
        let output_channels = if config.attrs.weights_non_transposed {
            wei[1]
        } else {
            wei[0]
        };
        (MIN_WIDTH..=MAX_WIDTH).contains(&width)
            && (MIN_CHANNELS..=MAX_INPUT_CHANNELS).contains(&input_channels)
            && (MIN_CHANNELS..=input_channels * 4).contains(&output_channels)
    }

    fn is_fully_compliant(&self, config: &FcConfig) -> Compliance<FcAttrs> {
        Compliance::negotiate(config, convolution_1x1_type_mapping(), planar_layout_config())
    }

    fn instantiate(
        &self,
        config: &FcConfig,
        _memory: &MemoryArgs,
        context: &ExecutorContextPtr,
    ) -> ExecResult<ExecutorPtr> {
        Ok(Arc::new(FaerBlockedExecutor::new(config, context.clone())))
    }
}

struct Prepared {
    problem: FcProblem,
    weights: Arc<Vec<f32>>,
}

pub struct FaerBlockedExecutor {
    attrs: FcAttrs,
    post_ops: PostOps,
    context: ExecutorContextPtr,
    prepared: Mutex<Option<Prepared>>,
}

impl FaerBlockedExecutor {
    pub fn new(config: &FcConfig, context: ExecutorContextPtr) -> Self {
        Self {
            attrs: config.attrs.clone(),
            post_ops: config.post_ops.clone(),
            context,
            prepared: Mutex::new(None),
        }
    }

    fn run_blocks(
        &self,
        problem: FcProblem,
        src: &[f32],
        weights: &[f32],
        bias: Option<&[f32]>,
        out: &mut [f32],
    ) -> ExecResult<()> {
        let FcProblem { m, k, n } = problem;
        let mut row = 0;
        while row < m {
            let rows = BLOCK_ROWS.min(m - row);
            let block = FcProblem { m: rows, k, n };
            let out_block = &mut out[row * n..(row + rows) * n];
            gemm_into(Par::Seq, &src[row * k..(row + rows) * k], weights, block, out_block);
            kernels::finalize(out_block, n, &self.attrs, bias, &self.post_ops)?;
            row += rows;
        }
        Ok(())
    }
}

impl Executor for FaerBlockedExecutor {
    fn update(&self, descs: &MemoryDescArgs, memory: &MemoryArgs) -> ExecResult<()> {
        let (Some(src), Some(wei)) = (descs.src.get(SRC_PORT), descs.src.get(WEI_PORT)) else {
            return Err(ExecutorError::InvalidMemory(
                "blocked kernel needs input and weights descriptors".into(),
            ));
        };
        let problem = FcProblem::from_descs(src, wei, self.attrs.weights_non_transposed)?;
        let weights = packed_weights(&self.context, memory, problem, &self.attrs)?;
        debug!(
            "blocked kernel bound to {}x{}x{} in blocks of {BLOCK_ROWS} rows",
            problem.m, problem.k, problem.n
        );
        *self
            .prepared
            .lock()
            .map_err(|_| ExecutorError::execution("blocked executor state poisoned"))? =
            Some(Prepared { problem, weights });
        Ok(())
    }

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()> {
        let (problem, weights) = {
            let prepared = self
                .prepared
                .lock()
                .map_err(|_| ExecutorError::execution("blocked executor state poisoned"))?;
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
        let result = self
            .run_blocks(problem, &src, &weights, bias.as_deref(), &mut out)
            .and_then(|()| kernels::write_f32(arg(memory, ArgId::Dst)?, &out));
        scratch.give(out);
        result
    }

    fn impl_type(&self) -> ImplType {
        ImplType::Blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec::memory::MemoryDesc;

    fn config(src: &[usize], wei: &[usize], wei_type: Precision) -> FcConfig {
        FcConfig::new(
            MemoryDescArgs::new(
                [
                    MemoryDesc::planar(Precision::F32, src),
                    MemoryDesc::planar(wei_type, wei),
                    MemoryDesc::empty(),
                ],
                [MemoryDesc::planar(Precision::F32, &[src[0], wei[0]])],
            ),
            FcAttrs::default(),
            Vec::new(),
        )
    }

    #[test]
    fn shape_heuristic_bounds() {
        let blocked = FaerBlockedFullyConnected;
        assert!(blocked.is_shape_suitable(&config(&[4, 128], &[256, 128], Precision::F32)));
        // single row
        assert!(!blocked.is_shape_suitable(&config(&[1, 128], &[256, 128], Precision::F32)));
        // too few input channels
        assert!(!blocked.is_shape_suitable(&config(&[4, 64], &[256, 64], Precision::F32)));
        // output channels above 4x input channels
        assert!(!blocked.is_shape_suitable(&config(&[4, 96], &[512, 96], Precision::F32)));
        // 32 MiB of weights
        assert!(!blocked.is_shape_suitable(&config(&[4, 4096], &[2048, 4096], Precision::F32)));
        // byte size overflows usize
        let huge = config(&[4, 1 << 20], &[1 << 40, 1 << 20], Precision::F32);
        assert!(!blocked.is_shape_suitable(&huge));
    }

    #[test]
    fn compressed_weights_are_negotiated_to_f32() {
        let config = config(&[4, 128], &[256, 128], Precision::U4);
        let blocked = FaerBlockedFullyConnected;
        assert!(blocked.is_supported(&config));
        let compliance = blocked.is_fully_compliant(&config);
        assert!(!compliance.compliant);
        assert_eq!(compliance.config.descs.src[1].precision(), Precision::F32);
        assert!(blocked.is_fully_compliant(&compliance.config).compliant);
    }

    #[test]
    fn integer_inputs_are_not_supported() {
        let mut config = config(&[4, 128], &[256, 128], Precision::I8);
        config.descs.src[0] = MemoryDesc::planar(Precision::U8, &[4, 128]);
        assert!(!FaerBlockedFullyConnected.is_supported(&config));
    }
}
