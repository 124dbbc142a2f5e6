//! Compiled GEMM primitives shared through the context primitive cache.

use std::sync::Arc;

use faer::Par;
use log::debug;
use opexec::executor::{ExecResult, ExecutorContext, ExecutorError, ImplType};
use opexec::fullyconnected::{BIAS_PORT, SRC_PORT, WEI_PORT};
use opexec::memory::{MemoryDesc, MemoryDescArgs};
use opexec_backend_ref_cpu::FcProblem;

use crate::{faer_parallelism, gemm_into};

/// Everything a GEMM primitive depends on. Value-equal keys share one primitive.
///
/// The variant is resolved against the requesting context before lookup, so contexts with
/// different priorities or thread counts sharing one cache never receive each other's variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FaerGemmKey {
    pub src: MemoryDesc,
    pub wei: MemoryDesc,
    pub bias: MemoryDesc,
    pub dst: MemoryDesc,
    pub weights_non_transposed: bool,
    pub impl_type: ImplType,
}

/// First GEMM variant in the context's priority list the engine can run.
pub fn gemm_variant(context: &ExecutorContext) -> ExecResult<ImplType> {
    let threads = context.engine().threads();
    context
        .impl_priorities()
        .iter()
        .copied()
        .find(|candidate| match candidate {
            ImplType::GemmParallel => threads > 1,
            ImplType::GemmSequential => true,
            ImplType::Reference | ImplType::Blocked => false,
        })
        .ok_or_else(|| {
            ExecutorError::execution(format!(
                "no gemm variant among priorities {:?}",
                context.impl_priorities()
            ))
        })
}

impl FaerGemmKey {
    pub fn new(
        descs: &MemoryDescArgs,
        weights_non_transposed: bool,
        context: &ExecutorContext,
    ) -> ExecResult<Self> {
        let input = |port: usize| {
            descs.src.get(port).map(|desc| MemoryDesc::clone(desc)).ok_or_else(|| {
                ExecutorError::InvalidMemory(format!("missing input descriptor {port}"))
            })
        };
        let dst = descs
            .dst
            .first()
            .map(|desc| MemoryDesc::clone(desc))
            .ok_or_else(|| ExecutorError::InvalidMemory("missing output descriptor".into()))?;
        Ok(Self {
            src: input(SRC_PORT)?,
            wei: input(WEI_PORT)?,
            bias: descs
                .src
                .get(BIAS_PORT)
                .map(|desc| MemoryDesc::clone(desc))
                .unwrap_or_else(|| MemoryDesc::clone(&MemoryDesc::empty())),
            dst,
            weights_non_transposed,
            impl_type: gemm_variant(context)?,
        })
    }
}

#[derive(Debug)]
pub struct FaerGemmPrimitive {
    problem: FcProblem,
    impl_type: ImplType,
}

impl FaerGemmPrimitive {
    pub fn create(key: &FaerGemmKey) -> ExecResult<Self> {
        let problem = FcProblem::from_descs(&key.src, &key.wei, key.weights_non_transposed)?;
        let impl_type = key.impl_type;
        debug!(
            "gemm primitive {}x{}x{} uses {impl_type}",
            problem.m, problem.k, problem.n
        );
        Ok(Self { problem, impl_type })
    }

    /// Returns the primitive cached under `key`, creating it on first request.
    pub fn get_or_create(key: FaerGemmKey, context: &ExecutorContext) -> ExecResult<Arc<Self>> {
        let (primitive, created) = context
            .primitive_cache()
            .get_or_create(key.clone(), || Self::create(&key))?;
        context.diagnostics().cache_event("primitives", !created);
        Ok(primitive)
    }

    pub fn problem(&self) -> FcProblem {
        self.problem
    }

    pub fn impl_type(&self) -> ImplType {
        self.impl_type
    }

    fn parallelism(&self) -> Par {
        match self.impl_type {
            ImplType::GemmParallel => faer_parallelism(),
            _ => Par::Seq,
        }
    }

    pub fn execute(&self, src: &[f32], packed: &[f32], out: &mut [f32]) -> ExecResult<()> {
        let FcProblem { m, k, n } = self.problem;
        if src.len() != m * k || packed.len() != n * k || out.len() != m * n {
            return Err(ExecutorError::execution(format!(
                "gemm {m}x{k}x{n} operand size mismatch"
            )));
        }
        gemm_into(self.parallelism(), src, packed, self.problem, out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec::executor::PrimitiveCache;
    use opexec::{ContextConfig, Precision};

    fn descs() -> MemoryDescArgs {
        MemoryDescArgs::new(
            [
                MemoryDesc::planar(Precision::F32, &[2, 8]),
                MemoryDesc::planar(Precision::F32, &[4, 8]),
            ],
            [MemoryDesc::planar(Precision::F32, &[2, 4])],
        )
    }

    fn key(context: &ExecutorContext) -> FaerGemmKey {
        FaerGemmKey::new(&descs(), false, context).expect("key")
    }

    #[test]
    fn equal_descriptors_share_a_primitive() {
        let context = ExecutorContext::default();
        let first = FaerGemmPrimitive::get_or_create(key(&context), &context).expect("first");
        let second = FaerGemmPrimitive::get_or_create(key(&context), &context).expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(context.primitive_cache().stats().misses, 1);
    }

    #[test]
    fn variant_follows_priorities_and_threads() {
        let parallel = ExecutorContext::new(ContextConfig::default().with_threads(4));
        assert_eq!(gemm_variant(&parallel).expect("par"), ImplType::GemmParallel);
        let single = ExecutorContext::new(ContextConfig::default().with_threads(1));
        assert_eq!(gemm_variant(&single).expect("seq"), ImplType::GemmSequential);
        let reference_only = ExecutorContext::new(
            ContextConfig::default().with_impl_priorities(vec![ImplType::Reference]),
        );
        assert!(FaerGemmKey::new(&descs(), false, &reference_only).is_err());
    }

    #[test]
    fn contexts_sharing_a_cache_keep_their_own_variant() {
        let cache = Arc::new(PrimitiveCache::new());
        let parallel = ExecutorContext::new(ContextConfig::default().with_threads(8))
            .with_primitive_cache(cache.clone());
        let sequential = ExecutorContext::new(
            ContextConfig::default()
                .with_threads(8)
                .with_impl_priorities(vec![ImplType::GemmSequential]),
        )
        .with_primitive_cache(cache.clone());

        let first = FaerGemmPrimitive::get_or_create(key(&parallel), &parallel).expect("par");
        let second =
            FaerGemmPrimitive::get_or_create(key(&sequential), &sequential).expect("seq");
        assert_eq!(first.impl_type(), ImplType::GemmParallel);
        assert_eq!(second.impl_type(), ImplType::GemmSequential);
        assert_eq!(cache.stats().misses, 2);
    }
}
