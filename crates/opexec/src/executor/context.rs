use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::cache::PrimitiveCache;
use super::diagnostics::Diagnostics;
use super::error::ExecResult;
use super::ImplType;
use crate::env;
use crate::memory::{convert, Memory, MemoryDesc, MemoryDescPtr, MemoryPtr, TensorData};

/// Compute resources available to kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engine {
    threads: usize,
}

impl Engine {
    pub fn host() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self { threads }
    }

    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Host-side knobs of an [`ExecutorContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub collect_counters: bool,
    /// Restricts selection to the implementation with this exact name.
    pub implementation_filter: Option<String>,
    /// Kernel variants in order of preference.
    pub impl_priorities: Vec<ImplType>,
    /// Minimum share of zero weights before sparse weights are used; `1.0` disables them.
    pub sparse_weights_rate: f32,
    /// Worker threads; `0` means one per available core.
    pub threads: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            collect_counters: false,
            implementation_filter: None,
            impl_priorities: ImplType::DEFAULT_PRIORITIES.to_vec(),
            sparse_weights_rate: 1.0,
            threads: 0,
        }
    }
}

impl ContextConfig {
    pub fn from_env() -> Self {
        Self {
            collect_counters: env::collect_counters(),
            implementation_filter: env::implementation_filter(),
            sparse_weights_rate: env::fc_sparse_rate(),
            ..Self::default()
        }
    }

    pub fn with_counters(mut self, enabled: bool) -> Self {
        self.collect_counters = enabled;
        self
    }

    pub fn with_implementation_filter(mut self, name: impl Into<String>) -> Self {
        self.implementation_filter = Some(name.into());
        self
    }

    pub fn with_impl_priorities(mut self, priorities: impl Into<Vec<ImplType>>) -> Self {
        self.impl_priorities = priorities.into();
        self
    }

    pub fn with_sparse_weights_rate(mut self, rate: f32) -> Self {
        self.sparse_weights_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Pool of reusable `f32` work buffers.
#[derive(Default)]
pub struct ScratchPad {
    buffers: Mutex<Vec<Vec<f32>>>,
}

impl ScratchPad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a zeroed buffer of `len` elements, reusing a returned one when possible.
    pub fn take(&self, len: usize) -> Vec<f32> {
        let reused = self.buffers.lock().ok().and_then(|mut buffers| {
            let idx = buffers.iter().position(|buf| buf.capacity() >= len)?;
            Some(buffers.swap_remove(idx))
        });
        let mut buffer = reused.unwrap_or_default();
        buffer.clear();
        buffer.resize(len, 0.0);
        buffer
    }

    pub fn give(&self, buffer: Vec<f32>) {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().map(|buffers| buffers.len()).unwrap_or(0)
    }
}

/// Precision and layout conversion collaborator.
pub trait Reorder: Send + Sync {
    fn reorder(&self, src: &MemoryDesc, data: &TensorData, dst: &MemoryDesc)
        -> ExecResult<TensorData>;
}

/// Converts on the host through `f32`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostReorder;

impl Reorder for HostReorder {
    fn reorder(
        &self,
        src: &MemoryDesc,
        data: &TensorData,
        dst: &MemoryDesc,
    ) -> ExecResult<TensorData> {
        convert::reorder(src, data, dst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConstantKey {
    memory_id: u64,
    desc: MemoryDesc,
}

/// Shared services for every executor built against it.
pub struct ExecutorContext {
    config: ContextConfig,
    engine: Engine,
    primitive_cache: Arc<PrimitiveCache>,
    weight_cache: Arc<PrimitiveCache>,
    scratch_pad: Arc<ScratchPad>,
    reorder: Arc<dyn Reorder>,
    diagnostics: Arc<Diagnostics>,
}

pub type ExecutorContextPtr = Arc<ExecutorContext>;

impl ExecutorContext {
    pub fn new(config: ContextConfig) -> Self {
        let engine = if config.threads == 0 {
            Engine::host()
        } else {
            Engine::with_threads(config.threads)
        };
        let diagnostics = Arc::new(Diagnostics::new(config.collect_counters));
        Self {
            config,
            engine,
            primitive_cache: Arc::new(PrimitiveCache::new()),
            weight_cache: Arc::new(PrimitiveCache::new()),
            scratch_pad: Arc::new(ScratchPad::new()),
            reorder: Arc::new(HostReorder),
            diagnostics,
        }
    }

    pub fn from_env() -> Self {
        Self::new(ContextConfig::from_env())
    }

    pub fn with_reorder(mut self, reorder: Arc<dyn Reorder>) -> Self {
        self.reorder = reorder;
        self
    }

    /// Shares an existing primitive cache, e.g. between contexts of one compiled model.
    pub fn with_primitive_cache(mut self, cache: Arc<PrimitiveCache>) -> Self {
        self.primitive_cache = cache;
        self
    }

    pub fn into_shared(self) -> ExecutorContextPtr {
        Arc::new(self)
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn impl_priorities(&self) -> &[ImplType] {
        &self.config.impl_priorities
    }

    pub fn primitive_cache(&self) -> &Arc<PrimitiveCache> {
        &self.primitive_cache
    }

    pub fn weight_cache(&self) -> &Arc<PrimitiveCache> {
        &self.weight_cache
    }

    pub fn scratch_pad(&self) -> &Arc<ScratchPad> {
        &self.scratch_pad
    }

    pub fn reorder(&self) -> &Arc<dyn Reorder> {
        &self.reorder
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Converts the contents of `memory` to `desc` once per (memory, desc) pair and shares
    /// the converted buffer.
    pub fn constant(&self, memory: &Memory, desc: &MemoryDescPtr) -> ExecResult<MemoryPtr> {
        let key = ConstantKey {
            memory_id: memory.id(),
            desc: MemoryDesc::clone(desc),
        };
        let (converted, created) = self.weight_cache.get_or_create(key, || {
            let source = memory.read()?;
            let data = self.reorder.reorder(memory.desc(), &source, desc)?;
            Memory::from_data(desc.clone(), data)
        })?;
        self.diagnostics.cache_event("weights", !created);
        Ok((*converted).clone())
    }
}

impl Default for ExecutorContext {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
