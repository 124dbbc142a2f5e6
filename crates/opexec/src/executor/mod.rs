//! Executor selection: candidates, negotiation, caching and fallback adaptation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memory::{MemoryArgs, MemoryDescArgs};

pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod factory;
mod fallback;
pub mod implementation;
pub mod negotiation;
mod printers;

pub use cache::{CacheStats, PrimitiveCache};
pub use catalog::{ImplementationCatalog, ImplementationPtr, ImplementationRegistrar};
pub use config::{Config, OperationAttrs};
pub use context::{
    ContextConfig, Engine, ExecutorContext, ExecutorContextPtr, HostReorder, Reorder, ScratchPad,
};
pub use diagnostics::{Diagnostics, DiagnosticsReport};
pub use error::{ExecResult, ExecutorError};
pub use factory::ExecutorFactory;
pub use implementation::{
    Compliance, ExecutorImplementation, ExecutorKind, OperationKind, ShapeTolerance,
};

/// Concrete kernel variant an executor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImplType {
    Reference,
    GemmParallel,
    GemmSequential,
    Blocked,
}

impl ImplType {
    pub const DEFAULT_PRIORITIES: [ImplType; 4] = [
        ImplType::GemmParallel,
        ImplType::GemmSequential,
        ImplType::Blocked,
        ImplType::Reference,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ImplType::Reference => "ref",
            ImplType::GemmParallel => "gemm_par",
            ImplType::GemmSequential => "gemm_seq",
            ImplType::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ImplType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compiled, bindable execution handle.
///
/// `update` rebinds descriptors and buffers (and may rebuild the underlying primitive);
/// `execute` runs the kernel on the bound operands. Neither may run concurrently with the other
/// on the same handle.
pub trait Executor: Send + Sync {
    fn update(&self, descs: &MemoryDescArgs, memory: &MemoryArgs) -> ExecResult<()>;

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()>;

    fn impl_type(&self) -> ImplType;
}

pub type ExecutorPtr = Arc<dyn Executor>;
