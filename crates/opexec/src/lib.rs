pub use linkme;

mod env;
pub mod executor;
pub mod fullyconnected;
pub mod memory;
pub mod post_ops;
pub mod precision;

pub use executor::{
    Config, ContextConfig, Executor, ExecutorContext, ExecutorContextPtr, ExecutorError,
    ExecutorFactory, ExecutorPtr, ExecResult, ImplType,
};
pub use fullyconnected::{FcAttrs, FcConfig};
pub use memory::{ArgId, Layout, Memory, MemoryArgs, MemoryDesc, MemoryDescArgs, MemoryPtr};
pub use precision::{Precision, TypeMask};
