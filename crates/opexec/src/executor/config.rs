use std::fmt;
use std::hash::Hash;

use crate::memory::{MemoryDescArgs, MemoryDescPtr};
use crate::post_ops::PostOps;
use crate::precision::Precision;

/// Static parameters of one operation kind.
pub trait OperationAttrs:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Operation name used in diagnostics.
    const OPERATION: &'static str;

    /// Bit `i` set means input port `i` holds data that never changes between calls.
    fn constant_input_mask(&self) -> u32 {
        0
    }
}

/// Full description of one operation request. Adaptation builds a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Config<A> {
    pub descs: MemoryDescArgs,
    pub attrs: A,
    pub post_ops: PostOps,
}

impl<A: OperationAttrs> Config<A> {
    pub fn new(descs: MemoryDescArgs, attrs: A, post_ops: PostOps) -> Self {
        Self {
            descs,
            attrs,
            post_ops,
        }
    }

    /// Same attrs and post-ops over a different descriptor set.
    pub fn with_descs(&self, descs: MemoryDescArgs) -> Self {
        Self {
            descs,
            attrs: self.attrs.clone(),
            post_ops: self.post_ops.clone(),
        }
    }

    pub fn src(&self, port: usize) -> Option<&MemoryDescPtr> {
        self.descs.src.get(port)
    }

    pub fn dst(&self, port: usize) -> Option<&MemoryDescPtr> {
        self.descs.dst.get(port)
    }

    pub fn src_precision(&self, port: usize) -> Precision {
        self.src(port)
            .map(|desc| desc.precision())
            .unwrap_or(Precision::Undefined)
    }

    pub fn dst_precision(&self, port: usize) -> Precision {
        self.dst(port)
            .map(|desc| desc.precision())
            .unwrap_or(Precision::Undefined)
    }
}
