use std::fmt;

use log::debug;

use super::config::{Config, OperationAttrs};
use super::context::ExecutorContextPtr;
use super::error::ExecResult;
use super::negotiation::{adapt, fully_matches, type_configuration, LayoutConfig, NegotiationRule};
use super::ExecutorPtr;
use crate::memory::MemoryArgs;

/// Backend family an implementation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutorKind {
    Reference,
    Faer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    FullyConnected,
    MatMul,
    Convolution,
}

/// Whether a candidate accepts any concrete shape once its configuration is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeTolerance {
    Agnostic,
    Dependent,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::Reference => f.write_str("reference"),
            ExecutorKind::Faer => f.write_str("faer"),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::FullyConnected => f.write_str("fullyconnected"),
            OperationKind::MatMul => f.write_str("matmul"),
            OperationKind::Convolution => f.write_str("convolution"),
        }
    }
}

/// Answer of a compliance check: either the request is accepted as is, or `config` is the
/// adjusted request the implementation would accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compliance<A> {
    pub compliant: bool,
    pub config: Config<A>,
}

impl<A: OperationAttrs> Compliance<A> {
    pub fn accepted(config: &Config<A>) -> Self {
        Self {
            compliant: true,
            config: config.clone(),
        }
    }

    pub fn adjusted(config: Config<A>) -> Self {
        Self {
            compliant: false,
            config,
        }
    }

    /// Runs type and layout negotiation for `config` against `rules`.
    pub fn negotiate(config: &Config<A>, rules: &[NegotiationRule], layouts: &LayoutConfig) -> Self {
        let types = type_configuration(rules, &config.descs);
        if fully_matches(&config.descs, &types, layouts) {
            return Self::accepted(config);
        }
        debug!("negotiated types {types:?} differ from the request");
        Self::adjusted(config.with_descs(adapt(&config.descs, &types, layouts)))
    }
}

/// One candidate in an [`ImplementationCatalog`](super::ImplementationCatalog).
///
/// Implementations are stateless descriptions; [`instantiate`](Self::instantiate) builds the
/// executor that owns per-instance state.
pub trait ExecutorImplementation<A: OperationAttrs>: Send + Sync {
    fn name(&self) -> &'static str;

    fn executor_kind(&self) -> ExecutorKind;

    fn operation_kind(&self) -> OperationKind;

    fn shape_tolerance(&self) -> ShapeTolerance;

    /// Cheap predicate on attrs and precisions; never fails.
    fn is_supported(&self, config: &Config<A>) -> bool;

    fn is_fully_compliant(&self, config: &Config<A>) -> Compliance<A>;

    /// Only consulted for shape-dependent implementations, with concrete shapes.
    fn is_shape_suitable(&self, _config: &Config<A>) -> bool {
        true
    }

    fn instantiate(
        &self,
        config: &Config<A>,
        memory: &MemoryArgs,
        context: &ExecutorContextPtr,
    ) -> ExecResult<ExecutorPtr>;

    fn is_shape_agnostic(&self) -> bool {
        self.shape_tolerance() == ShapeTolerance::Agnostic
    }
}
