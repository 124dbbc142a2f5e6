//! Table-driven precision and layout negotiation.
//!
//! A [`TypeMapping`] is an ordered list of [`NegotiationRule`]s. Ports are numbered inputs first,
//! then outputs. The first rule whose masks admit every observed precision decides the target
//! precision of each port through its [`PortsTranslation`].

use log::debug;
use smallvec::SmallVec;

use crate::memory::{Layout, MemoryDesc, MemoryDescArgs, MemoryDescPtr};
use crate::precision::{Precision, TypeMask};

/// Precision every port falls back to when no rule matches.
pub const DEFAULT_PRECISION: Precision = Precision::F32;

/// How one port's target precision is derived from the observed precisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// Keep the precision observed on this port.
    Bypass,
    /// Take the precision observed on input port `i`.
    Input(usize),
    /// Take the requested output precision.
    Output,
    /// Force a constant precision.
    Just(Precision),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortsTranslation {
    PerPort(SmallVec<[PortPolicy; 4]>),
    Everyone(PortPolicy),
}

impl PortsTranslation {
    /// Policy for `port`; ports past the declared list keep their value.
    pub fn policy(&self, port: usize) -> PortPolicy {
        match self {
            PortsTranslation::PerPort(policies) => {
                policies.get(port).copied().unwrap_or(PortPolicy::Bypass)
            }
            PortsTranslation::Everyone(policy) => *policy,
        }
    }
}

pub fn pt(policies: impl IntoIterator<Item = PortPolicy>) -> PortsTranslation {
    PortsTranslation::PerPort(policies.into_iter().collect())
}

pub fn everyone(policy: PortPolicy) -> PortsTranslation {
    PortsTranslation::Everyone(policy)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationRule {
    masks: SmallVec<[TypeMask; 4]>,
    translation: PortsTranslation,
}

impl NegotiationRule {
    pub fn new(masks: impl IntoIterator<Item = TypeMask>, translation: PortsTranslation) -> Self {
        Self {
            masks: masks.into_iter().collect(),
            translation,
        }
    }

    /// Every observed precision must be admitted by the mask at the same port. `Undefined`
    /// is admitted by any mask; observations beyond the declared masks never match.
    pub fn matches(&self, observed: &[Precision]) -> bool {
        observed.len() <= self.masks.len()
            && observed
                .iter()
                .zip(&self.masks)
                .all(|(precision, mask)| mask.matches(*precision))
    }

    pub fn translation(&self) -> &PortsTranslation {
        &self.translation
    }
}

pub type TypeMapping = Vec<NegotiationRule>;

/// Target precisions per port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InOutTypes {
    pub inputs: SmallVec<[Precision; 4]>,
    pub outputs: SmallVec<[Precision; 1]>,
}

impl InOutTypes {
    fn uniform(inputs: usize, outputs: usize, precision: Precision) -> Self {
        Self {
            inputs: std::iter::repeat(precision).take(inputs).collect(),
            outputs: std::iter::repeat(precision).take(outputs).collect(),
        }
    }

    pub fn input(&self, port: usize) -> Precision {
        self.inputs.get(port).copied().unwrap_or(DEFAULT_PRECISION)
    }

    pub fn output(&self, port: usize) -> Precision {
        self.outputs.get(port).copied().unwrap_or(DEFAULT_PRECISION)
    }
}

/// Required layout per port, numbered like [`InOutTypes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutConfig {
    layouts: SmallVec<[Layout; 4]>,
    fallback: Layout,
}

impl LayoutConfig {
    pub fn all(layout: Layout) -> Self {
        Self {
            layouts: SmallVec::new(),
            fallback: layout,
        }
    }

    pub fn per_port(layouts: impl IntoIterator<Item = Layout>, fallback: Layout) -> Self {
        Self {
            layouts: layouts.into_iter().collect(),
            fallback,
        }
    }

    pub fn layout(&self, port: usize) -> Layout {
        self.layouts.get(port).copied().unwrap_or(self.fallback)
    }
}

fn apply_policy(
    policy: PortPolicy,
    own: Precision,
    inputs: &[Precision],
    outputs: &[Precision],
) -> Precision {
    match policy {
        PortPolicy::Bypass => own,
        PortPolicy::Input(idx) => inputs.get(idx).copied().unwrap_or(DEFAULT_PRECISION),
        PortPolicy::Output => outputs.first().copied().unwrap_or(DEFAULT_PRECISION),
        PortPolicy::Just(precision) => precision,
    }
}

/// Resolves target precisions for the observed ones. The first matching rule wins; when none
/// matches every port is forced to [`DEFAULT_PRECISION`].
pub fn resolve(rules: &[NegotiationRule], inputs: &[Precision], outputs: &[Precision]) -> InOutTypes {
    let observed: SmallVec<[Precision; 5]> = inputs.iter().chain(outputs).copied().collect();
    let Some(rule) = rules.iter().find(|rule| rule.matches(&observed)) else {
        debug!(
            "no negotiation rule matched {:?} -> {:?}; using {}",
            inputs, outputs, DEFAULT_PRECISION
        );
        return InOutTypes::uniform(inputs.len(), outputs.len(), DEFAULT_PRECISION);
    };

    let translation = rule.translation();
    let resolved_inputs = inputs
        .iter()
        .enumerate()
        .map(|(port, own)| apply_policy(translation.policy(port), *own, inputs, outputs))
        .collect();
    let resolved_outputs = outputs
        .iter()
        .enumerate()
        .map(|(idx, own)| {
            apply_policy(translation.policy(inputs.len() + idx), *own, inputs, outputs)
        })
        .collect();
    InOutTypes {
        inputs: resolved_inputs,
        outputs: resolved_outputs,
    }
}

/// Reads the observed precisions from `descs` and resolves them.
pub fn type_configuration(rules: &[NegotiationRule], descs: &MemoryDescArgs) -> InOutTypes {
    let inputs: SmallVec<[Precision; 4]> = descs.src.iter().map(|d| d.precision()).collect();
    let outputs: SmallVec<[Precision; 1]> = descs.dst.iter().map(|d| d.precision()).collect();
    resolve(rules, &inputs, &outputs)
}

fn port_matches(desc: &MemoryDesc, precision: Precision, layout: Layout) -> bool {
    let precision_ok = desc.precision() == Precision::Undefined || desc.precision() == precision;
    precision_ok && desc.has_layout(layout)
}

/// True when every descriptor already carries its resolved precision (or the wildcard) and the
/// required layout.
pub fn fully_matches(descs: &MemoryDescArgs, resolved: &InOutTypes, layouts: &LayoutConfig) -> bool {
    let inputs_ok = descs
        .src
        .iter()
        .enumerate()
        .all(|(port, desc)| port_matches(desc, resolved.input(port), layouts.layout(port)));
    let offset = descs.src.len();
    let outputs_ok = descs.dst.iter().enumerate().all(|(idx, desc)| {
        port_matches(desc, resolved.output(idx), layouts.layout(offset + idx))
    });
    inputs_ok && outputs_ok
}

fn adapt_port(desc: &MemoryDescPtr, precision: Precision, layout: Layout) -> MemoryDescPtr {
    if port_matches(desc, precision, layout) {
        return desc.clone();
    }
    // An absent operand keeps its wildcard precision.
    let target = if desc.precision() == Precision::Undefined {
        Precision::Undefined
    } else {
        precision
    };
    MemoryDescPtr::new(desc.clone_with(target, layout))
}

/// Builds the descriptor set the negotiated configuration requires. Matching descriptors are
/// shared, mismatching ones are rebuilt with the resolved precision and layout.
pub fn adapt(descs: &MemoryDescArgs, resolved: &InOutTypes, layouts: &LayoutConfig) -> MemoryDescArgs {
    let offset = descs.src.len();
    MemoryDescArgs {
        src: descs
            .src
            .iter()
            .enumerate()
            .map(|(port, desc)| adapt_port(desc, resolved.input(port), layouts.layout(port)))
            .collect(),
        dst: descs
            .dst
            .iter()
            .enumerate()
            .map(|(idx, desc)| {
                adapt_port(desc, resolved.output(idx), layouts.layout(offset + idx))
            })
            .collect(),
    }
}
