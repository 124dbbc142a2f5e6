use std::fmt;
use std::hash::{Hash, Hasher};

use crate::executor::{ExecResult, ExecutorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Relu,
    Gelu,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn apply(self, value: f32) -> f32 {
        match self {
            Activation::Relu => value.max(0.0),
            Activation::Gelu => {
                // tanh approximation
                let inner = 0.797_884_6 * (value + 0.044_715 * value * value * value);
                0.5 * value * (1.0 + inner.tanh())
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
            Activation::Tanh => value.tanh(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        }
    }
}

/// `f32` values compared and hashed by bit pattern so they can participate in cache keys.
#[derive(Debug, Clone, Default)]
pub struct FloatVec(pub Vec<f32>);

impl FloatVec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for FloatVec {
    fn from(values: Vec<f32>) -> Self {
        FloatVec(values)
    }
}

impl PartialEq for FloatVec {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for FloatVec {}

impl Hash for FloatVec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            value.to_bits().hash(state);
        }
    }
}

/// Operation fused after the main computation, applied to the `f32` accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PostOp {
    Activation(Activation),
    /// Per-output-channel (or single broadcast) multiplier.
    Scale(FloatVec),
}

pub type PostOps = Vec<PostOp>;

/// Applies `ops` in order to a row-major `[rows, channels]` accumulator.
pub fn apply_post_ops(ops: &[PostOp], values: &mut [f32], channels: usize) -> ExecResult<()> {
    for op in ops {
        match op {
            PostOp::Activation(activation) => {
                for value in values.iter_mut() {
                    *value = activation.apply(*value);
                }
            }
            PostOp::Scale(scales) => apply_scales(scales.as_slice(), values, channels)?,
        }
    }
    Ok(())
}

/// Multiplies by a broadcast scalar or by one scale per output channel.
pub fn apply_scales(scales: &[f32], values: &mut [f32], channels: usize) -> ExecResult<()> {
    match scales.len() {
        0 => Ok(()),
        1 => {
            let scale = scales[0];
            values.iter_mut().for_each(|value| *value *= scale);
            Ok(())
        }
        len if len == channels && channels > 0 => {
            for row in values.chunks_mut(channels) {
                for (value, scale) in row.iter_mut().zip(scales) {
                    *value *= scale;
                }
            }
            Ok(())
        }
        len => Err(ExecutorError::execution(format!(
            "scale vector of length {len} does not broadcast to {channels} channels"
        ))),
    }
}

impl fmt::Display for PostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostOp::Activation(activation) => f.write_str(activation.name()),
            PostOp::Scale(scales) => write!(f, "scale[{}]", scales.len()),
        }
    }
}
