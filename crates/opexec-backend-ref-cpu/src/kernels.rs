//! Host kernels shared by the fully-connected executors.
//!
//! Everything computes in `f32`: operands are widened on entry and the accumulator is narrowed
//! to the destination precision on exit.

use opexec::executor::{ExecResult, ExecutorError};
use opexec::fullyconnected::FcAttrs;
use opexec::memory::{convert, static_dims_or_error, Memory, MemoryArgs, MemoryDesc};
use opexec::post_ops::{apply_post_ops, apply_scales, PostOp};
use opexec::{ArgId, Precision};

/// GEMM extents of one fully-connected call: `[m, k] x [k, n] -> [m, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FcProblem {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

impl FcProblem {
    /// Leading input axes fold into `m`; weights are `[n, k]`, or `[k, n]` when non-transposed.
    pub fn from_descs(
        src: &MemoryDesc,
        wei: &MemoryDesc,
        weights_non_transposed: bool,
    ) -> ExecResult<Self> {
        let src_dims = static_dims_or_error(src.shape(), || {
            ExecutorError::InvalidMemory(format!("input {src} has dynamic dims"))
        })?;
        let wei_dims = static_dims_or_error(wei.shape(), || {
            ExecutorError::InvalidMemory(format!("weights {wei} have dynamic dims"))
        })?;
        let Some((&k, leading)) = src_dims.split_last() else {
            return Err(ExecutorError::InvalidMemory(format!(
                "input {src} must have at least one dim"
            )));
        };
        if wei_dims.len() != 2 {
            return Err(ExecutorError::InvalidMemory(format!(
                "weights {wei} must be rank 2"
            )));
        }
        let (wei_k, n) = if weights_non_transposed {
            (wei_dims[0], wei_dims[1])
        } else {
            (wei_dims[1], wei_dims[0])
        };
        if wei_k != k {
            return Err(ExecutorError::InvalidMemory(format!(
                "input {src} and weights {wei} disagree on K"
            )));
        }
        Ok(Self {
            m: leading.iter().product(),
            k,
            n,
        })
    }

    pub fn output_len(&self) -> usize {
        self.m * self.n
    }

    pub fn flops(&self) -> u64 {
        2 * (self.m as u64) * (self.k as u64) * (self.n as u64)
    }
}

/// Widens a whole buffer to `f32`.
pub fn read_f32(memory: &Memory) -> ExecResult<Vec<f32>> {
    let data = memory.read()?;
    convert::to_f32(&data)
}

/// Narrows `values` into `memory`'s precision and stores them.
pub fn write_f32(memory: &Memory, values: &[f32]) -> ExecResult<()> {
    let expected = memory.desc().element_count().unwrap_or(0);
    if values.len() != expected {
        return Err(ExecutorError::InvalidMemory(format!(
            "output {} expects {expected} elements, got {}",
            memory.desc(),
            values.len()
        )));
    }
    let narrowed = convert::from_f32(values, memory.precision())?;
    *memory.write()? = narrowed;
    Ok(())
}

/// Bias values when a non-empty bias buffer is bound.
pub fn read_bias(memory: &MemoryArgs) -> ExecResult<Option<Vec<f32>>> {
    match memory.get(&ArgId::Bias) {
        Some(bias) if bias.precision() != Precision::Undefined && !bias.desc().is_empty() => {
            Ok(Some(read_f32(bias)?))
        }
        _ => Ok(None),
    }
}

fn channel_value(values: &[f32], channel: usize) -> f32 {
    if values.len() == 1 {
        values[0]
    } else {
        values[channel]
    }
}

fn check_channels(name: &str, values: &[f32], n: usize) -> ExecResult<()> {
    if values.len() == 1 || values.len() == n {
        Ok(())
    } else {
        Err(ExecutorError::execution(format!(
            "{name} of length {} does not broadcast to {n} output channels",
            values.len()
        )))
    }
}

/// Widens weights and rewrites them as row-major `[n, k]`, applying per-output-channel
/// decompression (`(w - subtract) * multiply`) when the attrs carry it.
pub fn pack_weights(
    weights: &Memory,
    problem: FcProblem,
    attrs: &FcAttrs,
) -> ExecResult<Vec<f32>> {
    let raw = read_f32(weights)?;
    if raw.len() != problem.n * problem.k {
        return Err(ExecutorError::InvalidMemory(format!(
            "weights {} hold {} elements, expected {}",
            weights.desc(),
            raw.len(),
            problem.n * problem.k
        )));
    }
    let mut packed = if attrs.weights_non_transposed {
        let mut out = vec![0.0f32; raw.len()];
        for kk in 0..problem.k {
            for nn in 0..problem.n {
                out[nn * problem.k + kk] = raw[kk * problem.n + nn];
            }
        }
        out
    } else {
        raw
    };

    let subtract = attrs
        .decompression_subtract
        .as_deref()
        .map(read_f32)
        .transpose()?;
    let multiply = attrs
        .decompression_multiply
        .as_deref()
        .map(read_f32)
        .transpose()?;
    if subtract.is_none() && multiply.is_none() {
        return Ok(packed);
    }
    if let Some(values) = &subtract {
        check_channels("decompression subtract", values, problem.n)?;
    }
    if let Some(values) = &multiply {
        check_channels("decompression multiply", values, problem.n)?;
    }
    for (channel, row) in packed.chunks_mut(problem.k.max(1)).enumerate() {
        let zero_point = subtract
            .as_deref()
            .map(|values| channel_value(values, channel))
            .unwrap_or(0.0);
        let scale = multiply
            .as_deref()
            .map(|values| channel_value(values, channel))
            .unwrap_or(1.0);
        for value in row.iter_mut() {
            *value = (*value - zero_point) * scale;
        }
    }
    Ok(packed)
}

/// `out[m, n] = src[m, k] * packed[n, k]^T`.
pub fn matmul_reference(src: &[f32], packed: &[f32], problem: FcProblem, out: &mut [f32]) {
    let FcProblem { m, k, n } = problem;
    for row in 0..m {
        let lhs = &src[row * k..(row + 1) * k];
        for col in 0..n {
            let rhs = &packed[col * k..(col + 1) * k];
            out[row * n + col] = lhs.iter().zip(rhs).map(|(a, b)| a * b).sum();
        }
    }
}

/// Applies dequantization scales, bias and post-ops to a `[m, n]` accumulator, in that order.
pub fn finalize(
    out: &mut [f32],
    n: usize,
    attrs: &FcAttrs,
    bias: Option<&[f32]>,
    post_ops: &[PostOp],
) -> ExecResult<()> {
    apply_scales(attrs.dequantization_scales.as_slice(), out, n)?;
    if let Some(bias) = bias {
        check_channels("bias", bias, n)?;
        for row in out.chunks_mut(n.max(1)) {
            for (channel, value) in row.iter_mut().enumerate() {
                *value += channel_value(bias, channel);
            }
        }
    }
    apply_post_ops(post_ops, out, n)
}
