//! Precision and layout conversion between host buffers.
//!
//! Every conversion goes through `f32`: integer targets round to nearest and saturate, 4-bit
//! targets are packed two per byte (low nibble first) and `nf4` snaps to the nearest
//! code-book entry.

use half::{bf16, f16};

use crate::executor::{ExecResult, ExecutorError};
use crate::memory::buffer::TensorData;
use crate::memory::desc::{Layout, MemoryDesc};
use crate::precision::Precision;

/// Normal-float 4-bit code book.
pub const NF4_TABLE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_03,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

fn nibble(bytes: &[u8], index: usize) -> u8 {
    let byte = bytes[index / 2];
    if index % 2 == 0 {
        byte & 0x0f
    } else {
        byte >> 4
    }
}

fn decode_nibble(precision: Precision, code: u8) -> f32 {
    match precision {
        Precision::U4 => f32::from(code),
        // Sign-extend from bit 3.
        Precision::I4 => f32::from(((code << 4) as i8) >> 4),
        _ => NF4_TABLE[usize::from(code & 0x0f)],
    }
}

fn encode_nibble(precision: Precision, value: f32) -> u8 {
    match precision {
        Precision::U4 => value.round().clamp(0.0, 15.0) as u8,
        Precision::I4 => (value.round().clamp(-8.0, 7.0) as i8 as u8) & 0x0f,
        _ => {
            let mut best = 0usize;
            let mut best_distance = f32::INFINITY;
            for (idx, entry) in NF4_TABLE.iter().enumerate() {
                let distance = (entry - value).abs();
                if distance < best_distance {
                    best = idx;
                    best_distance = distance;
                }
            }
            best as u8
        }
    }
}

/// Widens any buffer to `f32`.
pub fn to_f32(data: &TensorData) -> ExecResult<Vec<f32>> {
    let values = match data {
        TensorData::Empty => Vec::new(),
        TensorData::F32(values) => values.clone(),
        TensorData::Bf16(values) => values.iter().map(|value| value.to_f32()).collect(),
        TensorData::F16(values) => values.iter().map(|value| value.to_f32()).collect(),
        TensorData::I32(values) => values.iter().map(|value| *value as f32).collect(),
        TensorData::I8(values) => values.iter().map(|value| f32::from(*value)).collect(),
        TensorData::U8(values) => values.iter().map(|value| f32::from(*value)).collect(),
        TensorData::Packed {
            precision,
            len,
            bytes,
        } => {
            if bytes.len() < precision.storage_bytes(*len) {
                return Err(ExecutorError::InvalidMemory(format!(
                    "packed {precision} buffer holds {} bytes for {len} elements",
                    bytes.len()
                )));
            }
            (0..*len)
                .map(|idx| decode_nibble(*precision, nibble(bytes, idx)))
                .collect()
        }
    };
    Ok(values)
}

/// Narrows `f32` values into `precision`.
pub fn from_f32(values: &[f32], precision: Precision) -> ExecResult<TensorData> {
    let data = match precision {
        Precision::Undefined => {
            return Err(ExecutorError::UnsupportedConversion {
                from: Precision::F32.to_string(),
                to: precision.to_string(),
            })
        }
        Precision::F32 => TensorData::F32(values.to_vec()),
        Precision::Bf16 => TensorData::Bf16(values.iter().copied().map(bf16::from_f32).collect()),
        Precision::F16 => TensorData::F16(values.iter().copied().map(f16::from_f32).collect()),
        Precision::I32 => TensorData::I32(values.iter().map(|v| v.round() as i32).collect()),
        Precision::I8 => TensorData::I8(values.iter().map(|v| v.round() as i8).collect()),
        Precision::U8 => TensorData::U8(values.iter().map(|v| v.round() as u8).collect()),
        Precision::I4 | Precision::U4 | Precision::Nf4 => {
            let mut bytes = vec![0u8; precision.storage_bytes(values.len())];
            for (idx, value) in values.iter().enumerate() {
                let code = encode_nibble(precision, *value);
                if idx % 2 == 0 {
                    bytes[idx / 2] |= code;
                } else {
                    bytes[idx / 2] |= code << 4;
                }
            }
            TensorData::Packed {
                precision,
                len: values.len(),
                bytes,
            }
        }
    };
    Ok(data)
}

/// Converts `data` to `precision`; identical precisions are copied.
pub fn convert(data: &TensorData, precision: Precision) -> ExecResult<TensorData> {
    if data.precision() == precision {
        return Ok(data.clone());
    }
    if matches!(data, TensorData::Empty) {
        return Ok(TensorData::Empty);
    }
    from_f32(&to_f32(data)?, precision)
}

/// Moves the channel axis (dim 1) between planar and channels-last arrangements.
pub fn permute_layout(
    values: &[f32],
    dims: &[usize],
    from: Layout,
    to: Layout,
) -> ExecResult<Vec<f32>> {
    if from == to || dims.len() < 3 {
        return Ok(values.to_vec());
    }
    let unsupported = || ExecutorError::UnsupportedConversion {
        from: from.to_string(),
        to: to.to_string(),
    };
    if matches!(from, Layout::Blocked16) || matches!(to, Layout::Blocked16) {
        return Err(unsupported());
    }
    let batch = dims[0];
    let channels = dims[1];
    let spatial: usize = dims[2..].iter().product();
    if values.len() != batch * channels * spatial {
        return Err(ExecutorError::InvalidMemory(format!(
            "layout permutation expects {} elements, got {}",
            batch * channels * spatial,
            values.len()
        )));
    }
    let mut out = vec![0.0f32; values.len()];
    for n in 0..batch {
        for c in 0..channels {
            for s in 0..spatial {
                let planar = (n * channels + c) * spatial + s;
                let channels_last = (n * spatial + s) * channels + c;
                if from == Layout::Ncsp {
                    out[channels_last] = values[planar];
                } else {
                    out[planar] = values[channels_last];
                }
            }
        }
    }
    Ok(out)
}

/// Produces a buffer matching `dst` from data described by `src`.
pub fn reorder(src: &MemoryDesc, data: &TensorData, dst: &MemoryDesc) -> ExecResult<TensorData> {
    if src.layout() == dst.layout() {
        return convert(data, dst.precision());
    }
    let dims = src.shape().static_dims().ok_or_else(|| {
        ExecutorError::InvalidMemory(format!("cannot reorder dynamic descriptor {src}"))
    })?;
    let values = to_f32(data)?;
    let permuted = permute_layout(&values, &dims, src.layout(), dst.layout())?;
    from_f32(&permuted, dst.precision())
}
