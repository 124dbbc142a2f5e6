use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::{bf16, f16};

use crate::executor::{ExecResult, ExecutorError};
use crate::memory::desc::{MemoryDesc, MemoryDescPtr};
use crate::precision::Precision;

/// Host storage of one operand, typed by precision.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Empty,
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    F16(Vec<f16>),
    I32(Vec<i32>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    /// Two 4-bit elements per byte, low nibble first.
    Packed {
        precision: Precision,
        len: usize,
        bytes: Vec<u8>,
    },
}

impl TensorData {
    pub fn zeros(precision: Precision, len: usize) -> Self {
        match precision {
            Precision::Undefined => TensorData::Empty,
            Precision::F32 => TensorData::F32(vec![0.0; len]),
            Precision::Bf16 => TensorData::Bf16(vec![bf16::ZERO; len]),
            Precision::F16 => TensorData::F16(vec![f16::ZERO; len]),
            Precision::I32 => TensorData::I32(vec![0; len]),
            Precision::I8 => TensorData::I8(vec![0; len]),
            Precision::U8 => TensorData::U8(vec![0; len]),
            Precision::I4 | Precision::U4 | Precision::Nf4 => TensorData::Packed {
                precision,
                len,
                bytes: vec![0; precision.storage_bytes(len)],
            },
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            TensorData::Empty => Precision::Undefined,
            TensorData::F32(_) => Precision::F32,
            TensorData::Bf16(_) => Precision::Bf16,
            TensorData::F16(_) => Precision::F16,
            TensorData::I32(_) => Precision::I32,
            TensorData::I8(_) => Precision::I8,
            TensorData::U8(_) => Precision::U8,
            TensorData::Packed { precision, .. } => *precision,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Empty => 0,
            TensorData::F32(values) => values.len(),
            TensorData::Bf16(values) => values.len(),
            TensorData::F16(values) => values.len(),
            TensorData::I32(values) => values.len(),
            TensorData::I8(values) => values.len(),
            TensorData::U8(values) => values.len(),
            TensorData::Packed { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Operand buffer bound to a descriptor.
///
/// The identifier is unique per allocation and is what constant caches key on.
#[derive(Debug)]
pub struct Memory {
    id: u64,
    desc: MemoryDescPtr,
    data: RwLock<TensorData>,
}

pub type MemoryPtr = Arc<Memory>;

impl Memory {
    /// Allocates zero-initialized storage for a static descriptor.
    pub fn new(desc: MemoryDescPtr) -> ExecResult<MemoryPtr> {
        let len = desc.element_count().ok_or_else(|| {
            ExecutorError::InvalidMemory(format!("cannot allocate dynamic descriptor {desc}"))
        })?;
        let data = TensorData::zeros(desc.precision(), len);
        Ok(Self::wrap(desc, data))
    }

    pub fn from_data(desc: MemoryDescPtr, data: TensorData) -> ExecResult<MemoryPtr> {
        let len = desc.element_count().ok_or_else(|| {
            ExecutorError::InvalidMemory(format!("cannot bind data to dynamic descriptor {desc}"))
        })?;
        if desc.precision() != Precision::Undefined && data.precision() != desc.precision() {
            return Err(ExecutorError::InvalidMemory(format!(
                "data precision {} does not match descriptor {desc}",
                data.precision()
            )));
        }
        if data.len() != len {
            return Err(ExecutorError::InvalidMemory(format!(
                "descriptor {desc} expects {len} elements, got {}",
                data.len()
            )));
        }
        Ok(Self::wrap(desc, data))
    }

    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> ExecResult<MemoryPtr> {
        Self::from_data(
            MemoryDesc::planar(Precision::F32, dims),
            TensorData::F32(values),
        )
    }

    /// Memory for an absent operand.
    pub fn empty() -> MemoryPtr {
        Self::wrap(MemoryDesc::empty(), TensorData::Empty)
    }

    fn wrap(desc: MemoryDescPtr, data: TensorData) -> MemoryPtr {
        Arc::new(Memory {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            desc,
            data: RwLock::new(data),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &MemoryDescPtr {
        &self.desc
    }

    pub fn precision(&self) -> Precision {
        self.desc.precision()
    }

    pub fn read(&self) -> ExecResult<RwLockReadGuard<'_, TensorData>> {
        self.data
            .read()
            .map_err(|_| ExecutorError::Execution(format!("memory {} lock poisoned", self.id)))
    }

    pub fn write(&self) -> ExecResult<RwLockWriteGuard<'_, TensorData>> {
        self.data
            .write()
            .map_err(|_| ExecutorError::Execution(format!("memory {} lock poisoned", self.id)))
    }
}

/// Operand slots of a fully-connected style operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArgId {
    Src,
    Wei,
    Bias,
    Dst,
}

impl ArgId {
    /// Slot bound to input port `port`.
    pub fn src_port(port: usize) -> Option<ArgId> {
        match port {
            0 => Some(ArgId::Src),
            1 => Some(ArgId::Wei),
            2 => Some(ArgId::Bias),
            _ => None,
        }
    }

    /// Slot bound to output port `port`.
    pub fn dst_port(port: usize) -> Option<ArgId> {
        match port {
            0 => Some(ArgId::Dst),
            _ => None,
        }
    }
}

impl fmt::Display for ArgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgId::Src => "src",
            ArgId::Wei => "wei",
            ArgId::Bias => "bias",
            ArgId::Dst => "dst",
        };
        f.write_str(name)
    }
}

pub type MemoryArgs = HashMap<ArgId, MemoryPtr>;

pub fn arg(memory: &MemoryArgs, id: ArgId) -> ExecResult<&MemoryPtr> {
    memory.get(&id).ok_or(ExecutorError::MissingArgument(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_data_validates_len_and_precision() {
        let desc = MemoryDesc::planar(Precision::F32, &[2, 2]);
        assert!(Memory::from_data(desc.clone(), TensorData::F32(vec![0.0; 3])).is_err());
        assert!(Memory::from_data(desc.clone(), TensorData::I8(vec![0; 4])).is_err());
        assert!(Memory::from_data(desc, TensorData::F32(vec![0.0; 4])).is_ok());
    }

    #[test]
    fn zeros_pack_sub_byte_precisions() {
        let data = TensorData::zeros(Precision::I4, 5);
        assert_eq!(data.len(), 5);
        match data {
            TensorData::Packed { bytes, .. } => assert_eq!(bytes.len(), 3),
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn memory_ids_are_unique() {
        let a = Memory::empty();
        let b = Memory::empty();
        assert_ne!(a.id(), b.id());
    }
}
