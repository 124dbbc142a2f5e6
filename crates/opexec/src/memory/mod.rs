//! Operand descriptors, host buffers and conversions between them.

pub mod buffer;
pub mod convert;
pub mod desc;

pub use buffer::{arg, ArgId, Memory, MemoryArgs, MemoryPtr, TensorData};
pub use desc::{
    checked_element_count_or_error, static_dims_or_error, Dimension, Layout, MemoryDesc,
    MemoryDescArgs, MemoryDescPtr, Shape,
};
