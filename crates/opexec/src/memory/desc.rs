use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::precision::Precision;

/// Single axis extent. `Dynamic` extents are resolved per shape epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[Dimension; 4]>,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = Dimension>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static))
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn is_static(&self) -> bool {
        self.dims
            .iter()
            .all(|dim| matches!(dim, Dimension::Static(_)))
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        static_dims_or_error(self, || ()).ok()
    }

    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        checked_element_count_or_error(&dims, || ()).ok()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            match dim {
                Dimension::Static(value) => write!(f, "{value}")?,
                Dimension::Dynamic => f.write_str("?")?,
            }
        }
        f.write_str("]")
    }
}

/// Returns static dimensions or maps the first dynamic dimension to a caller-defined error.
pub fn static_dims_or_error<E, F>(shape: &Shape, mut on_dynamic: F) -> Result<Vec<usize>, E>
where
    F: FnMut() -> E,
{
    let mut dims = Vec::with_capacity(shape.rank());
    for dim in shape.dims() {
        match dim {
            Dimension::Static(value) => dims.push(*value),
            Dimension::Dynamic => return Err(on_dynamic()),
        }
    }
    Ok(dims)
}

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Physical arrangement tag of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Planar, channels-first, dense row-major.
    Ncsp,
    /// Channels-last.
    Nspc,
    /// Channel blocks of 16.
    Blocked16,
}

impl Layout {
    pub fn name(self) -> &'static str {
        match self {
            Layout::Ncsp => "ncsp",
            Layout::Nspc => "nspc",
            Layout::Blocked16 => "blocked16",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one tensor operand. Immutable once built; share it as [`MemoryDescPtr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    precision: Precision,
    shape: Shape,
    layout: Layout,
    offset: usize,
}

pub type MemoryDescPtr = Arc<MemoryDesc>;

impl MemoryDesc {
    pub fn new(precision: Precision, shape: Shape, layout: Layout) -> Self {
        Self {
            precision,
            shape,
            layout,
            offset: 0,
        }
    }

    /// Dense planar descriptor with static dims.
    pub fn planar(precision: Precision, dims: &[usize]) -> MemoryDescPtr {
        Arc::new(Self::new(precision, Shape::from_static(dims), Layout::Ncsp))
    }

    /// Descriptor for an absent operand (e.g. a fully-connected node without bias).
    pub fn empty() -> MemoryDescPtr {
        Arc::new(Self::new(
            Precision::Undefined,
            Shape::from_static(&[0]),
            Layout::Ncsp,
        ))
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Same logical shape, new precision and layout.
    pub fn clone_with(&self, precision: Precision, layout: Layout) -> Self {
        Self {
            precision,
            shape: self.shape.clone(),
            layout,
            offset: 0,
        }
    }

    pub fn clone_with_dims(&self, dims: &[usize]) -> Self {
        Self {
            shape: Shape::from_static(dims),
            ..self.clone()
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn has_layout(&self, layout: Layout) -> bool {
        self.layout == layout
    }

    /// Element offset of the first element inside the underlying buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Bytes currently required by the operand; `0` for empty or not-yet-resolved shapes.
    pub fn current_mem_size(&self) -> usize {
        self.element_count()
            .map(|count| self.precision.storage_bytes(count))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.element_count() == Some(0)
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.precision, self.shape, self.layout)?;
        if self.offset != 0 {
            write!(f, "+{}", self.offset)?;
        }
        Ok(())
    }
}

/// Ordered input and output descriptors of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MemoryDescArgs {
    pub src: SmallVec<[MemoryDescPtr; 4]>,
    pub dst: SmallVec<[MemoryDescPtr; 1]>,
}

impl MemoryDescArgs {
    pub fn new(
        src: impl IntoIterator<Item = MemoryDescPtr>,
        dst: impl IntoIterator<Item = MemoryDescPtr>,
    ) -> Self {
        Self {
            src: src.into_iter().collect(),
            dst: dst.into_iter().collect(),
        }
    }

    pub fn src_precisions(&self) -> Vec<Precision> {
        self.src.iter().map(|desc| desc.precision()).collect()
    }

    /// Precision of the first output, `Undefined` when there is none.
    pub fn dst_precision(&self) -> Precision {
        self.dst
            .first()
            .map(|desc| desc.precision())
            .unwrap_or(Precision::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_dims_reports_dynamic_axis() {
        let shape = Shape::new([Dimension::Static(2), Dimension::Dynamic]);
        assert!(shape.static_dims().is_none());
        assert!(!shape.is_static());
        assert_eq!(shape.to_string(), "[2,?]");
    }

    #[test]
    fn checked_element_count_reports_overflow() {
        let err = checked_element_count_or_error(&[usize::MAX, 2], || "overflow")
            .expect_err("overflow should be reported");
        assert_eq!(err, "overflow");
    }

    #[test]
    fn mem_size_accounts_for_packed_precisions() {
        let desc = MemoryDesc::planar(Precision::U4, &[3, 5]);
        assert_eq!(desc.current_mem_size(), 8);
        assert_eq!(MemoryDesc::empty().current_mem_size(), 0);
        assert!(MemoryDesc::empty().is_empty());
    }

    #[test]
    fn value_equal_descriptors_compare_equal() {
        let a = MemoryDesc::planar(Precision::F32, &[4, 8]);
        let b = MemoryDesc::planar(Precision::F32, &[4, 8]);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_ne!(*a, a.clone_with(Precision::Bf16, Layout::Ncsp));
    }
}
