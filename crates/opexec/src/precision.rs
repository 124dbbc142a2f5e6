//! Element precisions and the admissible-precision sets used by negotiation tables.

use std::fmt;
use std::ops::{BitOr, Not};

use serde::{Deserialize, Serialize};

/// Scalar element precision of a tensor operand.
///
/// `Undefined` is the wildcard: an operand whose precision is not pinned yet (for example an
/// absent bias) and therefore satisfies every [`TypeMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Precision {
    Undefined,
    F32,
    Bf16,
    F16,
    I32,
    I8,
    U8,
    I4,
    U4,
    Nf4,
}

impl Precision {
    /// Every concrete precision, in declaration order. `Undefined` is not part of the set.
    pub const ALL: [Precision; 9] = [
        Precision::F32,
        Precision::Bf16,
        Precision::F16,
        Precision::I32,
        Precision::I8,
        Precision::U8,
        Precision::I4,
        Precision::U4,
        Precision::Nf4,
    ];

    pub fn bitwidth(self) -> usize {
        match self {
            Precision::Undefined => 0,
            Precision::F32 | Precision::I32 => 32,
            Precision::Bf16 | Precision::F16 => 16,
            Precision::I8 | Precision::U8 => 8,
            Precision::I4 | Precision::U4 | Precision::Nf4 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Precision::F32 | Precision::Bf16 | Precision::F16)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Precision::I32 | Precision::I8 | Precision::U8 | Precision::I4 | Precision::U4
        )
    }

    /// Sub-byte precisions stored two elements per byte.
    pub fn is_packed(self) -> bool {
        self.bitwidth() == 4
    }

    /// Bytes needed to store `elements` values of this precision, saturating at `usize::MAX`.
    pub fn storage_bytes(self, elements: usize) -> usize {
        elements
            .checked_mul(self.bitwidth())
            .map_or(usize::MAX, |bits| bits.div_ceil(8))
    }

    pub fn name(self) -> &'static str {
        match self {
            Precision::Undefined => "undefined",
            Precision::F32 => "f32",
            Precision::Bf16 => "bf16",
            Precision::F16 => "f16",
            Precision::I32 => "i32",
            Precision::I8 => "i8",
            Precision::U8 => "u8",
            Precision::I4 => "i4",
            Precision::U4 => "u4",
            Precision::Nf4 => "nf4",
        }
    }

    fn bit(self) -> u16 {
        match self {
            Precision::Undefined => 0,
            Precision::F32 => 1 << 0,
            Precision::Bf16 => 1 << 1,
            Precision::F16 => 1 << 2,
            Precision::I32 => 1 << 3,
            Precision::I8 => 1 << 4,
            Precision::U8 => 1 << 5,
            Precision::I4 => 1 << 6,
            Precision::U4 => 1 << 7,
            Precision::Nf4 => 1 << 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ALL_BITS: u16 = (1 << 9) - 1;

/// A set of admissible precisions over the closed [`Precision`] enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeMask {
    bits: u16,
}

impl TypeMask {
    pub const EMPTY: TypeMask = TypeMask { bits: 0 };
    pub const ANY: TypeMask = TypeMask { bits: ALL_BITS };

    pub const fn from_bits(bits: u16) -> Self {
        TypeMask {
            bits: bits & ALL_BITS,
        }
    }

    pub fn of(precisions: impl IntoIterator<Item = Precision>) -> Self {
        precisions
            .into_iter()
            .fold(TypeMask::EMPTY, |mask, precision| mask | precision)
    }

    pub fn union(self, other: TypeMask) -> Self {
        TypeMask {
            bits: self.bits | other.bits,
        }
    }

    pub fn contains(self, precision: Precision) -> bool {
        precision != Precision::Undefined && self.bits & precision.bit() != 0
    }

    /// Membership with the wildcard rule applied: `Undefined` matches any mask.
    pub fn matches(self, precision: Precision) -> bool {
        precision == Precision::Undefined || self.contains(precision)
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Precision> {
        Precision::ALL
            .into_iter()
            .filter(move |precision| self.contains(*precision))
    }
}

impl From<Precision> for TypeMask {
    fn from(precision: Precision) -> Self {
        TypeMask {
            bits: precision.bit(),
        }
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        self.union(rhs)
    }
}

impl BitOr<Precision> for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: Precision) -> TypeMask {
        self.union(rhs.into())
    }
}

impl Not for TypeMask {
    type Output = TypeMask;

    fn not(self) -> TypeMask {
        TypeMask {
            bits: !self.bits & ALL_BITS,
        }
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TypeMask::ANY {
            return f.write_str("TypeMask(any)");
        }
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Short aliases used when declaring negotiation tables.
pub mod masks {
    use super::{Precision, TypeMask};

    pub const ANY: TypeMask = TypeMask::ANY;
    pub const F32: TypeMask = TypeMask::from_bits(1 << 0);
    pub const BF16: TypeMask = TypeMask::from_bits(1 << 1);
    pub const F16: TypeMask = TypeMask::from_bits(1 << 2);
    pub const I32: TypeMask = TypeMask::from_bits(1 << 3);
    pub const I8: TypeMask = TypeMask::from_bits(1 << 4);
    pub const U8: TypeMask = TypeMask::from_bits(1 << 5);
    pub const I4: TypeMask = TypeMask::from_bits(1 << 6);
    pub const U4: TypeMask = TypeMask::from_bits(1 << 7);
    pub const NF4: TypeMask = TypeMask::from_bits(1 << 8);
    /// bf16 or f16.
    pub const HALF_FLOAT: TypeMask = TypeMask::from_bits((1 << 1) | (1 << 2));

    pub fn mask(precision: Precision) -> TypeMask {
        precision.into()
    }
}
