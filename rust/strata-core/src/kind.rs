//! Type-kind bitset for lattice values.
//!
//! A `Kind` is the set of simple types a value may still assume. `TOP` is
//! the full set, `BOTTOM` the empty one; meet is bitwise intersection and
//! join bitwise union. A fully evaluated scalar has a singleton kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Bitset of simple types. The default is the empty (bottom) set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Kind(u16);

impl Kind {
    pub const BOTTOM: Kind = Kind(0);
    pub const NULL: Kind = Kind(1 << 0);
    pub const BOOL: Kind = Kind(1 << 1);
    pub const INT: Kind = Kind(1 << 2);
    pub const FLOAT: Kind = Kind(1 << 3);
    pub const STRING: Kind = Kind(1 << 4);
    pub const BYTES: Kind = Kind(1 << 5);
    pub const LIST: Kind = Kind(1 << 6);
    pub const STRUCT: Kind = Kind(1 << 7);

    pub const NUMBER: Kind = Kind(Self::INT.0 | Self::FLOAT.0);
    pub const SCALAR: Kind =
        Kind(Self::NULL.0 | Self::BOOL.0 | Self::NUMBER.0 | Self::STRING.0 | Self::BYTES.0);
    pub const COMPOSITE: Kind = Kind(Self::LIST.0 | Self::STRUCT.0);
    pub const TOP: Kind = Kind(Self::SCALAR.0 | Self::COMPOSITE.0);

    /// The meet (intersection) of two kinds.
    pub fn meet(self, other: Kind) -> Kind {
        Kind(self.0 & other.0)
    }

    /// The join (union) of two kinds.
    pub fn join(self, other: Kind) -> Kind {
        Kind(self.0 | other.0)
    }

    pub fn is_bottom(self) -> bool {
        self.0 == 0
    }

    pub fn is_top(self) -> bool {
        self == Self::TOP
    }

    /// True if `self` admits every type in `other`.
    pub fn contains(self, other: Kind) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the two kinds share at least one type.
    pub fn intersects(self, other: Kind) -> bool {
        self.0 & other.0 != 0
    }

    /// True if exactly one type bit is set.
    pub fn is_single(self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }

    /// Raw bit representation.
    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for Kind {
    type Output = Kind;
    fn bitor(self, rhs: Kind) -> Kind {
        self.join(rhs)
    }
}

impl BitAnd for Kind {
    type Output = Kind;
    fn bitand(self, rhs: Kind) -> Kind {
        self.meet(rhs)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            return write!(f, "_|_");
        }
        if self.is_top() {
            return write!(f, "_");
        }
        if *self == Self::NUMBER {
            return write!(f, "number");
        }
        let names = [
            (Self::NULL, "null"),
            (Self::BOOL, "bool"),
            (Self::INT, "int"),
            (Self::FLOAT, "float"),
            (Self::STRING, "string"),
            (Self::BYTES, "bytes"),
            (Self::LIST, "list"),
            (Self::STRUCT, "struct"),
        ];
        let mut first = true;
        for (k, name) in names {
            if self.intersects(k) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meet_and_join() {
        assert_eq!(Kind::INT.meet(Kind::NUMBER), Kind::INT);
        assert_eq!(Kind::INT.join(Kind::FLOAT), Kind::NUMBER);
        assert!(Kind::INT.meet(Kind::STRING).is_bottom());
        assert_eq!(Kind::TOP.meet(Kind::STRUCT), Kind::STRUCT);
    }

    #[test]
    fn single_kind_detection() {
        assert!(Kind::BOOL.is_single());
        assert!(!Kind::NUMBER.is_single());
        assert!(!Kind::BOTTOM.is_single());
    }

    #[test]
    fn display_names() {
        assert_eq!(Kind::NUMBER.to_string(), "number");
        assert_eq!(Kind::BOTTOM.to_string(), "_|_");
        assert_eq!((Kind::STRING | Kind::BYTES).to_string(), "string|bytes");
    }
}
