//! Unified arbitrary-precision numbers.
//!
//! Integers and floats share one decimal representation (coefficient,
//! sign, exponent); the `Kind` records whether a value is still an int.
//! Decimal division runs at a fixed minimum precision; the integer-only
//! operators (`div`, `mod`, `quo`, `rem`) use big-integer semantics.

use bigdecimal::{BigDecimal, RoundingMode};
use num_bigint::{BigInt, ToBigInt};
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::kind::Kind;

/// Decimal digits kept by `/`.
pub const DIV_PRECISION: u64 = 24;

/// Error constructing or converting a number.
#[derive(Debug, Error, PartialEq)]
pub enum NumError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("non-finite float {0}")]
    NonFinite(f64),
    #[error("value is not an integer")]
    NotAnInteger,
    #[error("negative count")]
    NegativeCount,
    #[error("count does not fit in uint64")]
    Overflow,
}

/// An arbitrary-precision number with an int/float kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Num {
    dec: BigDecimal,
    kind: Kind,
}

impl Num {
    pub fn int_i64(i: i64) -> Num {
        Num {
            dec: BigDecimal::from(i),
            kind: Kind::INT,
        }
    }

    pub fn int_big(i: BigInt) -> Num {
        Num {
            dec: BigDecimal::from(i),
            kind: Kind::INT,
        }
    }

    pub fn float_f64(f: f64) -> Result<Num, NumError> {
        let dec = BigDecimal::try_from(f).map_err(|_| NumError::NonFinite(f))?;
        Ok(Num {
            dec,
            kind: Kind::FLOAT,
        })
    }

    pub fn from_decimal(dec: BigDecimal, kind: Kind) -> Num {
        debug_assert!(kind == Kind::INT || kind == Kind::FLOAT);
        Num { dec, kind }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn decimal(&self) -> &BigDecimal {
        &self.dec
    }

    pub fn is_int(&self) -> bool {
        self.kind == Kind::INT
    }

    /// True if the value is mathematically integral, regardless of kind.
    pub fn is_integral(&self) -> bool {
        self.dec.is_integer()
    }

    pub fn is_zero(&self) -> bool {
        self.dec.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.dec.sign() == num_bigint::Sign::Minus
    }

    /// The integer part, if the value is integral.
    pub fn to_bigint(&self) -> Option<BigInt> {
        if !self.dec.is_integer() {
            return None;
        }
        self.dec.to_bigint()
    }

    /// Convert to a repetition count. Rejects fractional, negative and
    /// too-large values.
    pub fn as_count(&self) -> Result<u64, NumError> {
        let i = self.to_bigint().ok_or(NumError::NotAnInteger)?;
        if i.is_negative() {
            return Err(NumError::NegativeCount);
        }
        i.to_u64().ok_or(NumError::Overflow)
    }

    /// Smallest integer ≥ self, as an int-kinded number.
    pub fn ceil(&self) -> Num {
        Num {
            dec: self.dec.with_scale_round(0, RoundingMode::Ceiling),
            kind: Kind::INT,
        }
    }

    /// Largest integer ≤ self, as an int-kinded number.
    pub fn floor(&self) -> Num {
        Num {
            dec: self.dec.with_scale_round(0, RoundingMode::Floor),
            kind: Kind::INT,
        }
    }

    /// self + 1 (int successor; used to tighten strict integer bounds).
    pub fn succ(&self) -> Num {
        Num {
            dec: &self.dec + BigDecimal::from(1),
            kind: Kind::INT,
        }
    }

    /// self - 1.
    pub fn pred(&self) -> Num {
        Num {
            dec: &self.dec - BigDecimal::from(1),
            kind: Kind::INT,
        }
    }

    fn join_kind(&self, other: &Num) -> Kind {
        if self.kind == Kind::INT && other.kind == Kind::INT {
            Kind::INT
        } else {
            Kind::FLOAT
        }
    }

    pub fn add(&self, other: &Num) -> Num {
        Num {
            dec: &self.dec + &other.dec,
            kind: self.join_kind(other),
        }
    }

    pub fn sub(&self, other: &Num) -> Num {
        Num {
            dec: &self.dec - &other.dec,
            kind: self.join_kind(other),
        }
    }

    pub fn mul(&self, other: &Num) -> Num {
        Num {
            dec: &self.dec * &other.dec,
            kind: self.join_kind(other),
        }
    }

    pub fn neg(&self) -> Num {
        Num {
            dec: -&self.dec,
            kind: self.kind,
        }
    }

    /// Decimal division; the result is always float-kinded.
    pub fn quo(&self, other: &Num) -> Result<Num, NumError> {
        if other.is_zero() {
            return Err(NumError::DivisionByZero);
        }
        let dec = (&self.dec / &other.dec).with_prec(DIV_PRECISION).normalized();
        Ok(Num {
            dec,
            kind: Kind::FLOAT,
        })
    }

    fn int_pair(&self, other: &Num) -> Result<(BigInt, BigInt), NumError> {
        let a = self.to_bigint().ok_or(NumError::NotAnInteger)?;
        let b = other.to_bigint().ok_or(NumError::NotAnInteger)?;
        if b.is_zero() {
            return Err(NumError::DivisionByZero);
        }
        Ok((a, b))
    }

    /// Euclidean division: the remainder of `int_mod` is never negative.
    pub fn int_div(&self, other: &Num) -> Result<Num, NumError> {
        let (a, b) = self.int_pair(other)?;
        let r = euclidean_rem(&a, &b);
        Ok(Num::int_big((a - r) / b))
    }

    /// Euclidean remainder; always in `[0, |other|)`.
    pub fn int_mod(&self, other: &Num) -> Result<Num, NumError> {
        let (a, b) = self.int_pair(other)?;
        Ok(Num::int_big(euclidean_rem(&a, &b)))
    }

    /// Truncated division (rounds toward zero).
    pub fn int_quo(&self, other: &Num) -> Result<Num, NumError> {
        let (a, b) = self.int_pair(other)?;
        Ok(Num::int_big(a / b))
    }

    /// Truncated remainder; takes the sign of the dividend.
    pub fn int_rem(&self, other: &Num) -> Result<Num, NumError> {
        let (a, b) = self.int_pair(other)?;
        Ok(Num::int_big(a % b))
    }
}

fn euclidean_rem(a: &BigInt, b: &BigInt) -> BigInt {
    let r = a % b;
    if r.is_negative() {
        r + b.abs()
    } else {
        r
    }
}

// Numbers compare by value; 1 and 1.0 are the same point of the lattice.
impl PartialEq for Num {
    fn eq(&self, other: &Self) -> bool {
        self.dec == other.dec
    }
}

impl Eq for Num {}

impl PartialOrd for Num {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Num {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dec.cmp(&other.dec)
    }
}

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == Kind::INT {
            match self.to_bigint() {
                Some(i) => write!(f, "{}", i),
                None => write!(f, "{}", self.dec),
            }
        } else {
            write!(f, "{}", self.dec.normalized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_compare_by_value() {
        let one = Num::int_i64(1);
        let one_f = Num::float_f64(1.0).unwrap();
        assert_eq!(one, one_f);
        assert!(Num::int_i64(2) > one_f);
    }

    #[test]
    fn quo_is_float_at_precision() {
        let r = Num::int_i64(1).quo(&Num::int_i64(3)).unwrap();
        assert_eq!(r.kind(), Kind::FLOAT);
        assert!(!r.is_integral());
        assert!(Num::int_i64(1)
            .quo(&Num::int_i64(0))
            .is_err());
    }

    #[test]
    fn euclidean_vs_truncated() {
        let a = Num::int_i64(-7);
        let b = Num::int_i64(3);
        assert_eq!(a.int_mod(&b).unwrap(), Num::int_i64(2));
        assert_eq!(a.int_div(&b).unwrap(), Num::int_i64(-3));
        assert_eq!(a.int_rem(&b).unwrap(), Num::int_i64(-1));
        assert_eq!(a.int_quo(&b).unwrap(), Num::int_i64(-2));
    }

    #[test]
    fn ceil_floor() {
        let x = Num::float_f64(2.5).unwrap();
        assert_eq!(x.ceil(), Num::int_i64(3));
        assert_eq!(x.floor(), Num::int_i64(2));
        assert!(x.ceil().is_int());
    }

    #[test]
    fn count_conversion() {
        assert_eq!(Num::int_i64(4).as_count().unwrap(), 4);
        assert_eq!(
            Num::int_i64(-1).as_count().unwrap_err(),
            NumError::NegativeCount
        );
        assert_eq!(
            Num::float_f64(1.5).unwrap().as_count().unwrap_err(),
            NumError::NotAnInteger
        );
    }
}
