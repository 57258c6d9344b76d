//! Pairwise bound simplification.
//!
//! Given two bounds over the same scalar kind, produce the tightest
//! single bound consistent with both, report an incompatibility, or
//! decide that both must be kept. Integer bounds are normalized to
//! inclusive form first (`>2` becomes `>=3`, and fractional endpoints
//! are ceiled/floored), so that crossing and adjacency checks are exact.

use std::cmp::Ordering;

use strata_core::kind::Kind;
use strata_core::num::Num;

use crate::errors::Bottom;
use crate::value::{BoundValue, Op, Value};

// ── Result of a simplification ──────────────────────────────────────

/// Outcome of merging bounds `x & y`.
#[derive(Debug, Clone, PartialEq)]
pub enum Simplified {
    /// The pair collapsed to a single value or bound (possibly bottom).
    One(Value),
    /// Both bounds must be kept.
    Keep,
}

// ── Entry point ─────────────────────────────────────────────────────

/// Merge two bounds under `&` according to the policy table. `k` is the
/// kind accumulated for the subject so far; it decides whether integer
/// rounding applies to the endpoints.
pub fn simplify_bounds(k: Kind, x: &BoundValue, y: &BoundValue) -> Simplified {
    use Op::*;

    // `==` against anything: substitute the point and re-check.
    if x.op == Equal {
        return substitute(&x.value, y);
    }
    if y.op == Equal {
        return substitute(&y.value, x);
    }

    // `!=` against anything: redundant if its point already fails the
    // other bound.
    if x.op == NotEqual {
        return simplify_ne(x, y);
    }
    if y.op == NotEqual {
        return simplify_ne(y, x);
    }

    // Regex bounds only collapse when identical.
    if matches!(x.op, Match | NotMatch) || matches!(y.op, Match | NotMatch) {
        if x.op == y.op && x.value == y.value {
            return Simplified::One(Value::Bound(std::rc::Rc::new(x.clone())));
        }
        return Simplified::Keep;
    }

    // Remaining ops are the four ordered comparisons.
    match (x.value.as_num(), y.value.as_num()) {
        (Some(a), Some(b)) => simplify_numeric(k, x.op, a, y.op, b),
        _ => simplify_ordered(x, y),
    }
}

// ── Numeric bounds ──────────────────────────────────────────────────

/// An ordered bound in normal form. For integers, strict ops are folded
/// away and the endpoint is integral.
#[derive(Debug, Clone)]
struct Norm {
    op: Op,
    n: Num,
}

fn normalize_int(op: Op, n: &Num) -> Norm {
    match op {
        Op::Greater => {
            let n = if n.is_integral() { n.succ() } else { n.ceil() };
            Norm {
                op: Op::GreaterEqual,
                n,
            }
        }
        Op::GreaterEqual => Norm {
            op: Op::GreaterEqual,
            n: if n.is_integral() { n.floor() } else { n.ceil() },
        },
        Op::Less => {
            let n = if n.is_integral() { n.pred() } else { n.floor() };
            Norm {
                op: Op::LessEqual,
                n,
            }
        }
        Op::LessEqual => Norm {
            op: Op::LessEqual,
            n: if n.is_integral() { n.ceil() } else { n.floor() },
        },
        _ => unreachable!("normalize_int on non-ordered op"),
    }
}

fn bound_num(op: Op, n: Num) -> Value {
    Value::bound(op, Value::Num(n))
}

fn simplify_numeric(k: Kind, xop: Op, xn: &Num, yop: Op, yn: &Num) -> Simplified {
    let int_mode = k.meet(Kind::NUMBER) == Kind::INT || (xn.is_int() && yn.is_int());

    if int_mode {
        let a = normalize_int(xop, xn);
        let b = normalize_int(yop, yn);
        return match (a.op.is_lower_bound(), b.op.is_lower_bound()) {
            // Same direction: tighter endpoint wins.
            (true, true) => Simplified::One(bound_num(
                Op::GreaterEqual,
                if a.n >= b.n { a.n } else { b.n },
            )),
            (false, false) => {
                Simplified::One(bound_num(Op::LessEqual, if a.n <= b.n { a.n } else { b.n }))
            }
            // Opposite direction: check for crossing.
            (true, false) => int_opposite(&a, &b, xop, xn, yop, yn),
            (false, true) => int_opposite(&b, &a, xop, xn, yop, yn),
        };
    }

    let same_direction = xop.is_lower_bound() == yop.is_lower_bound();
    if same_direction {
        // Mixed strictness on the same endpoint: stricter wins.
        // Otherwise the tighter endpoint wins.
        let pick_x = match xn.cmp(yn) {
            Ordering::Equal => xop.is_strict(),
            Ordering::Greater => xop.is_lower_bound(),
            Ordering::Less => !xop.is_lower_bound(),
        };
        return if pick_x {
            Simplified::One(bound_num(xop, xn.clone()))
        } else {
            Simplified::One(bound_num(yop, yn.clone()))
        };
    }

    // Opposite directions over the reals.
    let (lo, lo_op, hi, hi_op) = if xop.is_lower_bound() {
        (xn, xop, yn, yop)
    } else {
        (yn, yop, xn, xop)
    };
    match lo.cmp(hi) {
        Ordering::Greater => Simplified::One(incompatible(xop, xn, yop, yn, false)),
        Ordering::Equal => {
            if lo_op.is_strict() || hi_op.is_strict() {
                Simplified::One(incompatible(xop, xn, yop, yn, false))
            } else {
                // Endpoints equal, both inclusive: admits one value.
                Simplified::Keep
            }
        }
        Ordering::Less => Simplified::Keep,
    }
}

fn int_opposite(lo: &Norm, hi: &Norm, xop: Op, xn: &Num, yop: Op, yn: &Num) -> Simplified {
    match lo.n.cmp(&hi.n) {
        Ordering::Greater => Simplified::One(incompatible(xop, xn, yop, yn, true)),
        // Gap of zero with both (normalized) inclusive: admits one
        // value; keep both bounds rather than collapsing.
        Ordering::Equal => Simplified::Keep,
        Ordering::Less => Simplified::Keep,
    }
}

fn incompatible(xop: Op, xn: &Num, yop: Op, yn: &Num, int_mode: bool) -> Value {
    let what = if int_mode { "integer bounds" } else { "bounds" };
    Value::bottom(Bottom::eval(format!(
        "incompatible {} {}{} and {}{}",
        what, xop, xn, yop, yn
    )))
}

// ── Non-numeric ordered bounds (strings, bytes) ─────────────────────

fn endpoint_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn simplify_ordered(x: &BoundValue, y: &BoundValue) -> Simplified {
    let ord = match endpoint_cmp(&x.value, &y.value) {
        Some(o) => o,
        None => {
            return Simplified::One(Value::bottom(Bottom::eval(format!(
                "conflicting bounds {}{} and {}{}",
                x.op, x.value, y.op, y.value
            ))))
        }
    };
    if x.op.is_lower_bound() == y.op.is_lower_bound() {
        // Tighter endpoint wins; stricter wins on ties.
        let pick_x = match ord {
            Ordering::Equal => x.op.is_strict(),
            Ordering::Greater => x.op.is_lower_bound(),
            Ordering::Less => !x.op.is_lower_bound(),
        };
        let w = if pick_x { x } else { y };
        return Simplified::One(Value::Bound(std::rc::Rc::new(w.clone())));
    }
    let (lo, hi, lo_op, hi_op) = if x.op.is_lower_bound() {
        (&x.value, &y.value, x.op, y.op)
    } else {
        (&y.value, &x.value, y.op, x.op)
    };
    match endpoint_cmp(lo, hi).unwrap() {
        Ordering::Greater => Simplified::One(Value::bottom(Bottom::eval(format!(
            "incompatible bounds {}{} and {}{}",
            x.op, x.value, y.op, y.value
        )))),
        Ordering::Equal if lo_op.is_strict() || hi_op.is_strict() => {
            Simplified::One(Value::bottom(Bottom::eval(format!(
                "incompatible bounds {}{} and {}{}",
                x.op, x.value, y.op, y.value
            ))))
        }
        _ => Simplified::Keep,
    }
}

// ── `==` and `!=` interaction ───────────────────────────────────────

/// Check a concrete point against an ordered bound without touching the
/// regex cache. Returns `None` for bound shapes this module cannot
/// decide (regex matches).
pub fn point_satisfies(point: &Value, b: &BoundValue) -> Option<bool> {
    match b.op {
        Op::Equal => Some(point == &b.value),
        Op::NotEqual => Some(point != &b.value),
        Op::Less | Op::LessEqual | Op::Greater | Op::GreaterEqual => {
            let ord = match (point.as_num(), b.value.as_num()) {
                (Some(a), Some(e)) => a.cmp(e),
                _ => endpoint_cmp(point, &b.value)?,
            };
            Some(match b.op {
                Op::Less => ord == Ordering::Less,
                Op::LessEqual => ord != Ordering::Greater,
                Op::Greater => ord == Ordering::Greater,
                Op::GreaterEqual => ord != Ordering::Less,
                _ => unreachable!(),
            })
        }
        _ => None,
    }
}

fn substitute(point: &Value, other: &BoundValue) -> Simplified {
    match point_satisfies(point, other) {
        Some(true) => Simplified::One(point.clone()),
        Some(false) => Simplified::One(Value::bottom(Bottom::eval(format!(
            "invalid value {} (out of bound {}{})",
            point, other.op, other.value
        )))),
        None => Simplified::Keep,
    }
}

fn simplify_ne(ne: &BoundValue, other: &BoundValue) -> Simplified {
    match point_satisfies(&ne.value, other) {
        // The excluded point is already outside the other bound.
        Some(false) => Simplified::One(Value::Bound(std::rc::Rc::new(other.clone()))),
        _ => Simplified::Keep,
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
