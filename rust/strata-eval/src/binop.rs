//! Binary operations on values.
//!
//! `bin_op` requires both operands concrete (except for the lattice
//! connectives `&` and `|`) and otherwise produces an Incomplete bottom
//! naming the non-concrete side. The meet operation implements the
//! value-level lattice: scalars conflict or collapse, bounds simplify
//! pairwise, types restrict kinds, and disjunctions distribute.

use std::rc::Rc;

use strata_core::num::{Num, NumError};

use crate::bounds::{point_satisfies, simplify_bounds, Simplified};
use crate::context::OpContext;
use crate::disjunct::DefaultMode;
use crate::errors::{combine, Bottom};
use crate::value::{BoundValue, DisjunctionValue, Op, UnaryOp, Value};

/// The default mode of alternative `i` of an evaluated disjunction:
/// marked alternatives are defaults, unmarked ones count as non-default
/// only when the disjunction carries marks at all.
fn alt_mode(d: &DisjunctionValue, i: usize) -> DefaultMode {
    if i < d.num_defaults {
        DefaultMode::Is
    } else if d.num_defaults > 0 {
        DefaultMode::Not
    } else {
        DefaultMode::Maybe
    }
}

/// The repetition count as a `usize`, provided `len * count` cannot
/// overflow an allocation.
fn checked_repeat(len: usize, count: u64) -> Option<usize> {
    let count = usize::try_from(count).ok()?;
    len.checked_mul(count)?;
    Some(count)
}

/// Assemble surviving alternatives into a value, defaults first. A
/// single survivor collapses to the value itself.
fn collect_disjuncts(mut out: Vec<(Value, DefaultMode)>) -> Value {
    debug_assert!(!out.is_empty());
    if out.len() == 1 {
        return out.pop().unwrap().0;
    }
    out.sort_by_key(|(_, m)| *m != DefaultMode::Is);
    let num_defaults = out.iter().filter(|(_, m)| *m == DefaultMode::Is).count();
    let values = out.into_iter().map(|(v, _)| v).collect();
    Value::disjunction(values, num_defaults)
}

impl OpContext {
    /// Apply a binary operator to two evaluated values.
    pub fn bin_op(&mut self, pos: u32, op: Op, lhs: Value, rhs: Value) -> Value {
        if let (Value::Bottom(a), Value::Bottom(b)) = (&lhs, &rhs) {
            return Value::Bottom(combine(a.clone(), b.clone()));
        }
        if lhs.is_bottom() {
            return lhs;
        }
        if rhs.is_bottom() {
            return rhs;
        }
        match op {
            Op::And => self.meet(pos, lhs, rhs),
            Op::Or => self.join(vec![lhs, rhs]),
            _ => {
                // Disjunctions with a single default are elided to it
                // for computation.
                let lhs = lhs.default();
                let rhs = rhs.default();
                if !lhs.is_concrete() {
                    return Value::bottom(
                        Bottom::incomplete(format!(
                            "non-concrete value {} in left operand to {}",
                            lhs, op
                        ))
                        .with_pos(pos),
                    );
                }
                if !rhs.is_concrete() {
                    return Value::bottom(
                        Bottom::incomplete(format!(
                            "non-concrete value {} in right operand to {}",
                            rhs, op
                        ))
                        .with_pos(pos),
                    );
                }
                self.bin_op_concrete(pos, op, lhs, rhs)
            }
        }
    }

    fn bin_op_concrete(&mut self, pos: u32, op: Op, lhs: Value, rhs: Value) -> Value {
        match op {
            Op::Equal => Value::Bool(self.values_equal(&lhs, &rhs)),
            Op::NotEqual => Value::Bool(!self.values_equal(&lhs, &rhs)),

            Op::Less | Op::LessEqual | Op::Greater | Op::GreaterEqual => {
                let ord = match (&lhs, &rhs) {
                    (Value::Num(a), Value::Num(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
                    _ => {
                        return Value::bottom(
                            Bottom::incomplete(format!(
                                "cannot compare {} with {} using {}",
                                lhs, rhs, op
                            ))
                            .with_pos(pos),
                        )
                    }
                };
                Value::Bool(match op {
                    Op::Less => ord.is_lt(),
                    Op::LessEqual => ord.is_le(),
                    Op::Greater => ord.is_gt(),
                    Op::GreaterEqual => ord.is_ge(),
                    _ => unreachable!(),
                })
            }

            Op::Match | Op::NotMatch => {
                let (s, pat) = match (&lhs, &rhs) {
                    (Value::Str(s), Value::Str(p)) => (s.as_str(), p.as_str()),
                    _ => {
                        return Value::bottom(
                            Bottom::eval(format!("cannot match {} against {}", lhs, rhs))
                                .with_pos(pos),
                        )
                    }
                };
                match self.compile_regex(pat) {
                    Ok(re) => {
                        let m = re.is_match(s);
                        Value::Bool(if op == Op::Match { m } else { !m })
                    }
                    Err(b) => Value::Bottom(b),
                }
            }

            Op::Add => match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => Value::Num(a.add(b)),
                (Value::Str(a), Value::Str(b)) => Value::string(format!("{}{}", a, b)),
                (Value::Bytes(a), Value::Bytes(b)) => {
                    let mut out = a.as_ref().clone();
                    out.extend_from_slice(b);
                    Value::bytes(out)
                }
                (Value::ListMarker, _) | (_, Value::ListMarker) | (Value::Vertex(_), _)
                | (_, Value::Vertex(_)) => Value::bottom(
                    Bottom::eval("list addition is not supported; use list.Concat")
                        .with_pos(pos),
                ),
                _ => self.mismatch(pos, op, &lhs, &rhs),
            },

            Op::Subtract => match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => Value::Num(a.sub(b)),
                _ => self.mismatch(pos, op, &lhs, &rhs),
            },

            Op::Multiply => match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => Value::Num(a.mul(b)),
                (Value::Num(n), Value::Str(s)) | (Value::Str(s), Value::Num(n)) => {
                    match n.as_count() {
                        Ok(c) => match checked_repeat(s.len(), c) {
                            Some(times) => Value::string(s.repeat(times)),
                            None => Value::bottom(
                                Bottom::eval("repeat count too large").with_pos(pos),
                            ),
                        },
                        Err(e) => Value::bottom(Bottom::eval(e.to_string()).with_pos(pos)),
                    }
                }
                (Value::Num(n), Value::Bytes(b)) | (Value::Bytes(b), Value::Num(n)) => {
                    match n.as_count() {
                        Ok(c) => match checked_repeat(b.len(), c) {
                            Some(times) => Value::bytes(b.repeat(times)),
                            None => Value::bottom(
                                Bottom::eval("repeat count too large").with_pos(pos),
                            ),
                        },
                        Err(e) => Value::bottom(Bottom::eval(e.to_string()).with_pos(pos)),
                    }
                }
                _ => self.mismatch(pos, op, &lhs, &rhs),
            },

            Op::Divide => match (&lhs, &rhs) {
                (Value::Num(a), Value::Num(b)) => self.num_result(pos, a.quo(b)),
                _ => self.mismatch(pos, op, &lhs, &rhs),
            },

            Op::IntDivide | Op::IntModulo | Op::IntQuotient | Op::IntRemainder => {
                match (&lhs, &rhs) {
                    (Value::Num(a), Value::Num(b)) => {
                        let r = match op {
                            Op::IntDivide => a.int_div(b),
                            Op::IntModulo => a.int_mod(b),
                            Op::IntQuotient => a.int_quo(b),
                            Op::IntRemainder => a.int_rem(b),
                            _ => unreachable!(),
                        };
                        self.num_result(pos, r)
                    }
                    _ => self.mismatch(pos, op, &lhs, &rhs),
                }
            }

            Op::And | Op::Or => unreachable!("handled by bin_op"),
        }
    }

    fn num_result(&self, pos: u32, r: Result<Num, NumError>) -> Value {
        match r {
            Ok(n) => Value::Num(n),
            Err(e) => Value::bottom(Bottom::eval(e.to_string()).with_pos(pos)),
        }
    }

    fn mismatch(&self, pos: u32, op: Op, lhs: &Value, rhs: &Value) -> Value {
        Value::bottom(
            Bottom::eval(format!(
                "invalid operands {} and {} to {} (mismatched kinds {} and {})",
                lhs,
                rhs,
                op,
                lhs.kind(),
                rhs.kind()
            ))
            .with_pos(pos),
        )
    }

    /// Equality under the struct-compare rule: unequal kinds compare
    /// false; null only equals null.
    fn values_equal(&self, lhs: &Value, rhs: &Value) -> bool {
        if !lhs.kind().intersects(rhs.kind()) {
            return false;
        }
        self.equal(lhs, rhs, self.config.check_structural)
    }

    // ── Meet (`&`) ──────────────────────────────────────────────────

    /// The meet of two evaluated values.
    pub fn meet(&mut self, pos: u32, a: Value, b: Value) -> Value {
        match (a, b) {
            (Value::Bottom(x), Value::Bottom(y)) => Value::Bottom(combine(x, y)),
            (x @ Value::Bottom(_), _) | (_, x @ Value::Bottom(_)) => x,
            (Value::Top, v) | (v, Value::Top) => v,

            (Value::BasicType(x), Value::BasicType(y)) => {
                let k = x.meet(y);
                if k.is_bottom() {
                    Value::bottom(
                        Bottom::eval(format!("conflicting types {} and {}", x, y)).with_pos(pos),
                    )
                } else {
                    Value::BasicType(k)
                }
            }
            (Value::BasicType(k), v) | (v, Value::BasicType(k)) if v.is_concrete() => {
                if k.intersects(v.kind()) {
                    v
                } else {
                    Value::bottom(
                        Bottom::eval(format!("conflicting values {} and {}", k, v)).with_pos(pos),
                    )
                }
            }
            (Value::BasicType(k), Value::Bound(b)) | (Value::Bound(b), Value::BasicType(k)) => {
                let bk = Value::Bound(b.clone()).kind().meet(k);
                if bk.is_bottom() {
                    Value::bottom(
                        Bottom::eval(format!("conflicting types {} and {}", k, Value::Bound(b)))
                            .with_pos(pos),
                    )
                } else {
                    Value::Conjunction(Rc::new(vec![Value::BasicType(k), Value::Bound(b)]))
                }
            }

            (Value::Bound(x), Value::Bound(y)) => {
                let k = Value::Bound(x.clone())
                    .kind()
                    .meet(Value::Bound(y.clone()).kind());
                match simplify_bounds(k, &x, &y) {
                    Simplified::One(v) => v,
                    Simplified::Keep => {
                        Value::Conjunction(Rc::new(vec![Value::Bound(x), Value::Bound(y)]))
                    }
                }
            }
            (Value::Bound(b), v) | (v, Value::Bound(b)) if v.is_concrete() => {
                match self.apply_bound(&v, &b) {
                    Ok(()) => v,
                    Err(e) => Value::Bottom(e),
                }
            }

            (Value::Validator(val), v) | (v, Value::Validator(val)) if v.is_concrete() => {
                match val.validate(self, &v) {
                    None => v,
                    Some(e) => Value::Bottom(e),
                }
            }

            (Value::Conjunction(xs), v) | (v, Value::Conjunction(xs)) => {
                let mut acc = v;
                for x in xs.iter() {
                    acc = self.meet(pos, acc, x.clone());
                }
                acc
            }

            // The default of the meet is the meet of the defaults: each
            // surviving pair joins the modes of both contributing
            // alternatives under the saturating max.
            (Value::Disjunction(a), Value::Disjunction(b)) => {
                let mut out: Vec<(Value, DefaultMode)> = Vec::new();
                for (i, x) in a.values.iter().enumerate() {
                    for (j, y) in b.values.iter().enumerate() {
                        let m = self.meet(pos, x.clone(), y.clone());
                        if m.is_bottom() {
                            continue;
                        }
                        let mode = alt_mode(&a, i).combine(alt_mode(&b, j));
                        if !out.iter().any(|(seen, _)| seen == &m) {
                            out.push((m, mode));
                        }
                    }
                }
                if out.is_empty() {
                    return Value::bottom(
                        Bottom::eval(format!(
                            "empty disjunction: no alternatives of {} and {} unify",
                            Value::Disjunction(a),
                            Value::Disjunction(b)
                        ))
                        .with_pos(pos),
                    );
                }
                collect_disjuncts(out)
            }
            (Value::Disjunction(d), v) | (v, Value::Disjunction(d)) => {
                let mut out: Vec<(Value, DefaultMode)> = Vec::new();
                for (i, alt) in d.values.iter().enumerate() {
                    let m = self.meet(pos, alt.clone(), v.clone());
                    if m.is_bottom() {
                        continue;
                    }
                    let mode = alt_mode(&d, i);
                    if !out.iter().any(|(seen, _)| seen == &m) {
                        out.push((m, mode));
                    }
                }
                if out.is_empty() {
                    return Value::bottom(
                        Bottom::eval(format!("empty disjunction: no alternative matches {}", v))
                            .with_pos(pos),
                    );
                }
                collect_disjuncts(out)
            }

            (Value::StructMarker, Value::StructMarker) => Value::StructMarker,
            (Value::ListMarker, Value::ListMarker) => Value::ListMarker,
            (Value::Vertex(x), Value::Vertex(y)) if x == y => Value::Vertex(x),
            (Value::Vertex(x), Value::Vertex(y)) => {
                if self.equal(&Value::Vertex(x), &Value::Vertex(y), false) {
                    Value::Vertex(x)
                } else {
                    Value::bottom(
                        Bottom::eval("conflicting struct values".to_string()).with_pos(pos),
                    )
                }
            }

            (x, y) => {
                if self.equal(&x, &y, false) {
                    // Prefer the int-kinded representative.
                    match (&x, &y) {
                        (Value::Num(a), Value::Num(b)) if !a.is_int() && b.is_int() => y,
                        _ => x,
                    }
                } else {
                    Value::bottom(
                        Bottom::eval(format!("conflicting values {} and {}", x, y)).with_pos(pos),
                    )
                }
            }
        }
    }

    /// The join (`|`): flatten into a disjunction value without marks.
    pub fn join(&mut self, values: Vec<Value>) -> Value {
        let mut out: Vec<Value> = Vec::new();
        let mut errs: Vec<Rc<Bottom>> = Vec::new();
        for v in values {
            match v {
                Value::Disjunction(d) => {
                    for alt in &d.values {
                        if !out.contains(alt) {
                            out.push(alt.clone());
                        }
                    }
                }
                Value::Bottom(b) => errs.push(b),
                other => {
                    if !out.contains(&other) {
                        out.push(other);
                    }
                }
            }
        }
        match out.len() {
            0 => Value::Bottom(crate::errors::compound("empty disjunction", errs)),
            1 => out.pop().unwrap(),
            _ => Value::disjunction(out, 0),
        }
    }

    /// Check a concrete subject against a bound, resolving regex bounds
    /// through the pattern cache.
    pub fn apply_bound(&mut self, subject: &Value, b: &BoundValue) -> Result<(), Rc<Bottom>> {
        match b.op {
            Op::Match | Op::NotMatch => {
                let (s, pat) = match (subject, &b.value) {
                    (Value::Str(s), Value::Str(p)) => (s.as_str(), p.as_str()),
                    _ => {
                        return Err(Rc::new(Bottom::eval(format!(
                            "cannot match {} against {}",
                            subject, b.value
                        ))))
                    }
                };
                let re = self.compile_regex(pat)?;
                let m = re.is_match(s);
                let ok = if b.op == Op::Match { m } else { !m };
                if ok {
                    Ok(())
                } else {
                    Err(Rc::new(Bottom::eval(format!(
                        "invalid value {} (does not match {}{})",
                        subject, b.op, b.value
                    ))))
                }
            }
            _ => match point_satisfies(subject, b) {
                Some(true) => Ok(()),
                Some(false) => Err(Rc::new(Bottom::eval(format!(
                    "invalid value {} (out of bound {}{})",
                    subject, b.op, b.value
                )))),
                None => Err(Rc::new(Bottom::eval(format!(
                    "cannot check {} against {}{}",
                    subject, b.op, b.value
                )))),
            },
        }
    }

    /// Unary operations.
    pub fn unary_op(&mut self, pos: u32, op: UnaryOp, v: Value) -> Value {
        if v.is_bottom() {
            return v;
        }
        if !v.is_concrete() {
            return Value::bottom(
                Bottom::incomplete(format!("non-concrete value {} in operand to {}", v, op))
                    .with_pos(pos),
            );
        }
        match (op, &v) {
            (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
            (UnaryOp::Negate, Value::Num(n)) => Value::Num(n.neg()),
            (UnaryOp::Plus, Value::Num(_)) => v,
            _ => Value::bottom(
                Bottom::eval(format!("invalid operation {}{}", op, v)).with_pos(pos),
            ),
        }
    }
}
