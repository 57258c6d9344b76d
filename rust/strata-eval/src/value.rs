//! Lattice values.
//!
//! A value is either a concrete scalar, a composite marker (the arcs of
//! a struct or list live on its vertex), a type or constraint, or one of
//! the lattice connectives (conjunction, disjunction, bottom). The
//! `Concreteness` projection orders values from "already an error" to
//! "accepts anything"; tasks that need a computable operand require
//! `Concrete`.

use std::fmt;
use std::rc::Rc;
use strum_macros::Display;

use strata_core::kind::Kind;
use strata_core::num::Num;

use crate::builtins::{Builtin, ValidatorCall};
use crate::errors::Bottom;
use crate::vertex::VertexId;

// ── Operators ───────────────────────────────────────────────────────

/// Binary operators of the evaluation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Op {
    #[strum(serialize = "&")]
    And,
    #[strum(serialize = "|")]
    Or,
    #[strum(serialize = "==")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = "<=")]
    LessEqual,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "=~")]
    Match,
    #[strum(serialize = "!~")]
    NotMatch,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Subtract,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "div")]
    IntDivide,
    #[strum(serialize = "mod")]
    IntModulo,
    #[strum(serialize = "quo")]
    IntQuotient,
    #[strum(serialize = "rem")]
    IntRemainder,
}

impl Op {
    /// Operators that may head a bound value.
    pub fn is_bound_op(self) -> bool {
        matches!(
            self,
            Op::Equal
                | Op::NotEqual
                | Op::Less
                | Op::LessEqual
                | Op::Greater
                | Op::GreaterEqual
                | Op::Match
                | Op::NotMatch
        )
    }

    /// For ordered bounds: true if the bound constrains from below.
    pub fn is_lower_bound(self) -> bool {
        matches!(self, Op::Greater | Op::GreaterEqual)
    }

    pub fn is_upper_bound(self) -> bool {
        matches!(self, Op::Less | Op::LessEqual)
    }

    /// Strict comparison (excludes the endpoint).
    pub fn is_strict(self) -> bool {
        matches!(self, Op::Less | Op::Greater)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UnaryOp {
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Negate,
    #[strum(serialize = "!")]
    Not,
}

// ── Concreteness ────────────────────────────────────────────────────

/// How far a value is from being a concrete datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Concreteness {
    /// An error.
    BottomLevel,
    /// A concrete datum.
    Concrete,
    /// A type (kind bound).
    Type,
    /// A constraint such as a bound or validator.
    Constraint,
    /// Top: accepts anything.
    Any,
}

// ── Values ──────────────────────────────────────────────────────────

/// A bound constraint: `op` applied to a concrete right-hand side.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    pub op: Op,
    pub value: Value,
}

/// An evaluated disjunction. Defaults are kept first; `num_defaults`
/// counts them.
#[derive(Debug, Clone, PartialEq)]
pub struct DisjunctionValue {
    pub values: Vec<Value>,
    pub num_defaults: usize,
}

/// Runtime values of the unification lattice.
///
/// Composite payloads are `Rc`-wrapped: cloning a value is cheap and
/// finalized sub-structures are shared, never copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Top,
    Null,
    Bool(bool),
    Num(Num),
    Str(Rc<String>),
    Bytes(Rc<Vec<u8>>),
    /// A list value; elements are the integer-labeled arcs of a vertex.
    ListMarker,
    /// A struct value; fields are the arcs of a vertex.
    StructMarker,
    /// A kind bound, e.g. `int` or `string`.
    BasicType(Kind),
    Bound(Rc<BoundValue>),
    Conjunction(Rc<Vec<Value>>),
    Disjunction(Rc<DisjunctionValue>),
    Builtin(Rc<Builtin>),
    Validator(Rc<ValidatorCall>),
    /// An already-evaluated sub-tree, by identity.
    Vertex(VertexId),
    Bottom(Rc<Bottom>),
}

impl Value {
    pub fn int(i: i64) -> Value {
        Value::Num(Num::int_i64(i))
    }

    pub fn float(f: f64) -> Value {
        match Num::float_f64(f) {
            Ok(n) => Value::Num(n),
            Err(e) => Value::Bottom(Rc::new(Bottom::eval(e.to_string()))),
        }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(Rc::new(b))
    }

    pub fn bottom(b: Bottom) -> Value {
        Value::Bottom(Rc::new(b))
    }

    pub fn bound(op: Op, value: Value) -> Value {
        debug_assert!(op.is_bound_op());
        Value::Bound(Rc::new(BoundValue { op, value }))
    }

    pub fn disjunction(values: Vec<Value>, num_defaults: usize) -> Value {
        Value::Disjunction(Rc::new(DisjunctionValue {
            values,
            num_defaults,
        }))
    }

    /// The kind bitset this value inhabits. `Vertex` is opaque here;
    /// use the context-aware kind where vertices must be resolved.
    pub fn kind(&self) -> Kind {
        match self {
            Value::Top => Kind::TOP,
            Value::Null => Kind::NULL,
            Value::Bool(_) => Kind::BOOL,
            Value::Num(n) => n.kind(),
            Value::Str(_) => Kind::STRING,
            Value::Bytes(_) => Kind::BYTES,
            Value::ListMarker => Kind::LIST,
            Value::StructMarker => Kind::STRUCT,
            Value::BasicType(k) => *k,
            Value::Bound(b) => match b.op {
                // != and !~ exclude a point; the kind is unrestricted.
                Op::NotEqual | Op::NotMatch => Kind::TOP,
                Op::Match => Kind::STRING,
                _ => b.value.kind(),
            },
            Value::Conjunction(vs) => vs
                .iter()
                .fold(Kind::TOP, |acc, v| acc.meet(v.kind())),
            Value::Disjunction(d) => d
                .values
                .iter()
                .fold(Kind::BOTTOM, |acc, v| acc.join(v.kind())),
            Value::Builtin(_) | Value::Validator(_) => Kind::TOP,
            Value::Vertex(_) => Kind::TOP,
            Value::Bottom(_) => Kind::BOTTOM,
        }
    }

    pub fn concreteness(&self) -> Concreteness {
        match self {
            Value::Bottom(_) => Concreteness::BottomLevel,
            Value::Null
            | Value::Bool(_)
            | Value::Num(_)
            | Value::Str(_)
            | Value::Bytes(_)
            | Value::ListMarker
            | Value::StructMarker
            | Value::Builtin(_)
            | Value::Vertex(_) => Concreteness::Concrete,
            Value::BasicType(_) => Concreteness::Type,
            Value::Bound(_) | Value::Validator(_) | Value::Conjunction(_) => {
                Concreteness::Constraint
            }
            Value::Disjunction(_) => Concreteness::Constraint,
            Value::Top => Concreteness::Any,
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.concreteness() <= Concreteness::Concrete
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Value::Bottom(_))
    }

    pub fn as_bottom(&self) -> Option<&Rc<Bottom>> {
        match self {
            Value::Bottom(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<&Num> {
        match self {
            Value::Num(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Resolve a disjunction with exactly one default to that default.
    pub fn default(&self) -> Value {
        match self {
            Value::Disjunction(d) if d.num_defaults == 1 => d.values[0].clone(),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Top => write!(f, "_"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::ListMarker => write!(f, "[...]"),
            Value::StructMarker => write!(f, "{{...}}"),
            Value::BasicType(k) => write!(f, "{}", k),
            Value::Bound(b) => write!(f, "{}{}", b.op, b.value),
            Value::Conjunction(vs) => {
                let parts: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(" & "))
            }
            Value::Disjunction(d) => {
                let parts: Vec<String> = d
                    .values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        if i < d.num_defaults {
                            format!("*{}", v)
                        } else {
                            v.to_string()
                        }
                    })
                    .collect();
                write!(f, "{}", parts.join(" | "))
            }
            Value::Builtin(b) => write!(f, "{}", b.name),
            Value::Validator(v) => write!(f, "{}(...)", v.builtin.name),
            Value::Vertex(id) => write!(f, "<vertex {}>", id.0),
            Value::Bottom(b) => write!(f, "_|_ // {}", b.err),
        }
    }
}
