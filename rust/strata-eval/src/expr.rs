//! Compiled expression IR.
//!
//! These are the nodes the upstream compiler emits; the evaluator never
//! parses text. Expressions are shared through `Rc` and compared by
//! pointer identity — two conjuncts carrying the same `Rc<Expr>` in the
//! same environment are the same contribution.
//!
//! Position tokens (`pos`) are opaque u32s used only to deduplicate
//! combined errors; 0 means "no position".

use std::rc::Rc;

use strata_core::feature::Feature;

use crate::builtins::Builtin;
use crate::value::{Op, UnaryOp, Value};
use crate::vertex::ArcType;

pub type ExprRef = Rc<Expr>;

/// An expression node.
#[derive(Debug)]
pub enum Expr {
    /// A precompiled value: literals, basic types, bottom.
    Value(Value),
    Struct(Rc<StructLit>),
    List(Rc<ListLit>),
    /// Reference to the field `label` of the scope `up` environments up.
    FieldRef { up: u16, label: Feature, pos: u32 },
    /// Reference to a comprehension or let binding by interned name.
    Var { name: u32, pos: u32 },
    /// `source.sel`
    Selector {
        source: ExprRef,
        sel: Feature,
        pos: u32,
    },
    /// `source[index]`
    Index {
        source: ExprRef,
        index: ExprRef,
        pos: u32,
    },
    Unary {
        op: UnaryOp,
        expr: ExprRef,
        pos: u32,
    },
    Binary {
        op: Op,
        lhs: ExprRef,
        rhs: ExprRef,
        pos: u32,
    },
    /// A bound whose endpoint is still an expression, e.g. `>= x`.
    Bound { op: Op, expr: ExprRef, pos: u32 },
    Disjunction(Rc<DisjunctionExpr>),
    Comprehension(Rc<ComprehensionExpr>),
    Call {
        builtin: Rc<Builtin>,
        args: Vec<ExprRef>,
        pos: u32,
    },
}

impl Expr {
    pub fn pos(&self) -> u32 {
        match self {
            Expr::Value(_) => 0,
            Expr::Struct(s) => s.pos,
            Expr::List(l) => l.pos,
            Expr::FieldRef { pos, .. }
            | Expr::Var { pos, .. }
            | Expr::Selector { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Binary { pos, .. }
            | Expr::Bound { pos, .. }
            | Expr::Call { pos, .. } => *pos,
            Expr::Disjunction(d) => d.pos,
            Expr::Comprehension(c) => c.pos,
        }
    }
}

/// A struct literal: an ordered list of declarations.
#[derive(Debug)]
pub struct StructLit {
    pub decls: Vec<Decl>,
    pub pos: u32,
}

/// A declaration inside a struct literal.
#[derive(Debug)]
pub enum Decl {
    /// A fixed field. `arc_type` distinguishes regular, required (`!`)
    /// and optional (`?`) fields.
    Field {
        label: Feature,
        value: ExprRef,
        arc_type: ArcType,
    },
    /// `(expr): value` — the label is computed at evaluation time.
    DynamicField { label: ExprRef, value: ExprRef },
    /// `[pattern]: value` — applies to every matching field.
    Pattern { pattern: ExprRef, value: ExprRef },
    /// `...` or `...expr`; opens the struct.
    Ellipsis { value: Option<ExprRef> },
    /// An embedded expression contributing to the struct itself.
    Embed { expr: ExprRef },
    /// A let binding scoped to the struct.
    LetField { label: Feature, expr: ExprRef },
}

/// A list literal. Elements become integer-labeled arcs.
#[derive(Debug)]
pub struct ListLit {
    pub elems: Vec<ExprRef>,
    /// True if the list is open (`[1, 2, ...]`).
    pub open: bool,
    pub pos: u32,
}

/// An explicit alternation.
#[derive(Debug)]
pub struct DisjunctionExpr {
    pub alternatives: Vec<DisjunctAlt>,
    pub pos: u32,
}

/// One alternative; `default` records a `*` mark.
#[derive(Debug)]
pub struct DisjunctAlt {
    pub expr: ExprRef,
    pub default: bool,
}

impl DisjunctionExpr {
    pub fn has_defaults(&self) -> bool {
        self.alternatives.iter().any(|a| a.default)
    }
}

/// A for/if/let comprehension with a struct-literal body.
#[derive(Debug)]
pub struct ComprehensionExpr {
    pub clauses: Vec<Clause>,
    pub body: Rc<StructLit>,
    pub pos: u32,
}

/// One comprehension clause.
#[derive(Debug)]
pub enum Clause {
    /// `for key, value in source`. `key` may be omitted.
    For {
        key: Option<u32>,
        value: u32,
        source: ExprRef,
        pos: u32,
    },
    If { cond: ExprRef },
    Let { name: u32, expr: ExprRef },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_pointer_identity() {
        let a: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let b: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        assert!(Rc::ptr_eq(&a, &a.clone()));
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn positions_default_to_zero() {
        let v = Expr::Value(Value::Top);
        assert_eq!(v.pos(), 0);
        let r = Expr::FieldRef {
            up: 0,
            label: Feature::int(0).unwrap(),
            pos: 42,
        };
        assert_eq!(r.pos(), 42);
    }
}
