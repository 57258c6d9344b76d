//! Expression builders and a small harness for tests.
//!
//! These construct the compiled IR the upstream compiler would emit, so
//! suites can state inputs declaratively. Positions are threaded from a
//! per-call counter so combined errors deduplicate realistically.

use std::cell::Cell;
use std::rc::Rc;

use strata_core::feature::Feature;
use strata_core::kind::Kind;

use crate::context::OpContext;
use crate::expr::{
    Clause, ComprehensionExpr, Decl, DisjunctAlt, DisjunctionExpr, Expr, ExprRef, ListLit,
    StructLit,
};
use crate::sched::{RunMode, ALL_KNOWN};
use crate::value::{Op, UnaryOp, Value};
use crate::vertex::{ArcType, CloseInfo, Conjunct, Environment, VertexId};

thread_local! {
    static NEXT_POS: Cell<u32> = const { Cell::new(1) };
}

fn pos() -> u32 {
    NEXT_POS.with(|p| {
        let v = p.get();
        p.set(v + 1);
        v
    })
}

// ── Leaf expressions ────────────────────────────────────────────────

pub fn val(v: Value) -> ExprRef {
    Rc::new(Expr::Value(v))
}

pub fn int(i: i64) -> ExprRef {
    val(Value::int(i))
}

pub fn float(f: f64) -> ExprRef {
    val(Value::float(f))
}

pub fn str_(s: &str) -> ExprRef {
    val(Value::string(s))
}

pub fn bool_(b: bool) -> ExprRef {
    val(Value::Bool(b))
}

pub fn top() -> ExprRef {
    val(Value::Top)
}

pub fn basic(k: Kind) -> ExprRef {
    val(Value::BasicType(k))
}

// ── Compound expressions ────────────────────────────────────────────

pub fn bound(op: Op, e: ExprRef) -> ExprRef {
    Rc::new(Expr::Bound { op, expr: e, pos: pos() })
}

pub fn bound_int(op: Op, i: i64) -> ExprRef {
    bound(op, int(i))
}

pub fn binary(op: Op, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    Rc::new(Expr::Binary {
        op,
        lhs,
        rhs,
        pos: pos(),
    })
}

pub fn unary(op: UnaryOp, e: ExprRef) -> ExprRef {
    Rc::new(Expr::Unary { op, expr: e, pos: pos() })
}

pub fn field_ref(up: u16, label: Feature) -> ExprRef {
    Rc::new(Expr::FieldRef {
        up,
        label,
        pos: pos(),
    })
}

pub fn var(name: u32) -> ExprRef {
    Rc::new(Expr::Var { name, pos: pos() })
}

pub fn selector(source: ExprRef, sel: Feature) -> ExprRef {
    Rc::new(Expr::Selector {
        source,
        sel,
        pos: pos(),
    })
}

pub fn struct_lit(decls: Vec<Decl>) -> ExprRef {
    Rc::new(Expr::Struct(Rc::new(StructLit { decls, pos: pos() })))
}

pub fn list(elems: Vec<ExprRef>, open: bool) -> ExprRef {
    Rc::new(Expr::List(Rc::new(ListLit {
        elems,
        open,
        pos: pos(),
    })))
}

pub fn disj(alts: Vec<(ExprRef, bool)>) -> ExprRef {
    Rc::new(Expr::Disjunction(Rc::new(DisjunctionExpr {
        alternatives: alts
            .into_iter()
            .map(|(expr, default)| DisjunctAlt { expr, default })
            .collect(),
        pos: pos(),
    })))
}

pub fn comprehension(clauses: Vec<Clause>, body: Vec<Decl>) -> ExprRef {
    Rc::new(Expr::Comprehension(Rc::new(ComprehensionExpr {
        clauses,
        body: Rc::new(StructLit {
            decls: body,
            pos: pos(),
        }),
        pos: pos(),
    })))
}

pub fn for_clause(key: Option<u32>, value: u32, source: ExprRef) -> Clause {
    Clause::For {
        key,
        value,
        source,
        pos: pos(),
    }
}

// ── Declarations ────────────────────────────────────────────────────

pub fn field(label: Feature, value: ExprRef) -> Decl {
    Decl::Field {
        label,
        value,
        arc_type: ArcType::Member,
    }
}

pub fn optional(label: Feature, value: ExprRef) -> Decl {
    Decl::Field {
        label,
        value,
        arc_type: ArcType::Optional,
    }
}

pub fn required(label: Feature, value: ExprRef) -> Decl {
    Decl::Field {
        label,
        value,
        arc_type: ArcType::Required,
    }
}

pub fn dynamic(label: ExprRef, value: ExprRef) -> Decl {
    Decl::DynamicField { label, value }
}

pub fn pattern(p: ExprRef, value: ExprRef) -> Decl {
    Decl::Pattern { pattern: p, value }
}

pub fn ellipsis() -> Decl {
    Decl::Ellipsis { value: None }
}

pub fn embed(e: ExprRef) -> Decl {
    Decl::Embed { expr: e }
}

// ── Harness ─────────────────────────────────────────────────────────

/// Evaluate a root struct to completion.
pub fn eval_root(ctx: &mut OpContext, decls: Vec<Decl>) -> VertexId {
    let label = ctx.runtime.hidden_label("_root");
    let root = ctx.new_vertex(label, None);
    let env = Environment::root(root);
    let ci = CloseInfo::root(ctx);
    ctx.add_conjunct(root, Conjunct::new(env, struct_lit(decls), ci));
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
    root
}

/// Add one conjunct to a fresh root and finalize it.
pub fn eval_conjuncts(ctx: &mut OpContext, exprs: Vec<ExprRef>) -> VertexId {
    let label = ctx.runtime.hidden_label("_root");
    let root = ctx.new_vertex(label, None);
    let env = Environment::root(root);
    for e in exprs {
        let ci = CloseInfo::root(ctx);
        ctx.add_conjunct(root, Conjunct::new(env.clone(), e, ci));
    }
    ctx.unify(root, ALL_KNOWN, RunMode::Finalize);
    root
}

/// The finalized base value of a named field.
pub fn field_value(ctx: &OpContext, v: VertexId, name: &str) -> Option<Value> {
    let label = lookup_label(ctx, name)?;
    let arc = ctx.lookup_arc(v, label)?;
    ctx.vertex(arc).base_value.clone()
}

fn lookup_label(ctx: &OpContext, name: &str) -> Option<Feature> {
    // The runtime interner is append-only; a present name has a stable
    // index we can rebuild the label from.
    let table = ctx.runtime.strings();
    for i in 1..=table.len() as u32 {
        if table.resolve(i) == Some(name) {
            return Feature::make(i, strata_core::feature::FeatureType::StringLabel).ok();
        }
    }
    None
}
