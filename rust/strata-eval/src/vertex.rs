//! Vertices: the evaluation nodes.
//!
//! A vertex owns its child arcs and the conjuncts contributed to it.
//! Cross-vertex references outside the parent/child spine are ids and
//! never extend a vertex's lifetime. The evaluation-state record is
//! allocated on first scheduling and dropped at finalize.

use std::rc::Rc;

use log::trace;

use strata_core::feature::Feature;
use strata_core::kind::Kind;

use crate::closectx::{CcId, DepKind};
use crate::context::OpContext;
use crate::disjunct::{DefaultMode, PendingDisjunction};
use crate::errors::Bottom;
use crate::expr::ExprRef;
use crate::reqsets::{ConjunctFlags, DefId, ReqSets};
use crate::sched::{Scheduler, TaskId, FIELD_SET_KNOWN};
use crate::value::Value;

/// Index of a vertex in the operation-context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub u32);

/// How a child arc relates to its parent. Unifying two modes picks the
/// tighter (more present) of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArcType {
    /// A regular, present field.
    Member,
    /// Declared with `!`: must be made concrete by the user.
    Required,
    /// Declared with `?`: a constraint on the field if it is added.
    Optional,
    /// Reserved by a comprehension; not yet known to exist.
    Pending,
    /// Proven absent.
    NotPresent,
}

impl ArcType {
    pub fn meet(self, other: ArcType) -> ArcType {
        self.min(other)
    }
}

/// Evaluation lifecycle of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStatus {
    Unprocessed,
    Evaluating,
    Finalized,
}

// ── Environments ────────────────────────────────────────────────────

/// A lexical scope chain. Field references count environments upward;
/// comprehension bindings extend an environment without adding a level.
#[derive(Debug)]
pub struct Environment {
    pub up: Option<Rc<Environment>>,
    pub vertex: VertexId,
    pub bindings: Vec<(u32, Value)>,
}

impl Environment {
    pub fn root(vertex: VertexId) -> Rc<Environment> {
        Rc::new(Environment {
            up: None,
            vertex,
            bindings: Vec::new(),
        })
    }

    /// Enter the scope of `vertex` below `up`.
    pub fn push(up: &Rc<Environment>, vertex: VertexId) -> Rc<Environment> {
        Rc::new(Environment {
            up: Some(up.clone()),
            vertex,
            bindings: Vec::new(),
        })
    }

    /// Same scope level with one more binding.
    pub fn with_binding(env: &Rc<Environment>, name: u32, value: Value) -> Rc<Environment> {
        Rc::new(Environment {
            up: env.up.clone(),
            vertex: env.vertex,
            bindings: {
                let mut b = env.bindings.clone();
                b.push((name, value));
                b
            },
        })
    }

    /// Walk `up` levels.
    pub fn at(&self, up: u16) -> &Environment {
        let mut cur = self;
        for _ in 0..up {
            cur = cur
                .up
                .as_deref()
                .expect("environment chain shorter than reference");
        }
        cur
    }

    /// Resolve a comprehension or let binding.
    pub fn lookup(&self, name: u32) -> Option<&Value> {
        for (n, v) in self.bindings.iter().rev() {
            if *n == name {
                return Some(v);
            }
        }
        self.up.as_deref().and_then(|e| e.lookup(name))
    }
}

// ── Close info ──────────────────────────────────────────────────────

/// Closedness bookkeeping carried by every conjunct. A conjunct created
/// from another inherits the close info, mutated only by the spawn
/// operations below.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub def_id: DefId,
    /// The id of the conjunct this one was spawned from.
    pub outer_id: DefId,
    /// The id of the innermost enclosing embedding, if any.
    pub enclosing_embed: DefId,
    pub from_def: bool,
    pub from_embed: bool,
    pub is_closed: bool,
    /// Closedness that does not descend into child arcs.
    pub once: bool,
    /// Governing close context, if one is tracked.
    pub cc: Option<CcId>,
}

impl CloseInfo {
    /// Close info for a top-level conjunct.
    pub fn root(ctx: &mut OpContext) -> CloseInfo {
        CloseInfo {
            def_id: ctx.new_def_id(),
            outer_id: DefId::NONE,
            enclosing_embed: DefId::NONE,
            from_def: false,
            from_embed: false,
            is_closed: false,
            once: false,
            cc: None,
        }
    }

    /// Enter a definition (`#foo`): a fresh, recursively closed schema.
    pub fn spawn_def(&self, ctx: &mut OpContext) -> CloseInfo {
        let def_id = ctx.new_def_id();
        let cc = self.cc.map(|p| ctx.spawn_cc(p, true, false, true));
        CloseInfo {
            def_id,
            outer_id: self.def_id,
            enclosing_embed: self.enclosing_embed,
            from_def: true,
            from_embed: false,
            is_closed: true,
            once: false,
            cc,
        }
    }

    /// Enter an embedding: contributions flow into the host struct.
    pub fn spawn_embed(&self, ctx: &mut OpContext) -> CloseInfo {
        let embed_id = ctx.new_def_id();
        let cc = self.cc.map(|p| ctx.spawn_cc(p, false, true, false));
        CloseInfo {
            def_id: embed_id,
            outer_id: self.def_id,
            enclosing_embed: embed_id,
            from_def: self.from_def,
            from_embed: true,
            is_closed: false,
            once: false,
            cc,
        }
    }

    /// Follow a reference: a fresh schema invocation that keeps the
    /// closedness of the referenced value.
    pub fn spawn_ref(&self, ctx: &mut OpContext, closed: bool) -> CloseInfo {
        let def_id = ctx.new_def_id();
        let cc = self.cc.map(|p| ctx.spawn_cc(p, closed, false, closed));
        CloseInfo {
            def_id,
            outer_id: self.def_id,
            enclosing_embed: self.enclosing_embed,
            from_def: self.from_def || closed,
            from_embed: false,
            is_closed: self.is_closed || closed,
            once: false,
            cc,
        }
    }

    /// Enter a comprehension body; identity is preserved.
    pub fn spawn_comprehension(&self, _ctx: &mut OpContext) -> CloseInfo {
        self.clone()
    }

    /// Non-recursive closing (`close(...)`); the requirement does not
    /// descend into child arcs.
    pub fn close_once(&self, ctx: &mut OpContext) -> CloseInfo {
        let mut ci = self.clone();
        ci.def_id = ctx.new_def_id();
        ci.outer_id = self.def_id;
        ci.is_closed = true;
        ci.once = true;
        ci
    }
}

// ── Conjuncts ───────────────────────────────────────────────────────

/// A single contribution to a vertex: an expression in an environment,
/// plus closedness bookkeeping.
#[derive(Debug, Clone)]
pub struct Conjunct {
    pub env: Rc<Environment>,
    pub expr: ExprRef,
    pub ci: CloseInfo,
}

impl Conjunct {
    pub fn new(env: Rc<Environment>, expr: ExprRef, ci: CloseInfo) -> Conjunct {
        Conjunct { env, expr, ci }
    }

    /// Identity: same environment, same expression node, same close
    /// context.
    pub fn same(&self, other: &Conjunct) -> bool {
        Rc::ptr_eq(&self.env, &other.env)
            && Rc::ptr_eq(&self.expr, &other.expr)
            && self.ci.cc == other.ci.cc
    }
}

/// A `[pattern]: value` constraint stored on a vertex and re-applied to
/// every matching arc.
#[derive(Debug, Clone)]
pub struct PatternConstraint {
    pub pattern: Value,
    pub value: ExprRef,
    pub env: Rc<Environment>,
    pub ci: CloseInfo,
}

// ── Node state ──────────────────────────────────────────────────────

/// Evaluation state of a vertex; allocated on first scheduling and
/// dropped at finalize.
#[derive(Debug, Default)]
pub struct NodeState {
    pub scheduler: Scheduler,
    /// Kind accumulated by the meet of all conjuncts.
    pub kind: Kind,
    pub scalar: Option<Value>,
    /// Bounds and validators awaiting application at finalize.
    pub checks: Vec<Value>,
    pub errs: Option<Rc<Bottom>>,
    /// Cycle errors; suppressed if a non-cycle conjunct produced a value.
    pub cycle_errs: Vec<Rc<Bottom>>,
    pub has_ellipsis: bool,
    pub has_top: bool,
    pub disjunctions: Vec<PendingDisjunction>,
    pub disjunct_task: Option<TaskId>,
    /// The evaluated disjunction value, if alternatives remain.
    pub disjunct_value: Option<Value>,
    pub default_mode: DefaultMode,
    pub cc_root: Option<CcId>,
}

impl NodeState {
    pub fn new() -> NodeState {
        NodeState {
            kind: Kind::TOP,
            ..NodeState::default()
        }
    }
}

// ── Vertex ──────────────────────────────────────────────────────────

/// The unit of evaluation.
#[derive(Debug)]
pub struct Vertex {
    pub label: Feature,
    pub parent: Option<VertexId>,
    /// Child arcs in insertion order; exclusively owned.
    pub arcs: Vec<VertexId>,
    pub conjuncts: Vec<Conjunct>,
    pub base_value: Option<Value>,
    pub arc_type: ArcType,
    pub status: VertexStatus,

    pub closed_recursive: bool,
    pub closed_non_recursive: bool,
    pub is_shared: bool,
    pub is_disjunct: bool,

    pub pattern_constraints: Vec<PatternConstraint>,
    /// Evidence flags per contributing conjunct; append-only.
    pub conjunct_info: Vec<ConjunctFlags>,
    pub req_sets: ReqSets,

    /// Combined errors of child arcs, for ancestor reporting.
    pub child_error: Option<Rc<Bottom>>,

    pub state: Option<Box<NodeState>>,
}

impl Vertex {
    fn new(label: Feature, parent: Option<VertexId>) -> Vertex {
        Vertex {
            label,
            parent,
            arcs: Vec::new(),
            conjuncts: Vec::new(),
            base_value: None,
            arc_type: ArcType::Member,
            status: VertexStatus::Unprocessed,
            closed_recursive: false,
            closed_non_recursive: false,
            is_shared: false,
            is_disjunct: false,
            pattern_constraints: Vec::new(),
            conjunct_info: Vec::new(),
            req_sets: ReqSets::new(),
            child_error: None,
            state: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status == VertexStatus::Finalized
    }

    /// The final scalar of this vertex, if it has one.
    pub fn scalar(&self) -> Option<&Value> {
        match &self.base_value {
            Some(v) if v.is_concrete() && !matches!(v, Value::StructMarker | Value::ListMarker) => {
                Some(v)
            }
            _ => None,
        }
    }
}

// ── Store operations ────────────────────────────────────────────────

impl OpContext {
    pub fn new_vertex(&mut self, label: Feature, parent: Option<VertexId>) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(Vertex::new(label, parent));
        id
    }

    pub fn lookup_arc(&self, v: VertexId, f: Feature) -> Option<VertexId> {
        self.vertex(v)
            .arcs
            .iter()
            .copied()
            .find(|&a| self.vertex(a).label == f)
    }

    /// Locate or create the child arc `f`, raising the arc type of an
    /// existing arc to the tighter of the two modes. Creating a new arc
    /// fails once the field set is frozen.
    pub fn get_arc(
        &mut self,
        v: VertexId,
        f: Feature,
        mode: ArcType,
    ) -> Result<VertexId, Rc<Bottom>> {
        if let Some(arc) = self.lookup_arc(v, f) {
            let at = self.vertex(arc).arc_type.meet(mode);
            self.vertex_mut(arc).arc_type = at;
            return Ok(arc);
        }
        if let Some(state) = &self.vertex(v).state {
            if state.scheduler.frozen & FIELD_SET_KNOWN != 0 {
                return Err(Rc::new(
                    Bottom::eval(format!(
                        "adding field {}: field not allowed by earlier comprehension or reference cycle",
                        self.label_str(f)
                    ))
                    .at(v),
                ));
            }
        }
        let arc = self.new_vertex(f, Some(v));
        self.vertex_mut(arc).arc_type = mode;
        self.vertex_mut(v).arcs.push(arc);
        trace!("vertex {:?}: new arc {:?} ({:?})", v, arc, mode);

        // Pattern constraints match new arcs in arc-insertion order.
        let matching: Vec<PatternConstraint> = self
            .vertex(v)
            .pattern_constraints
            .iter()
            .filter(|pc| self.pattern_matches(&pc.pattern, f))
            .cloned()
            .collect();
        for pc in matching {
            self.add_conjunct(arc, Conjunct::new(pc.env.clone(), pc.value.clone(), pc.ci));
        }
        Ok(arc)
    }

    /// Append a conjunct unless an identical one is present. If the
    /// vertex is already scheduled, a task is inserted for it;
    /// otherwise an EVAL dependency keeps the close context alive until
    /// scheduling happens.
    pub fn add_conjunct(&mut self, v: VertexId, c: Conjunct) {
        if self.vertex(v).conjuncts.iter().any(|o| o.same(&c)) {
            return;
        }
        self.vertex_mut(v).conjuncts.push(c.clone());
        if self.vertex(v).state.is_some() {
            self.insert_conjunct_task(v, c);
        } else if let Some(cc) = c.ci.cc {
            if self.cc(cc).needs_close_in_schedule.is_none() && !self.cc(cc).is_done() {
                self.inc_dependent(cc, DepKind::Eval, v.0);
                self.cc_mut(cc).needs_close_in_schedule = Some(v.0);
            }
        }
    }

    /// Store a pattern constraint and re-insert its value at every
    /// existing matching arc.
    pub fn add_pattern_constraint(&mut self, v: VertexId, pc: PatternConstraint) {
        let exists = self.vertex(v).pattern_constraints.iter().any(|o| {
            Rc::ptr_eq(&o.value, &pc.value) && o.pattern == pc.pattern && Rc::ptr_eq(&o.env, &pc.env)
        });
        if exists {
            return;
        }
        if let Some(cc) = pc.ci.cc {
            self.cc_mut(cc).add_pattern(pc.pattern.clone());
        }
        self.vertex_mut(v).pattern_constraints.push(pc.clone());
        let arcs: Vec<(VertexId, Feature)> = self
            .vertex(v)
            .arcs
            .iter()
            .map(|&a| (a, self.vertex(a).label))
            .collect();
        for (arc, f) in arcs {
            if self.pattern_matches(&pc.pattern, f) {
                self.add_conjunct(arc, Conjunct::new(pc.env.clone(), pc.value.clone(), pc.ci.clone()));
            }
        }
    }

    /// Does a pattern value match a label?
    pub fn pattern_matches(&self, pattern: &Value, f: Feature) -> bool {
        match pattern {
            Value::Top => f.is_regular(),
            Value::BasicType(k) => {
                (k.contains(Kind::STRING) && f.is_string())
                    || (k.contains(Kind::INT) && f.is_int())
            }
            Value::Str(s) => {
                f.is_string()
                    && self
                        .runtime
                        .index_to_string(f.index())
                        .is_some_and(|n| n == s.as_str())
            }
            Value::Num(n) => {
                f.is_int()
                    && n.to_bigint()
                        .is_some_and(|i| i == num_bigint::BigInt::from(f.index()))
            }
            Value::Bound(b) => {
                let subject = if f.is_int() {
                    Value::int(f.index() as i64)
                } else if f.is_string() {
                    match self.runtime.index_to_string(f.index()) {
                        Some(s) => Value::string(s),
                        None => return false,
                    }
                } else {
                    return false;
                };
                crate::bounds::point_satisfies(&subject, b).unwrap_or(false)
            }
            Value::Disjunction(d) => d.values.iter().any(|p| self.pattern_matches(p, f)),
            Value::Conjunction(vs) => vs.iter().all(|p| self.pattern_matches(p, f)),
            _ => false,
        }
    }

    /// The typo-check query: would this vertex admit a field `f`?
    pub fn accept(&self, v: VertexId, f: Feature) -> bool {
        if f.allowed_in_closed() {
            return true;
        }
        let vx = self.vertex(v);
        let closed = vx.closed_recursive || vx.closed_non_recursive || !vx.req_sets.is_empty();
        if !closed {
            return true;
        }
        if vx.conjunct_info.iter().any(|c| c.is_open()) && vx.req_sets.is_empty() {
            return true;
        }
        if vx
            .pattern_constraints
            .iter()
            .any(|pc| self.pattern_matches(&pc.pattern, f))
        {
            return true;
        }
        let evidence: Vec<DefId> = match self.lookup_arc(v, f) {
            Some(arc) => self
                .vertex(arc)
                .conjuncts
                .iter()
                .map(|c| c.ci.def_id)
                .filter(|id| !id.is_none())
                .collect(),
            None => Vec::new(),
        };
        if vx.req_sets.is_empty() {
            // Closed without requirement groups: only declared fields
            // and patterns are admitted.
            return !evidence.is_empty();
        }
        vx.req_sets
            .unsatisfied(&evidence, &vx.conjunct_info)
            .is_none()
    }

    pub(crate) fn label_str(&self, f: Feature) -> String {
        f.display(self.runtime.strings()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    #[test]
    fn arc_type_meet_prefers_presence() {
        assert_eq!(ArcType::Member.meet(ArcType::Optional), ArcType::Member);
        assert_eq!(ArcType::Pending.meet(ArcType::Required), ArcType::Required);
        assert_eq!(
            ArcType::NotPresent.meet(ArcType::Pending),
            ArcType::Pending
        );
    }

    #[test]
    fn environment_walks_and_binds() {
        let e0 = Environment::root(VertexId(0));
        let e1 = Environment::push(&e0, VertexId(1));
        assert_eq!(e1.at(1).vertex, VertexId(0));
        let e2 = Environment::with_binding(&e1, 42, Value::int(5));
        // Binding does not add a scope level.
        assert_eq!(e2.at(1).vertex, VertexId(0));
        assert_eq!(e2.lookup(42), Some(&Value::int(5)));
        assert_eq!(e2.lookup(43), None);
    }

    #[test]
    fn conjunct_identity() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(Feature::int(0).unwrap(), None);
        let env = Environment::root(v);
        let e: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let ci = CloseInfo::root(&mut ctx);
        let c1 = Conjunct::new(env.clone(), e.clone(), ci.clone());
        let c2 = Conjunct::new(env.clone(), e.clone(), ci.clone());
        assert!(c1.same(&c2));
        let other: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let c3 = Conjunct::new(env, other, ci);
        assert!(!c1.same(&c3));
    }

    #[test]
    fn add_conjunct_deduplicates() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(Feature::int(0).unwrap(), None);
        let env = Environment::root(v);
        let e: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let ci = CloseInfo::root(&mut ctx);
        ctx.add_conjunct(v, Conjunct::new(env.clone(), e.clone(), ci.clone()));
        ctx.add_conjunct(v, Conjunct::new(env, e, ci));
        assert_eq!(ctx.vertex(v).conjuncts.len(), 1);
    }

    #[test]
    fn get_arc_raises_arc_type() {
        let mut ctx = OpContext::new();
        let root = ctx.new_vertex(Feature::int(0).unwrap(), None);
        let f = ctx.runtime.str_label("a");
        let a1 = ctx.get_arc(root, f, ArcType::Optional).unwrap();
        let a2 = ctx.get_arc(root, f, ArcType::Member).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(ctx.vertex(a1).arc_type, ArcType::Member);
    }
}
