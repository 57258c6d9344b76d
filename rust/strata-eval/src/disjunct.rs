//! The disjunction engine.
//!
//! Disjunctions registered during scheduling are expanded by a single
//! task per vertex: a cross product over the registered disjunctions,
//! where each alternative is inserted into an *overlay clone* of the
//! current evaluation state and run in isolation. Failed alternatives
//! record their errors; surviving overlays are pruned by structural
//! equivalence. Defaults follow the three-valued default-mode
//! arithmetic with a saturating-max join.

use std::rc::Rc;

use log::{debug, trace};

use crate::closectx::{CcId, DepKind};
use crate::context::OpContext;
use crate::errors::{compound, Bottom};
use crate::expr::{DisjunctionExpr, Expr, ExprRef};
use crate::sched::{
    RunMode, TaskId, TaskKind, ALL_KNOWN, FIELD_CONJUNCTS_KNOWN, SCALAR_KNOWN, VALUE_KNOWN,
};
use crate::value::Value;
use crate::vertex::{CloseInfo, Conjunct, Environment, VertexId};

// ── Default-mode arithmetic ─────────────────────────────────────────

/// Whether a value is marked as a default choice. The join is a
/// saturating max under `Maybe < Is < Not`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DefaultMode {
    /// No disjunction was involved yet.
    #[default]
    Maybe,
    /// Marked `*v`.
    Is,
    /// An unmarked alternative of a disjunction that has marks.
    Not,
}

impl DefaultMode {
    pub fn combine(self, other: DefaultMode) -> DefaultMode {
        self.max(other)
    }
}

// ── Pending disjunctions ────────────────────────────────────────────

/// A disjunction registered on a vertex, awaiting cross-product
/// expansion.
#[derive(Debug, Clone)]
pub struct PendingDisjunction {
    /// `(expression, is_default)` per alternative.
    pub alts: Vec<(ExprRef, bool)>,
    pub env: Rc<Environment>,
    pub ci: CloseInfo,
    /// The hole close context reserved in the parent.
    pub hole: Option<CcId>,
    pub pos: u32,
}

impl PendingDisjunction {
    pub fn has_defaults(&self) -> bool {
        self.alts.iter().any(|(_, d)| *d)
    }
}

/// One surviving partial result of the cross product.
#[derive(Debug, Clone, Copy)]
struct DisjunctResult {
    vertex: VertexId,
    mode: DefaultMode,
}

impl OpContext {
    /// Register a syntactic disjunction on `v` and make sure the single
    /// expansion task is queued.
    pub(crate) fn register_disjunction(
        &mut self,
        v: VertexId,
        d: &Rc<DisjunctionExpr>,
        env: Rc<Environment>,
        ci: CloseInfo,
    ) {
        let hole = ci.cc.map(|p| {
            let h = self.spawn_cc(p, false, false, false);
            let hid = self.new_hole_id();
            self.cc_mut(h).hole_id = hid;
            h
        });
        let pd = PendingDisjunction {
            alts: d
                .alternatives
                .iter()
                .map(|a| (a.expr.clone(), a.default))
                .collect(),
            env,
            ci,
            hole,
            pos: d.pos,
        };
        self.push_disjunction(v, pd);
    }

    /// Register an already-evaluated disjunction value.
    pub(crate) fn register_value_disjunction(
        &mut self,
        v: VertexId,
        values: &[Value],
        num_defaults: usize,
        env: Rc<Environment>,
        ci: CloseInfo,
        pos: u32,
    ) {
        let pd = PendingDisjunction {
            alts: values
                .iter()
                .enumerate()
                .map(|(i, val)| {
                    let e: ExprRef = Rc::new(Expr::Value(val.clone()));
                    (e, i < num_defaults)
                })
                .collect(),
            env,
            ci,
            hole: None,
            pos,
        };
        self.push_disjunction(v, pd);
    }

    fn push_disjunction(&mut self, v: VertexId, pd: PendingDisjunction) {
        if let Some(hole) = pd.hole {
            self.inc_dependent(hole, DepKind::Disjunct, v.0);
        }
        self.node_mut(v).disjunctions.push(pd);
        let need_task = match self.node(v).disjunct_task {
            None => true,
            // A disjunction registered after the expansion ran needs a
            // fresh pass.
            Some(t) => matches!(
                self.task(t).state,
                crate::sched::TaskState::Success | crate::sched::TaskState::Failed
            ),
        };
        if need_task {
            let tid = self.insert_task(
                v,
                TaskKind::HandleDisjunctions,
                SCALAR_KNOWN | VALUE_KNOWN,
                FIELD_CONJUNCTS_KNOWN,
            );
            self.node_mut(v).disjunct_task = Some(tid);
        }
    }

    // ── Cross-product expansion ─────────────────────────────────────

    pub(crate) fn task_disjunctions(&mut self, tid: TaskId) -> Result<(), Rc<Bottom>> {
        let v = self.task(tid).vertex;
        let pds = std::mem::take(&mut self.node_mut(v).disjunctions);
        if pds.is_empty() {
            return Ok(());
        }
        debug!("vertex {:?}: expanding {} disjunction(s)", v, pds.len());

        let base = self.clone_overlay(v);
        let mut results = vec![DisjunctResult {
            vertex: base,
            mode: DefaultMode::Maybe,
        }];

        let nested = self.disjunct_depth > 0;
        let mut failure: Option<Rc<Bottom>> = None;
        for pd in &pds {
            let marked = pd.has_defaults();
            let mut next: Vec<DisjunctResult> = Vec::new();
            let mut errs: Vec<Rc<Bottom>> = Vec::new();
            for p in &results {
                for (alt, is_default) in &pd.alts {
                    let ov = self.clone_overlay(p.vertex);
                    let mut ci = pd.ci.clone();
                    ci.cc = pd.hole;
                    self.add_conjunct(ov, Conjunct::new(pd.env.clone(), alt.clone(), ci));

                    // A nested disjunction may not finalize: that would
                    // sever notifications that have not arrived yet.
                    self.disjunct_depth += 1;
                    let mode = if nested {
                        RunMode::AttemptOnly
                    } else {
                        RunMode::Finalize
                    };
                    self.unify(ov, ALL_KNOWN, mode);
                    self.disjunct_depth -= 1;

                    match self.overlay_error(ov) {
                        Some(b) => {
                            trace!("alternative {} failed: {}", alt.pos(), b);
                            // Closedness failures of probed alternatives
                            // do not warrant a report.
                            if !b.close_check {
                                errs.push(b);
                            }
                        }
                        None => {
                            let m = p.mode.combine(match (*is_default, marked) {
                                (true, _) => DefaultMode::Is,
                                (false, true) => DefaultMode::Not,
                                (false, false) => DefaultMode::Maybe,
                            });
                            if !next.iter().any(|q| self.equal_partial(q.vertex, ov)) {
                                next.push(DisjunctResult { vertex: ov, mode: m });
                            }
                        }
                    }
                }
            }
            if next.is_empty() {
                failure = Some(compound("empty disjunction", errs));
                break;
            }
            results = next;
        }

        for pd in pds {
            if let Some(hole) = pd.hole {
                self.dec_dependent(hole, DepKind::Disjunct, v.0);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        if results.len() == 1 {
            self.absorb_overlay(v, results[0].vertex);
            self.node_mut(v).default_mode = results[0].mode;
            return Ok(());
        }

        // Defaults first, preserving relative order.
        results.sort_by_key(|r| r.mode != DefaultMode::Is);
        let num_defaults = results
            .iter()
            .filter(|r| r.mode == DefaultMode::Is)
            .count();
        let values: Vec<Value> = results
            .iter()
            .map(|r| self.overlay_value(r.vertex))
            .collect();
        debug!(
            "vertex {:?}: {} disjunct(s), {} default(s)",
            v,
            values.len(),
            num_defaults
        );
        self.node_mut(v).disjunct_value = Some(Value::disjunction(values, num_defaults));
        Ok(())
    }

    /// The error of a completed overlay, if it failed.
    fn overlay_error(&self, ov: VertexId) -> Option<Rc<Bottom>> {
        if let Some(state) = &self.vertex(ov).state {
            if let Some(e) = &state.errs {
                return Some(e.clone());
            }
        }
        match &self.vertex(ov).base_value {
            Some(Value::Bottom(b)) => Some(b.clone()),
            _ => None,
        }
    }

    /// The value a surviving overlay contributes to the disjunction.
    fn overlay_value(&self, ov: VertexId) -> Value {
        if let Some(v) = &self.vertex(ov).base_value {
            if !matches!(v, Value::StructMarker | Value::ListMarker) {
                return v.clone();
            }
        } else if let Some(state) = &self.vertex(ov).state {
            if let Some(s) = &state.scalar {
                return s.clone();
            }
        }
        Value::Vertex(ov)
    }

    // ── Overlays ────────────────────────────────────────────────────

    /// Clone the evaluation state of `src` into a detached vertex. The
    /// subtree is deep-cloned; finalized descendants are shared by id.
    pub(crate) fn clone_overlay(&mut self, src: VertexId) -> VertexId {
        let label = self.vertex(src).label;
        let parent = self.vertex(src).parent;
        let ov = self.new_vertex(label, parent);
        {
            let sv = self.vertex(src);
            let conjuncts = sv.conjuncts.clone();
            let conjunct_info = sv.conjunct_info.clone();
            let req_sets = sv.req_sets.clone();
            let patterns = sv.pattern_constraints.clone();
            let arc_type = sv.arc_type;
            let base_value = sv.base_value.clone();
            let status = sv.status;
            let closed_recursive = sv.closed_recursive;
            let closed_non_recursive = sv.closed_non_recursive;
            let d = self.vertex_mut(ov);
            d.is_disjunct = true;
            d.conjuncts = conjuncts;
            d.conjunct_info = conjunct_info;
            d.req_sets = req_sets;
            d.pattern_constraints = patterns;
            d.arc_type = arc_type;
            d.base_value = base_value;
            d.status = status;
            d.closed_recursive = closed_recursive;
            d.closed_non_recursive = closed_non_recursive;
        }
        // Deep-clone unfinalized arcs; finalized sub-trees are immutable
        // and shared.
        let arcs: Vec<VertexId> = self.vertex(src).arcs.clone();
        for a in arcs {
            let child = if self.vertex(a).is_finalized() {
                a
            } else {
                let c = self.clone_overlay(a);
                self.vertex_mut(c).parent = Some(ov);
                c
            };
            self.vertex_mut(ov).arcs.push(child);
        }
        // Copy the settled scheduler state; pending tasks are not
        // cloned, only their completion picture.
        if let Some(state) = &self.vertex(src).state {
            let mut ns = crate::vertex::NodeState::new();
            ns.kind = state.kind;
            ns.scalar = state.scalar.clone();
            ns.checks = state.checks.clone();
            ns.errs = state.errs.clone();
            ns.has_ellipsis = state.has_ellipsis;
            ns.has_top = state.has_top;
            ns.default_mode = state.default_mode;
            ns.scheduler.completed = state.scheduler.completed;
            ns.scheduler.frozen = state.scheduler.frozen;
            ns.scheduler.provided = state.scheduler.provided;
            ns.scheduler.needs = state.scheduler.needs;
            self.vertex_mut(ov).state = Some(Box::new(ns));
        }
        // A finalized source must reopen so a later alternative can
        // still refine the clone; its base seeds the fresh state.
        if self.vertex(ov).status == crate::vertex::VertexStatus::Finalized {
            let mut ns = crate::vertex::NodeState::new();
            match self.vertex_mut(ov).base_value.take() {
                Some(Value::StructMarker) => ns.kind = strata_core::kind::Kind::STRUCT,
                Some(Value::ListMarker) => ns.kind = strata_core::kind::Kind::LIST,
                Some(Value::Bottom(b)) => ns.errs = Some(b),
                Some(Value::Disjunction(d)) => {
                    ns.disjunct_value = Some(Value::Disjunction(d));
                }
                Some(other) => {
                    ns.kind = other.kind();
                    ns.scalar = Some(other);
                }
                None => {}
            }
            ns.scheduler.completed = crate::sched::ALL_KNOWN;
            self.vertex_mut(ov).status = crate::vertex::VertexStatus::Evaluating;
            self.vertex_mut(ov).state = Some(Box::new(ns));
        }
        trace!("overlay {:?} cloned from {:?}", ov, src);
        ov
    }

    /// Copy a single surviving overlay back into the original vertex.
    pub(crate) fn absorb_overlay(&mut self, v: VertexId, ov: VertexId) {
        // A finalized overlay has dropped its state; read its base.
        let (scalar, kind, checks, errs, ellipsis) = match &self.vertex(ov).state {
            Some(state) => (
                state.scalar.clone(),
                state.kind,
                state.checks.clone(),
                state.errs.clone(),
                state.has_ellipsis,
            ),
            None => {
                let base = self.vertex(ov).base_value.clone();
                let errs = match &base {
                    Some(Value::Bottom(b)) => Some(b.clone()),
                    _ => None,
                };
                let scalar = match base {
                    Some(b)
                        if !matches!(
                            b,
                            Value::StructMarker | Value::ListMarker | Value::Bottom(_)
                        ) =>
                    {
                        Some(b)
                    }
                    _ => None,
                };
                let kind = scalar
                    .as_ref()
                    .map(|s| s.kind())
                    .unwrap_or(strata_core::kind::Kind::TOP);
                (scalar, kind, Vec::new(), errs, false)
            }
        };
        {
            let node = self.node_mut(v);
            if let Some(s) = scalar {
                node.scalar = Some(s);
            }
            node.kind = node.kind.meet(kind);
            for c in checks {
                if !node.checks.contains(&c) {
                    node.checks.push(c);
                }
            }
            if node.errs.is_none() {
                node.errs = errs;
            }
            node.has_ellipsis |= ellipsis;
        }
        // Graft arcs the overlay grew; arcs present in both merge their
        // contributions (identity-deduplicated).
        let grown: Vec<VertexId> = self.vertex(ov).arcs.clone();
        for a in grown {
            let f = self.vertex(a).label;
            match self.lookup_arc(v, f) {
                None => {
                    self.vertex_mut(a).parent = Some(v);
                    self.vertex_mut(v).arcs.push(a);
                }
                Some(existing) => {
                    let conjuncts = self.vertex(a).conjuncts.clone();
                    for c in conjuncts {
                        self.add_conjunct(existing, c);
                    }
                    let at = self.vertex(a).arc_type;
                    let merged = self.vertex(existing).arc_type.meet(at);
                    self.vertex_mut(existing).arc_type = merged;
                }
            }
        }
    }

    // ── Structural equivalence of partial disjuncts ─────────────────

    /// Two overlays are equivalent if their scalars, kinds, checks,
    /// arcs (recursively, by label) and conjunct expressions agree.
    /// Close-context identity between outstanding tasks is deliberately
    /// ignored.
    pub(crate) fn equal_partial(&self, a: VertexId, b: VertexId) -> bool {
        if a == b {
            return true;
        }
        let (va, vb) = (self.vertex(a), self.vertex(b));
        match (&va.state, &vb.state) {
            (Some(sa), Some(sb)) => {
                if sa.kind != sb.kind
                    || sa.scalar != sb.scalar
                    || sa.checks != sb.checks
                    || sa.has_ellipsis != sb.has_ellipsis
                {
                    return false;
                }
            }
            (None, None) => {
                if va.base_value != vb.base_value {
                    return false;
                }
            }
            _ => return false,
        }
        if va.arcs.len() != vb.arcs.len() {
            return false;
        }
        for &arc_a in &va.arcs {
            let f = self.vertex(arc_a).label;
            match self.lookup_arc(b, f) {
                Some(arc_b) => {
                    if !self.equal_partial(arc_a, arc_b) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        // Compare contributions by expression identity.
        if va.conjuncts.len() != vb.conjuncts.len() {
            return false;
        }
        va.conjuncts.iter().all(|ca| {
            vb.conjuncts
                .iter()
                .any(|cb| Rc::ptr_eq(&ca.expr, &cb.expr))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_join_is_saturating_max() {
        use DefaultMode::*;
        assert_eq!(Maybe.combine(Is), Is);
        assert_eq!(Is.combine(Not), Not);
        assert_eq!(Maybe.combine(Maybe), Maybe);
        assert_eq!(Not.combine(Is), Not);
        assert_eq!(Is.combine(Is), Is);
    }

    #[test]
    fn partial_equivalence_ignores_cc_identity() {
        // The comparator looks at expression identity only; differing
        // close contexts between the contributions do not distinguish
        // two partial disjuncts.
        let mut ctx = OpContext::new();
        let label = strata_core::feature::Feature::int(0).unwrap();
        let cc1 = ctx.new_cc();
        let cc2 = ctx.new_cc();
        let a = ctx.new_vertex(label, None);
        let b = ctx.new_vertex(label, None);
        let env = Environment::root(a);
        let e: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let mut ci1 = CloseInfo::root(&mut ctx);
        ci1.cc = Some(cc1);
        let mut ci2 = CloseInfo::root(&mut ctx);
        ci2.cc = Some(cc2);
        ctx.add_conjunct(a, Conjunct::new(env.clone(), e.clone(), ci1));
        ctx.add_conjunct(b, Conjunct::new(env, e, ci2));
        assert!(ctx.equal_partial(a, b));
    }

    #[test]
    fn pending_disjunction_marks() {
        let mut ctx = OpContext::new();
        let root = ctx.new_vertex(strata_core::feature::Feature::int(0).unwrap(), None);
        let env = Environment::root(root);
        let ci = CloseInfo::root(&mut ctx);
        let one: ExprRef = Rc::new(Expr::Value(Value::int(1)));
        let two: ExprRef = Rc::new(Expr::Value(Value::int(2)));
        let pd = PendingDisjunction {
            alts: vec![(one, true), (two, false)],
            env,
            ci,
            hole: None,
            pos: 0,
        };
        assert!(pd.has_defaults());
    }
}
