//! The unification driver.
//!
//! `unify` brings a vertex to at least the requested condition level:
//! it schedules the vertex's conjuncts as tasks, runs the scheduler,
//! and at finalize applies validators, performs the typo check,
//! converts unresolved waiting tasks into cycle bottoms, computes the
//! base value from the accumulated meet, and transitions the vertex to
//! finalized. A single conjunct failure produces a bottom on the
//! vertex; sibling conjuncts continue.

use std::rc::Rc;

use log::{debug, trace};

use strata_core::feature::Feature;
use strata_core::kind::Kind;

use crate::closectx::DepKind;
use crate::context::OpContext;
use crate::errors::{combine, Bottom};
use crate::expr::{Decl, Expr, ListLit, StructLit};
use crate::reqsets::{ConjunctFlags, DefId, ReplaceRule};
use crate::sched::{
    RunMode, TaskId, TaskKind, ALL_ANCESTORS_PROCESSED, ALL_KNOWN, ARC_TYPE_KNOWN, COUNTER_MASK,
    FIELD_CONJUNCTS_KNOWN, FIELD_SET_KNOWN, NUM_CONDITIONS, SCALAR_KNOWN, VALUE_KNOWN,
};
use crate::value::{Op, Value};
use crate::vertex::{
    ArcType, CloseInfo, Conjunct, Environment, PatternConstraint, VertexId, VertexStatus,
};

impl OpContext {
    // ── Entry point ─────────────────────────────────────────────────

    /// Bring `v` to at least the level `needs`. Returns true if the
    /// needs are met.
    pub fn unify(&mut self, v: VertexId, needs: u16, mode: RunMode) -> bool {
        if self.vertex(v).is_finalized() {
            return true;
        }
        self.depth += 1;
        if self.depth > self.config.max_depth {
            self.depth -= 1;
            let b = Rc::new(Bottom::structural_cycle("structural cycle").at(v));
            if self.vertex(v).state.is_some() {
                let node = self.node_mut(v);
                node.errs = Some(match node.errs.take() {
                    Some(prev) => combine(prev, b),
                    None => b,
                });
            } else {
                self.vertex_mut(v).base_value = Some(Value::Bottom(b));
                self.vertex_mut(v).status = VertexStatus::Finalized;
            }
            return false;
        }
        if self.vertex(v).state.is_none() {
            self.schedule_vertex(v);
        }
        let mut met = self.process(v, needs, mode);
        if mode == RunMode::Finalize {
            self.finalize_vertex(v);
            met = true;
        }
        self.depth -= 1;
        met
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Allocate the evaluation state and queue one task per conjunct.
    pub(crate) fn schedule_vertex(&mut self, v: VertexId) {
        debug_assert!(self.vertex(v).state.is_none());
        trace!("scheduling vertex {:?}", v);
        let mut ns = crate::vertex::NodeState::new();
        ns.scheduler.completed = ALL_ANCESTORS_PROCESSED | ARC_TYPE_KNOWN;
        self.vertex_mut(v).state = Some(Box::new(ns));
        self.vertex_mut(v).status = VertexStatus::Evaluating;

        let cc = self.new_cc();
        self.inc_dependent(cc, DepKind::Root, v.0);
        self.node_mut(v).cc_root = Some(cc);

        let conjuncts = self.vertex(v).conjuncts.clone();
        let held: Vec<crate::closectx::CcId> =
            conjuncts.iter().filter_map(|c| c.ci.cc).collect();
        for c in conjuncts {
            self.insert_conjunct_task(v, c);
        }
        // The tasks now hold the close contexts; the scheduling hold is
        // released.
        for cc in held {
            self.release_eval_dep(cc);
        }
        // Conditions nothing provides settle immediately.
        let sched = self.sched_mut(v);
        for i in 0..NUM_CONDITIONS {
            let bit = 1 << i;
            if bit & COUNTER_MASK != 0 && sched.counters[i] == 0 {
                sched.completed |= bit;
            }
        }
    }

    pub(crate) fn insert_conjunct_task(&mut self, v: VertexId, c: Conjunct) {
        self.insert_task(
            v,
            TaskKind::EvalConjunct(c),
            VALUE_KNOWN | SCALAR_KNOWN | FIELD_CONJUNCTS_KNOWN | FIELD_SET_KNOWN,
            0,
        );
    }

    // ── Conjunct evaluation ─────────────────────────────────────────

    pub(crate) fn task_eval_conjunct(
        &mut self,
        tid: TaskId,
        c: Conjunct,
    ) -> Result<(), Rc<Bottom>> {
        let v = self.task(tid).vertex;
        match &*c.expr.clone() {
            Expr::Struct(s) => self.eval_struct_conjunct(v, &c, s),
            Expr::List(l) => self.eval_list_conjunct(v, &c, l),
            Expr::Comprehension(comp) => {
                self.register_comprehension(v, comp, c.env.clone(), c.ci.clone());
                Ok(())
            }
            Expr::Disjunction(d) => {
                self.register_disjunction(v, d, c.env.clone(), c.ci.clone());
                Ok(())
            }
            // `e1 & e2` contributes both sides as conjuncts, so struct
            // contributions and closedness flow through unchanged.
            Expr::Binary {
                op: Op::And,
                lhs,
                rhs,
                ..
            } => {
                self.add_conjunct(v, Conjunct::new(c.env.clone(), lhs.clone(), c.ci.clone()));
                self.add_conjunct(v, Conjunct::new(c.env.clone(), rhs.clone(), c.ci.clone()));
                Ok(())
            }
            _ => {
                let val = self.eval_expr(&c.env, &c.expr);
                if self.suspended() {
                    return Ok(());
                }
                self.accumulate(v, val, &c)
            }
        }
    }

    /// Evaluate a struct literal's declarations against `v`.
    fn eval_struct_conjunct(
        &mut self,
        v: VertexId,
        c: &Conjunct,
        s: &Rc<StructLit>,
    ) -> Result<(), Rc<Bottom>> {
        let inner = Environment::push(&c.env, v);
        let ci = &c.ci;
        // Non-recursive closedness stops here: field conjuncts do not
        // inherit it.
        let child_ci = if ci.once {
            let mut x = ci.clone();
            x.is_closed = false;
            x.once = false;
            x
        } else {
            ci.clone()
        };
        let mut has_ellipsis = false;
        let mut has_fields = false;
        let mut has_embed = false;

        for decl in &s.decls {
            match decl {
                Decl::Field {
                    label,
                    value,
                    arc_type,
                } => {
                    has_fields = true;
                    match self.get_arc(v, *label, *arc_type) {
                        Ok(arc) => {
                            self.add_conjunct(
                                arc,
                                Conjunct::new(inner.clone(), value.clone(), child_ci.clone()),
                            );
                            if let Some(cc) = ci.cc {
                                self.cc_mut(cc).admit(*label);
                            }
                        }
                        Err(b) => self.record_err(v, b),
                    }
                }
                Decl::DynamicField { label, value } => {
                    has_fields = true;
                    let lv = self.eval_expr(&inner, label);
                    if self.suspended() {
                        return Ok(());
                    }
                    let f = match &lv {
                        Value::Str(name) => self.runtime.str_label(name),
                        Value::Num(n) => match n.to_bigint().and_then(|i| i64::try_from(i).ok()) {
                            Some(i) => match Feature::int(i) {
                                Ok(f) => f,
                                Err(e) => {
                                    self.record_err(v, Rc::new(Bottom::eval(e.to_string())));
                                    continue;
                                }
                            },
                            None => {
                                self.record_err(
                                    v,
                                    Rc::new(Bottom::eval("invalid integer label")),
                                );
                                continue;
                            }
                        },
                        Value::Bottom(b) => {
                            self.record_err(v, b.clone());
                            continue;
                        }
                        other => {
                            self.record_err(
                                v,
                                Rc::new(Bottom::eval(format!(
                                    "invalid dynamic label {}",
                                    other
                                ))),
                            );
                            continue;
                        }
                    };
                    match self.get_arc(v, f, ArcType::Member) {
                        Ok(arc) => {
                            self.add_conjunct(
                                arc,
                                Conjunct::new(inner.clone(), value.clone(), child_ci.clone()),
                            );
                            if let Some(cc) = ci.cc {
                                self.cc_mut(cc).admit(f);
                            }
                        }
                        Err(b) => self.record_err(v, b),
                    }
                }
                Decl::Pattern { pattern, value } => {
                    has_fields = true;
                    let pv = self.eval_expr(&inner, pattern);
                    if self.suspended() {
                        return Ok(());
                    }
                    if let Value::Bottom(b) = pv {
                        self.record_err(v, b);
                        continue;
                    }
                    self.add_pattern_constraint(
                        v,
                        PatternConstraint {
                            pattern: pv,
                            value: value.clone(),
                            env: inner.clone(),
                            ci: child_ci.clone(),
                        },
                    );
                }
                Decl::Ellipsis { value } => {
                    has_ellipsis = true;
                    self.node_mut(v).has_ellipsis = true;
                    if let Some(cc) = ci.cc {
                        self.cc_mut(cc).is_total = true;
                    }
                    if let Some(e) = value {
                        self.add_pattern_constraint(
                            v,
                            PatternConstraint {
                                pattern: Value::Top,
                                value: e.clone(),
                                env: inner.clone(),
                                ci: child_ci.clone(),
                            },
                        );
                    }
                }
                Decl::Embed { expr } => {
                    has_embed = true;
                    let eci = ci.spawn_embed(self);
                    self.add_conjunct(v, Conjunct::new(inner.clone(), expr.clone(), eci));
                }
                Decl::LetField { label, expr } => {
                    debug_assert!(label.is_let());
                    match self.get_arc(v, *label, ArcType::Member) {
                        Ok(arc) => self.add_conjunct(
                            arc,
                            Conjunct::new(inner.clone(), expr.clone(), child_ci.clone()),
                        ),
                        Err(b) => self.record_err(v, b),
                    }
                }
            }
        }

        // Closedness effects of this struct.
        if ci.is_closed {
            let mut group = vec![ci.def_id];
            if ci.from_embed && !ci.outer_id.is_none() {
                group.push(ci.outer_id);
            }
            self.vertex_mut(v).req_sets.add_group(&group, ci.once);
            if ci.from_def && !ci.once {
                self.vertex_mut(v).closed_recursive = true;
            } else {
                self.vertex_mut(v).closed_non_recursive = true;
            }
        }
        // An embed-only struct takes the kind of its embedding;
        // anything declaring fields is a struct.
        if has_fields || !has_embed {
            let node = self.node_mut(v);
            node.kind = node.kind.meet(Kind::STRUCT);
        }

        let mut flags = ConjunctFlags::new(ci.def_id);
        flags.has_struct = true;
        flags.has_ellipsis = has_ellipsis;
        self.vertex_mut(v).conjunct_info.push(flags);
        Ok(())
    }

    fn eval_list_conjunct(
        &mut self,
        v: VertexId,
        c: &Conjunct,
        l: &Rc<ListLit>,
    ) -> Result<(), Rc<Bottom>> {
        let inner = Environment::push(&c.env, v);
        for (i, elem) in l.elems.iter().enumerate() {
            let f = Feature::int(i as i64).map_err(|e| Rc::new(Bottom::eval(e.to_string())))?;
            match self.get_arc(v, f, ArcType::Member) {
                Ok(arc) => {
                    self.add_conjunct(arc, Conjunct::new(inner.clone(), elem.clone(), c.ci.clone()))
                }
                Err(b) => self.record_err(v, b),
            }
        }
        {
            let node = self.node_mut(v);
            node.kind = node.kind.meet(Kind::LIST);
            node.has_ellipsis |= l.open;
        }
        let mut flags = ConjunctFlags::new(c.ci.def_id);
        flags.has_ellipsis = l.open;
        self.vertex_mut(v).conjunct_info.push(flags);
        Ok(())
    }

    pub(crate) fn record_err(&mut self, v: VertexId, b: Rc<Bottom>) {
        let node = self.node_mut(v);
        if b.code.is_incomplete() {
            node.cycle_errs.push(b);
        } else {
            node.errs = Some(match node.errs.take() {
                Some(prev) => combine(prev, b),
                None => b,
            });
        }
    }

    // ── Accumulation (the conjunct-level meet) ──────────────────────

    fn accumulate(&mut self, v: VertexId, val: Value, c: &Conjunct) -> Result<(), Rc<Bottom>> {
        let pos = c.expr.pos();
        match val {
            Value::Bottom(b) => Err(b),
            Value::Top => {
                self.node_mut(v).has_top = true;
                let mut flags = ConjunctFlags::new(c.ci.def_id);
                flags.has_top = true;
                self.vertex_mut(v).conjunct_info.push(flags);
                Ok(())
            }
            Value::BasicType(k) => {
                let node = self.node_mut(v);
                let met = node.kind.meet(k);
                if met.is_bottom() {
                    return Err(Rc::new(
                        Bottom::eval(format!(
                            "conflicting types {} and {}",
                            node.kind, k
                        ))
                        .with_pos(pos),
                    ));
                }
                node.kind = met;
                self.vertex_mut(v)
                    .conjunct_info
                    .push(ConjunctFlags::new(c.ci.def_id));
                Ok(())
            }
            Value::Bound(_) | Value::Validator(_) => {
                let open = match &val {
                    Value::Validator(vc) => vc.builtin.open,
                    _ => false,
                };
                let k = val.kind();
                let node = self.node_mut(v);
                if !node.checks.contains(&val) {
                    node.checks.push(val);
                }
                node.kind = node.kind.meet(k);
                let mut flags = ConjunctFlags::new(c.ci.def_id);
                flags.has_open_validator = open;
                self.vertex_mut(v).conjunct_info.push(flags);
                Ok(())
            }
            Value::Conjunction(vs) => {
                for x in vs.iter() {
                    self.accumulate(v, x.clone(), c)?;
                }
                Ok(())
            }
            Value::Disjunction(d) => {
                self.register_value_disjunction(
                    v,
                    &d.values,
                    d.num_defaults,
                    c.env.clone(),
                    c.ci.clone(),
                    pos,
                );
                Ok(())
            }
            Value::StructMarker => {
                let node = self.node_mut(v);
                node.kind = node.kind.meet(Kind::STRUCT);
                let mut flags = ConjunctFlags::new(c.ci.def_id);
                flags.has_struct = true;
                self.vertex_mut(v).conjunct_info.push(flags);
                Ok(())
            }
            Value::ListMarker => {
                let node = self.node_mut(v);
                node.kind = node.kind.meet(Kind::LIST);
                self.vertex_mut(v)
                    .conjunct_info
                    .push(ConjunctFlags::new(c.ci.def_id));
                Ok(())
            }
            Value::Vertex(w) => self.merge_vertex_ref(v, w, c),
            scalar => {
                let node = self.node_mut(v);
                let k = node.kind.meet(scalar.kind());
                if k.is_bottom() {
                    return Err(Rc::new(
                        Bottom::eval(format!(
                            "conflicting values {} and {}",
                            node.kind, scalar
                        ))
                        .with_pos(pos),
                    ));
                }
                let prev = node.scalar.take();
                let merged = match prev {
                    Some(p) => self.meet(pos, p, scalar),
                    None => scalar,
                };
                if let Value::Bottom(b) = merged {
                    return Err(b);
                }
                let node = self.node_mut(v);
                node.kind = node.kind.meet(merged.kind());
                node.scalar = Some(merged);
                self.vertex_mut(v)
                    .conjunct_info
                    .push(ConjunctFlags::new(c.ci.def_id));
                Ok(())
            }
        }
    }

    /// Fold a referenced vertex into `v`: scalars meet directly,
    /// structs contribute their arcs with a freshly spawned close info
    /// so evidence and requirements flow.
    fn merge_vertex_ref(&mut self, v: VertexId, w: VertexId, c: &Conjunct) -> Result<(), Rc<Bottom>> {
        if v == w {
            // Self-reference is a tautology.
            return Ok(());
        }
        // A finalized non-composite base (scalar, disjunction, bound
        // set, type) contributes as a value.
        if let Some(base) = self.vertex(w).base_value.clone() {
            if !matches!(base, Value::StructMarker | Value::ListMarker) {
                return self.accumulate(v, base, c);
            }
        }
        if let Some(state) = &self.vertex(w).state {
            if let Some(s) = state.scalar.clone() {
                return self.accumulate(v, s, c);
            }
            if let Some(d) = state.disjunct_value.clone() {
                return self.accumulate(v, d, c);
            }
        }

        let (w_is_struct, w_is_list) = {
            let wv = self.vertex(w);
            let struct_like = !wv.arcs.is_empty()
                || wv.conjunct_info.iter().any(|f| f.has_struct)
                || matches!(wv.base_value, Some(Value::StructMarker));
            let list_like = matches!(wv.base_value, Some(Value::ListMarker))
                || wv.state.as_ref().map(|s| s.kind == Kind::LIST).unwrap_or(false);
            (struct_like, list_like)
        };
        if !w_is_struct && !w_is_list {
            // The target has produced nothing yet; it contributes no
            // constraint.
            self.node_mut(v).has_top = true;
            let mut flags = ConjunctFlags::new(c.ci.def_id);
            flags.has_top = true;
            self.vertex_mut(v).conjunct_info.push(flags);
            return Ok(());
        }
        self.vertex_mut(w).is_shared = true;

        let closed = self.vertex(w).closed_recursive || self.vertex(w).label.is_def();
        let ci = c.ci.spawn_ref(self, closed);
        if closed {
            self.vertex_mut(v).req_sets.add_group(&[ci.def_id], false);
            self.vertex_mut(v).closed_recursive = true;
        }
        // Fold the target's own (recursive) requirements in, rewriting
        // them so the evidence carried by the merged conjuncts counts.
        if !self.vertex(w).req_sets.is_empty() {
            let mut imported = self.vertex(w).req_sets.clone();
            imported.filter_non_recursive();
            let rules: Vec<ReplaceRule> = imported
                .groups()
                .map(|g| ReplaceRule::embed(g[0].id, ci.def_id))
                .collect();
            imported.replace_ids(&rules);
            self.vertex_mut(v).req_sets.merge(&imported);
        }

        let arcs: Vec<VertexId> = self.vertex(w).arcs.clone();
        for arc in arcs {
            let f = self.vertex(arc).label;
            let at = self.vertex(arc).arc_type;
            if at == ArcType::NotPresent {
                continue;
            }
            match self.get_arc(v, f, at) {
                Ok(child) => {
                    let e: crate::expr::ExprRef = Rc::new(Expr::Value(Value::Vertex(arc)));
                    self.add_conjunct(child, Conjunct::new(c.env.clone(), e, ci.clone()));
                    if let Some(cc) = ci.cc {
                        self.cc_mut(cc).admit(f);
                    }
                }
                Err(b) => self.record_err(v, b),
            }
        }
        let patterns: Vec<PatternConstraint> = self.vertex(w).pattern_constraints.clone();
        for mut pc in patterns {
            pc.ci = ci.clone();
            self.add_pattern_constraint(v, pc);
        }

        let w_open = self.vertex(w).conjunct_info.iter().any(|f| f.has_ellipsis);
        {
            let node = self.node_mut(v);
            node.kind = node
                .kind
                .meet(if w_is_list { Kind::LIST } else { Kind::STRUCT });
            node.has_ellipsis |= w_open;
        }
        let mut flags = ConjunctFlags::new(ci.def_id);
        flags.has_struct = !w_is_list;
        flags.has_ellipsis = w_open;
        self.vertex_mut(v).conjunct_info.push(flags);
        Ok(())
    }

    // ── Expression evaluation ───────────────────────────────────────

    /// Evaluate an expression to a value. A reference that is not ready
    /// suspends the current task; callers must check `suspended()`.
    pub(crate) fn eval_expr(&mut self, env: &Rc<Environment>, expr: &crate::expr::ExprRef) -> Value {
        match &**expr {
            Expr::Value(v) => v.clone(),
            Expr::FieldRef { up, label, pos } => {
                let parent = env.at(*up).vertex;
                self.resolve_ref(parent, *label, *pos)
            }
            Expr::Var { name, pos } => match env.lookup(*name) {
                Some(v) => v.clone(),
                None => Value::bottom(
                    Bottom::incomplete(format!("unresolved binding {}", name)).with_pos(*pos),
                ),
            },
            Expr::Selector { source, sel, pos } => {
                let sv = self.eval_expr(env, source);
                if self.suspended() {
                    return sv;
                }
                match sv {
                    Value::Vertex(w) => self.resolve_ref(w, *sel, *pos),
                    b @ Value::Bottom(_) => b,
                    other => Value::bottom(
                        Bottom::eval(format!("cannot select field from {}", other))
                            .with_pos(*pos),
                    ),
                }
            }
            Expr::Index { source, index, pos } => {
                let sv = self.eval_expr(env, source);
                if self.suspended() {
                    return sv;
                }
                let iv = self.eval_expr(env, index);
                if self.suspended() {
                    return iv;
                }
                match (sv, iv) {
                    (Value::Vertex(w), Value::Num(n)) => {
                        match n.to_bigint().and_then(|i| i64::try_from(i).ok()) {
                            Some(i) => match Feature::int(i) {
                                Ok(f) => self.resolve_ref(w, f, *pos),
                                Err(e) => Value::bottom(Bottom::eval(e.to_string()).with_pos(*pos)),
                            },
                            None => Value::bottom(
                                Bottom::eval("invalid index").with_pos(*pos),
                            ),
                        }
                    }
                    (Value::Vertex(w), Value::Str(s)) => {
                        let f = self.runtime.str_label(&s);
                        self.resolve_ref(w, f, *pos)
                    }
                    (b @ Value::Bottom(_), _) | (_, b @ Value::Bottom(_)) => b,
                    (s, i) => Value::bottom(
                        Bottom::eval(format!("cannot index {} with {}", s, i)).with_pos(*pos),
                    ),
                }
            }
            Expr::Unary { op, expr, pos } => {
                let v = self.eval_expr(env, expr);
                if self.suspended() {
                    return v;
                }
                self.unary_op(*pos, *op, v)
            }
            Expr::Binary { op, lhs, rhs, pos } => {
                let l = self.eval_expr(env, lhs);
                if self.suspended() {
                    return l;
                }
                let r = self.eval_expr(env, rhs);
                if self.suspended() {
                    return r;
                }
                self.bin_op(*pos, *op, l, r)
            }
            Expr::Bound { op, expr, pos } => {
                let v = self.eval_expr(env, expr);
                if self.suspended() {
                    return v;
                }
                if v.is_bottom() {
                    return v;
                }
                if !v.is_concrete() {
                    return Value::bottom(
                        Bottom::incomplete(format!("non-concrete bound endpoint {}", v))
                            .with_pos(*pos),
                    );
                }
                Value::bound(*op, v)
            }
            Expr::Disjunction(d) => {
                let mut values = Vec::new();
                let mut errs = Vec::new();
                let mut defaults = 0;
                for alt in &d.alternatives {
                    let av = self.eval_expr(env, &alt.expr);
                    if self.suspended() {
                        return av;
                    }
                    match av {
                        Value::Bottom(b) => errs.push(b),
                        other => {
                            if alt.default && !values.contains(&other) {
                                values.insert(defaults, other.clone());
                                defaults += 1;
                            } else if !values.contains(&other) {
                                values.push(other);
                            }
                        }
                    }
                }
                match values.len() {
                    0 => Value::Bottom(crate::errors::compound("empty disjunction", errs)),
                    1 => values.pop().unwrap(),
                    _ => Value::disjunction(values, defaults),
                }
            }
            Expr::Struct(_) | Expr::List(_) => {
                // A literal in expression position evaluates through an
                // anonymous vertex.
                let label = self.runtime.hidden_label("_expr");
                let anon = self.new_vertex(label, None);
                let ci = CloseInfo::root(self);
                self.add_conjunct(anon, Conjunct::new(env.clone(), expr.clone(), ci));
                self.unify(anon, ALL_KNOWN, RunMode::Finalize);
                self.vertex_value(anon)
            }
            Expr::Comprehension(c) => Value::bottom(
                Bottom::eval("comprehension in expression position").with_pos(c.pos),
            ),
            Expr::Call { builtin, args, pos } => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    let av = self.eval_expr(env, a);
                    if self.suspended() {
                        return av;
                    }
                    vals.push(av);
                }
                let b = builtin.clone();
                let r = b.call(self, &vals);
                match r {
                    Value::Bottom(e) => Value::Bottom(Rc::new((*e).clone().with_pos(*pos))),
                    ok => ok,
                }
            }
        }
    }

    /// Resolve a reference to the field `label` of `parent`, driving
    /// the target to scalar-known if possible.
    fn resolve_ref(&mut self, parent: VertexId, label: Feature, pos: u32) -> Value {
        let arc = match self.lookup_arc(parent, label) {
            Some(a) => a,
            None => {
                // The field may still appear.
                if self.vertex(parent).state.is_some()
                    && self.sched(parent).known() & FIELD_SET_KNOWN != 0
                {
                    return Value::bottom(
                        Bottom::eval(format!(
                            "undefined field: {}",
                            self.label_str(label)
                        ))
                        .with_pos(pos),
                    );
                }
                self.unify(parent, FIELD_SET_KNOWN, RunMode::Yield);
                if self.suspended() {
                    return Value::bottom(
                        Bottom::incomplete(format!(
                            "field {} not yet known",
                            self.label_str(label)
                        ))
                        .with_pos(pos),
                    );
                }
                match self.lookup_arc(parent, label) {
                    Some(a) => a,
                    None => {
                        return Value::bottom(
                            Bottom::eval(format!(
                                "undefined field: {}",
                                self.label_str(label)
                            ))
                            .with_pos(pos),
                        )
                    }
                }
            }
        };
        if self.vertex(arc).is_finalized() {
            return self.vertex_value(arc);
        }
        self.unify(arc, SCALAR_KNOWN, RunMode::Yield);
        if self.suspended() {
            return Value::bottom(
                Bottom::incomplete(format!("{} not yet evaluated", self.label_str(label)))
                    .with_pos(pos),
            );
        }
        if let Some(state) = &self.vertex(arc).state {
            if let Some(s) = &state.scalar {
                return s.clone();
            }
        }
        if let Some(s) = self.vertex(arc).scalar() {
            return s.clone();
        }
        Value::Vertex(arc)
    }

    // ── Finalization ────────────────────────────────────────────────

    pub(crate) fn finalize_vertex(&mut self, v: VertexId) {
        if self.vertex(v).is_finalized() || self.vertex(v).state.is_none() {
            return;
        }
        trace!("finalizing vertex {:?}", v);

        // Unresolved waiting tasks are cycles.
        let waiting: Vec<TaskId> = self
            .sched(v)
            .tasks
            .iter()
            .copied()
            .filter(|&t| self.task(t).state == crate::sched::TaskState::Waiting)
            .collect();
        for t in waiting {
            self.fail_waiting_task(t);
        }

        // Validators and bounds apply to the final scalar.
        let checks = self.node(v).checks.clone();
        if let Some(scalar) = self.node(v).scalar.clone() {
            for check in checks {
                let r = match &check {
                    Value::Bound(b) => self.apply_bound(&scalar, b).err(),
                    Value::Validator(val) => {
                        let val = val.clone();
                        val.validate(self, &scalar)
                    }
                    _ => None,
                };
                if let Some(b) = r {
                    self.record_err(v, b);
                }
            }
        }

        // Drop arcs proven absent, then finalize the survivors.
        let kept: Vec<VertexId> = self
            .vertex(v)
            .arcs
            .iter()
            .copied()
            .filter(|&a| self.vertex(a).arc_type != ArcType::NotPresent)
            .collect();
        self.vertex_mut(v).arcs = kept;
        let arcs: Vec<VertexId> = self.vertex(v).arcs.clone();
        for a in arcs {
            if !self.vertex(a).is_disjunct {
                self.unify(a, ALL_KNOWN, RunMode::Finalize);
            }
        }

        self.typo_check(v);
        self.compute_base(v);

        if let Some(cc) = self.node_mut(v).cc_root.take() {
            self.release_eval_dep(cc);
            self.dec_dependent(cc, DepKind::Root, v.0);
        }
        self.vertex_mut(v).status = VertexStatus::Finalized;
        self.vertex_mut(v).state = None;
        self.hook_vertex(v);
        debug!(
            "vertex {:?} finalized: {}",
            v,
            self.vertex(v)
                .base_value
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_default()
        );
    }

    fn fail_waiting_task(&mut self, t: TaskId) {
        let on = self.task(t).blocked_on;
        if let Some(on) = on {
            if self.vertex(on).state.is_some() {
                self.sched_mut(on).blocking.retain(|&x| x != t);
            }
        }
        self.blocked_tasks.retain(|&x| x != t);
        {
            let task = self.task_mut(t);
            task.blocked_on = None;
            task.block_condition = 0;
        }
        let b = Rc::new(Bottom::cycle("cycle in evaluation"));
        self.finish_task(t, crate::sched::TaskState::Failed, Some(b));
    }

    /// Reject fields of closed vertices that no requirement admits. The
    /// offending arc's value becomes bottom; the parent records the
    /// error as a child error.
    fn typo_check(&mut self, v: VertexId) {
        let arcs: Vec<VertexId> = self.vertex(v).arcs.clone();
        for arc in arcs {
            let f = self.vertex(arc).label;
            if !f.is_regular() {
                continue;
            }
            if self.accept(v, f) {
                continue;
            }
            let name = self.label_str(f);
            let b = Rc::new(Bottom::field_not_allowed(&name).at(arc));
            debug!("vertex {:?}: field {} not allowed", v, name);
            self.vertex_mut(arc).base_value = Some(Value::Bottom(b.clone()));
            let parent = self.vertex_mut(v);
            parent.child_error = Some(match parent.child_error.take() {
                Some(prev) => combine(prev, b),
                None => b,
            });
        }
    }

    fn compute_base(&mut self, v: VertexId) {
        if self.vertex(v).base_value.is_some() {
            // Set by an earlier finalize or by a typo check.
            return;
        }
        let (errs, disjunct, scalar, kind, checks, cycle_errs) = {
            let node = self.node(v);
            (
                node.errs.clone(),
                node.disjunct_value.clone(),
                node.scalar.clone(),
                node.kind,
                node.checks.clone(),
                node.cycle_errs.clone(),
            )
        };
        let has_arcs = self
            .vertex(v)
            .arcs
            .iter()
            .any(|&a| self.vertex(a).label.is_regular());
        let has_struct = self.vertex(v).conjunct_info.iter().any(|f| f.has_struct);

        let base = if let Some(e) = errs {
            Value::Bottom(e)
        } else if let Some(d) = disjunct {
            d
        } else if let Some(s) = scalar {
            // Cycle errors are suppressed: a non-cycle conjunct
            // produced a value.
            s
        } else if kind == Kind::LIST {
            Value::ListMarker
        } else if kind == Kind::STRUCT || has_struct || has_arcs {
            Value::StructMarker
        } else if !checks.is_empty() {
            // No concrete value arrived; the vertex is the meet of its
            // constraints, which may itself prove unsatisfiable.
            let mut acc = checks[0].clone();
            for c in &checks[1..] {
                acc = self.meet(0, acc, c.clone());
            }
            acc
        } else if !cycle_errs.is_empty() {
            let msg = cycle_errs[0].err.clone();
            Value::Bottom(Rc::new(Bottom::cycle(msg).at(v)))
        } else if kind.is_top() {
            Value::Top
        } else {
            Value::BasicType(kind)
        };
        self.vertex_mut(v).base_value = Some(base);
    }

    /// The exported value of a finalized vertex.
    pub fn vertex_value(&self, v: VertexId) -> Value {
        match &self.vertex(v).base_value {
            Some(Value::StructMarker) | Some(Value::ListMarker) | None => Value::Vertex(v),
            Some(other) => other.clone(),
        }
    }

    /// Follow shared vertex references to the representative vertex.
    pub fn deref_value(&self, v: VertexId) -> VertexId {
        let mut cur = v;
        let mut hops = 0;
        while let Some(Value::Vertex(w)) = &self.vertex(cur).base_value {
            cur = *w;
            hops += 1;
            if hops > self.vertices.len() {
                return v;
            }
        }
        cur
    }

    // ── Structural equality ─────────────────────────────────────────

    /// Structural comparison of two values. With `structural` set,
    /// optional fields and closedness participate.
    pub fn equal(&self, a: &Value, b: &Value, structural: bool) -> bool {
        let mut visited = Vec::new();
        self.equal_inner(a, b, structural, &mut visited)
    }

    fn equal_inner(
        &self,
        a: &Value,
        b: &Value,
        structural: bool,
        visited: &mut Vec<(VertexId, VertexId)>,
    ) -> bool {
        match (a, b) {
            (Value::Vertex(x), Value::Vertex(y)) => {
                self.equal_vertices(*x, *y, structural, visited)
            }
            (Value::Vertex(x), other) | (other, Value::Vertex(x)) => {
                match self.vertex(*x).scalar() {
                    Some(s) => self.equal_inner(s, other, structural, visited),
                    None => false,
                }
            }
            (Value::Conjunction(xs), Value::Conjunction(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .all(|x| ys.iter().any(|y| self.equal_inner(x, y, structural, visited)))
            }
            (Value::Disjunction(x), Value::Disjunction(y)) => {
                x.num_defaults == y.num_defaults
                    && x.values.len() == y.values.len()
                    && x.values
                        .iter()
                        .all(|xv| {
                            y.values
                                .iter()
                                .any(|yv| self.equal_inner(xv, yv, structural, visited))
                        })
            }
            _ => a == b,
        }
    }

    fn equal_vertices(
        &self,
        x: VertexId,
        y: VertexId,
        structural: bool,
        visited: &mut Vec<(VertexId, VertexId)>,
    ) -> bool {
        if x == y {
            return true;
        }
        // Shared sub-vertices can be reached twice; guard the walk.
        if visited.contains(&(x, y)) {
            return true;
        }
        visited.push((x, y));
        let (vx, vy) = (self.vertex(x), self.vertex(y));
        if structural
            && (vx.closed_recursive != vy.closed_recursive
                || vx.closed_non_recursive != vy.closed_non_recursive)
        {
            return false;
        }
        match (&vx.base_value, &vy.base_value) {
            (Some(a), Some(b)) => {
                if !matches!(a, Value::StructMarker | Value::ListMarker)
                    || !matches!(b, Value::StructMarker | Value::ListMarker)
                {
                    if !self.equal_inner(a, b, structural, visited) {
                        return false;
                    }
                }
            }
            (None, None) => {}
            _ => return false,
        }
        let xa: Vec<VertexId> = vx
            .arcs
            .iter()
            .copied()
            .filter(|&a| self.relevant_arc(a, structural))
            .collect();
        let ya: Vec<VertexId> = vy
            .arcs
            .iter()
            .copied()
            .filter(|&a| self.relevant_arc(a, structural))
            .collect();
        if xa.len() != ya.len() {
            return false;
        }
        for a in xa {
            let f = self.vertex(a).label;
            let Some(b) = self.lookup_arc(y, f) else {
                return false;
            };
            if structural && self.vertex(a).arc_type != self.vertex(b).arc_type {
                return false;
            }
            if !self.equal_vertices(a, b, structural, visited) {
                return false;
            }
        }
        true
    }

    fn relevant_arc(&self, a: VertexId, structural: bool) -> bool {
        let v = self.vertex(a);
        if !v.label.is_regular() {
            return false;
        }
        match v.arc_type {
            ArcType::Member | ArcType::Required => true,
            ArcType::Optional => structural,
            _ => false,
        }
    }

    // ── Test support: evidence snapshot ─────────────────────────────

    /// The evidence ids currently recorded for an arc label.
    pub fn evidence(&self, v: VertexId, f: Feature) -> Vec<DefId> {
        match self.lookup_arc(v, f) {
            Some(arc) => self
                .vertex(arc)
                .conjuncts
                .iter()
                .map(|c| c.ci.def_id)
                .filter(|id| !id.is_none())
                .collect(),
            None => Vec::new(),
        }
    }
}
