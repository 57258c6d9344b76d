//! The comprehension driver.
//!
//! Comprehensions evaluate lazily: the fixed fields of a struct body
//! are registered as *pending* arcs up front, and the clause chain is
//! driven by a task that yields environments. An incomplete source
//! suspends the task; zero yielded environments demote the pending
//! arcs to not-present.

use std::rc::Rc;

use log::{debug, trace};

use crate::context::OpContext;
use crate::errors::Bottom;
use crate::expr::{Clause, ComprehensionExpr, Decl, Expr, ExprRef};
use crate::sched::{
    RunMode, TaskId, TaskKind, FIELD_CONJUNCTS_KNOWN, FIELD_SET_KNOWN,
};
use crate::value::Value;
use crate::vertex::{ArcType, CloseInfo, Conjunct, Environment, VertexId};

/// The stored state of a comprehension task.
#[derive(Debug, Clone)]
pub struct CompTask {
    pub comp: Rc<ComprehensionExpr>,
    /// The struct body as a stable expression node, so re-inserted
    /// conjuncts deduplicate by identity.
    pub body: ExprRef,
    pub env: Rc<Environment>,
    pub ci: CloseInfo,
    /// Arcs reserved for the fixed fields of the body.
    pub pending: Vec<VertexId>,
}

impl OpContext {
    /// Register a comprehension conjunct on `v`: reserve pending arcs
    /// for the fixed fields of the body and queue the driver task.
    pub(crate) fn register_comprehension(
        &mut self,
        v: VertexId,
        comp: &Rc<ComprehensionExpr>,
        env: Rc<Environment>,
        ci: CloseInfo,
    ) {
        let mut pending = Vec::new();
        for decl in &comp.body.decls {
            if let Decl::Field { label, .. } = decl {
                if let Ok(arc) = self.get_arc(v, *label, ArcType::Pending) {
                    pending.push(arc);
                }
            }
        }
        let ct = CompTask {
            comp: comp.clone(),
            body: Rc::new(Expr::Struct(comp.body.clone())),
            env,
            ci,
            pending,
        };
        self.insert_task(
            v,
            TaskKind::ProcessComprehension(ct),
            FIELD_SET_KNOWN | FIELD_CONJUNCTS_KNOWN,
            0,
        );
    }

    /// The driver: run the clause chain, then register the body once
    /// per yielded environment.
    pub(crate) fn task_comprehension(
        &mut self,
        tid: TaskId,
        ct: CompTask,
    ) -> Result<(), Rc<Bottom>> {
        let v = self.task(tid).vertex;
        let mut envs = vec![ct.env.clone()];
        for clause in &ct.comp.clauses {
            envs = self.apply_clause(clause, envs)?;
            if self.suspended() {
                trace!("comprehension on {:?} suspended", v);
                return Ok(());
            }
        }

        if envs.is_empty() {
            debug!("comprehension on {:?} yielded no environments", v);
            for arc in &ct.pending {
                if self.vertex(*arc).arc_type == ArcType::Pending {
                    self.vertex_mut(*arc).arc_type = ArcType::NotPresent;
                }
            }
            return Ok(());
        }

        debug!(
            "comprehension on {:?} yielded {} environment(s)",
            v,
            envs.len()
        );
        let ci = ct.ci.spawn_comprehension(self);
        for env in envs {
            self.add_conjunct(v, Conjunct::new(env, ct.body.clone(), ci.clone()));
        }
        Ok(())
    }

    fn apply_clause(
        &mut self,
        clause: &Clause,
        envs: Vec<Rc<Environment>>,
    ) -> Result<Vec<Rc<Environment>>, Rc<Bottom>> {
        let mut out = Vec::new();
        for env in envs {
            match clause {
                Clause::For {
                    key,
                    value,
                    source,
                    pos,
                } => {
                    let sv = self.eval_expr(&env, source);
                    if self.suspended() {
                        return Ok(out);
                    }
                    match sv {
                        Value::Vertex(src) => {
                            self.unify(src, FIELD_SET_KNOWN, RunMode::Yield);
                            if self.suspended() {
                                return Ok(out);
                            }
                            let arcs: Vec<VertexId> = self.vertex(src).arcs.clone();
                            for arc in arcs {
                                let f = self.vertex(arc).label;
                                if !f.is_regular()
                                    || self.vertex(arc).arc_type != ArcType::Member
                                {
                                    continue;
                                }
                                let key_val = if f.is_int() {
                                    Value::int(f.index() as i64)
                                } else {
                                    match self.runtime.index_to_string(f.index()) {
                                        Some(s) => Value::string(s),
                                        None => continue,
                                    }
                                };
                                let val = self.arc_value(arc);
                                let mut e2 = env.clone();
                                if let Some(k) = key {
                                    e2 = Environment::with_binding(&e2, *k, key_val);
                                }
                                e2 = Environment::with_binding(&e2, *value, val);
                                out.push(e2);
                            }
                        }
                        Value::Bottom(b) => return Err(b),
                        other => {
                            return Err(Rc::new(
                                Bottom::eval(format!("cannot range over {}", other))
                                    .with_pos(*pos),
                            ))
                        }
                    }
                }
                Clause::If { cond } => {
                    let cv = self.eval_expr(&env, cond);
                    if self.suspended() {
                        return Ok(out);
                    }
                    match cv {
                        Value::Bool(true) => out.push(env),
                        Value::Bool(false) => {}
                        Value::Bottom(b) => return Err(b),
                        other => {
                            return Err(Rc::new(Bottom::incomplete(format!(
                                "non-boolean condition {}",
                                other
                            ))))
                        }
                    }
                }
                Clause::Let { name, expr } => {
                    let bv = self.eval_expr(&env, expr);
                    if self.suspended() {
                        return Ok(out);
                    }
                    if let Value::Bottom(b) = bv {
                        return Err(b);
                    }
                    out.push(Environment::with_binding(&env, *name, bv));
                }
            }
        }
        Ok(out)
    }

    /// The value an arc contributes to an iteration binding.
    pub(crate) fn arc_value(&self, arc: VertexId) -> Value {
        if let Some(base) = &self.vertex(arc).base_value {
            if !matches!(base, Value::StructMarker | Value::ListMarker) {
                return base.clone();
            }
            return Value::Vertex(arc);
        }
        if let Some(state) = &self.vertex(arc).state {
            if let Some(s) = &state.scalar {
                return s.clone();
            }
        }
        Value::Vertex(arc)
    }
}
