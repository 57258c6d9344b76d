//! The close-context graph.
//!
//! A close context (cc) records the schema provenance of all conjuncts
//! sharing an origin. Contexts form a forest (parent/child/next) that is
//! walked when a closed schema completes, plus operational dependencies
//! tracked as reference counts. Contexts live in an arena on the
//! operation context and refer to each other by id, never by pointer.
//!
//! Counting discipline: every increment carries a dependency kind and a
//! dependant token, and must be matched by exactly one decrement with
//! the same pair. When the count reaches zero the context is *done* and
//! never re-entered.

use log::trace;

use strata_core::feature::Feature;

use crate::context::OpContext;
use crate::reqsets::DefId;
use crate::value::Value;
use crate::vertex::VertexId;

/// Index of a close context in the operation-context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CcId(pub u32);

/// Why a dependency on a close context exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// A child context holds its parent.
    Parent,
    /// A dependent context reachable through an arc.
    Arc,
    /// A notification edge to another context.
    Notify,
    /// A scheduled task evaluating a conjunct of this context.
    Task,
    /// A disjunction hole.
    Disjunct,
    /// Keeps a context alive until its conjunct has been scheduled.
    Eval,
    /// A pending comprehension.
    Comp,
    /// The root conjunct of a vertex.
    Root,
    /// Held during initialization of a spawned context.
    Init,
    /// Deferred work registered by the scheduler.
    Defer,
    /// A shared (referenced) sub-vertex.
    Shared,
    /// Test-only dependency.
    Test,
}

pub const NUM_DEP_KINDS: usize = 12;

impl DepKind {
    fn index(self) -> usize {
        match self {
            DepKind::Parent => 0,
            DepKind::Arc => 1,
            DepKind::Notify => 2,
            DepKind::Task => 3,
            DepKind::Disjunct => 4,
            DepKind::Eval => 5,
            DepKind::Comp => 6,
            DepKind::Root => 7,
            DepKind::Init => 8,
            DepKind::Defer => 9,
            DepKind::Shared => 10,
            DepKind::Test => 11,
        }
    }
}

/// One entry of the dependency log kept for balance checking.
#[cfg(feature = "ccdebug")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcDep {
    pub kind: DepKind,
    pub dependant: u32,
    pub increment: bool,
}

/// A node of the close-context forest.
#[derive(Debug, Default)]
pub struct CloseContext {
    pub parent: Option<CcId>,
    /// First child; siblings chain through `next`.
    pub child: Option<CcId>,
    pub next: Option<CcId>,

    /// Total outstanding dependencies; zero means done.
    pub conjunct_count: u32,
    dep_counts: [u32; NUM_DEP_KINDS],

    pub is_def: bool,
    pub is_embed: bool,
    pub is_closed: bool,
    /// Admits all fields (an ellipsis or open validator was seen).
    pub is_total: bool,
    pub done: bool,

    /// Schema identity of this context.
    pub def_id: DefId,
    /// Nonzero for disjunction holes.
    pub hole_id: u32,

    /// Dependent close contexts keyed by the vertex that links them.
    pub arcs: Vec<(VertexId, CcId)>,
    pub notify: Vec<CcId>,

    /// Pattern constraints aggregated while open; monotone.
    pub patterns: Vec<Value>,
    /// Labels this schema admits.
    pub allowed: Vec<Feature>,
    /// The finalized allowed-field expression, set when done.
    pub expr: Option<Value>,

    /// The dependant token of the EVAL dependency, so the scheduler can
    /// release it as soon as no further scheduling is possible.
    pub needs_close_in_schedule: Option<u32>,

    #[cfg(feature = "ccdebug")]
    pub dep_log: Vec<CcDep>,
}

impl CloseContext {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Record a label admitted by this schema. Monotone; duplicates are
    /// dropped.
    pub fn admit(&mut self, f: Feature) {
        if !self.allowed.contains(&f) {
            self.allowed.push(f);
        }
    }

    /// Aggregate a pattern. Monotone.
    pub fn add_pattern(&mut self, p: Value) {
        if !self.patterns.contains(&p) {
            self.patterns.push(p);
        }
    }
}

impl OpContext {
    /// Allocate a fresh root context (no parent).
    pub fn new_cc(&mut self) -> CcId {
        let id = CcId(self.ccs.len() as u32);
        self.ccs.push(CloseContext::default());
        id
    }

    /// Create a child context and take the PARENT dependency on behalf
    /// of the child.
    pub fn spawn_cc(&mut self, parent: CcId, is_def: bool, is_embed: bool, is_closed: bool) -> CcId {
        let id = self.new_cc();
        {
            let cc = self.cc_mut(id);
            cc.parent = Some(parent);
            cc.is_def = is_def;
            cc.is_embed = is_embed;
            cc.is_closed = is_closed;
        }
        // Link into the parent's child list.
        let first = self.cc(parent).child;
        self.cc_mut(id).next = first;
        self.cc_mut(parent).child = Some(id);
        self.inc_dependent(parent, DepKind::Parent, id.0);
        id
    }

    pub fn cc(&self, id: CcId) -> &CloseContext {
        &self.ccs[id.0 as usize]
    }

    pub fn cc_mut(&mut self, id: CcId) -> &mut CloseContext {
        &mut self.ccs[id.0 as usize]
    }

    pub fn inc_dependent(&mut self, id: CcId, kind: DepKind, dependant: u32) {
        let cc = self.cc_mut(id);
        debug_assert!(!cc.done, "increment on a done close context");
        cc.conjunct_count += 1;
        cc.dep_counts[kind.index()] += 1;
        #[cfg(feature = "ccdebug")]
        cc.dep_log.push(CcDep {
            kind,
            dependant,
            increment: true,
        });
        let _ = dependant;
        trace!("cc {:?} +{:?} -> {}", id, kind, cc.conjunct_count);
    }

    /// Release one dependency. On the transition to zero the context is
    /// finalized: children reachable through arcs and notifications are
    /// released, the pattern expression is finalized, closedness is
    /// injected into the parent, and the PARENT link is dropped.
    pub fn dec_dependent(&mut self, id: CcId, kind: DepKind, dependant: u32) {
        {
            let cc = self.cc_mut(id);
            debug_assert!(!cc.done, "decrement on a done close context");
            debug_assert!(
                cc.dep_counts[kind.index()] > 0,
                "unbalanced {:?} decrement on cc {}",
                kind,
                id.0
            );
            debug_assert!(cc.conjunct_count > 0);
            cc.conjunct_count -= 1;
            cc.dep_counts[kind.index()] -= 1;
            #[cfg(feature = "ccdebug")]
            cc.dep_log.push(CcDep {
                kind,
                dependant,
                increment: false,
            });
            let _ = dependant;
            trace!("cc {:?} -{:?} -> {}", id, kind, cc.conjunct_count);
        }
        if self.cc(id).conjunct_count == 0 {
            self.finalize_cc(id);
        }
    }

    fn finalize_cc(&mut self, id: CcId) {
        debug_assert!(!self.cc(id).done, "close context finalized twice");
        self.cc_mut(id).done = true;
        trace!("cc {:?} done", id);

        // Release dependent contexts recorded through arcs and notify
        // edges. Notifications are drained here, at completion, rather
        // than force-decremented earlier.
        let arcs = std::mem::take(&mut self.cc_mut(id).arcs);
        for (v, dep) in arcs {
            self.dec_dependent(dep, DepKind::Arc, v.0);
        }
        let notify = std::mem::take(&mut self.cc_mut(id).notify);
        for dep in notify {
            self.dec_dependent(dep, DepKind::Notify, id.0);
        }

        // Finalize the pattern expression.
        let patterns = self.cc(id).patterns.clone();
        if !patterns.is_empty() {
            let expr = if patterns.len() == 1 {
                patterns[0].clone()
            } else {
                Value::disjunction(patterns, 0)
            };
            self.cc_mut(id).expr = Some(expr);
        }

        if let Some(parent) = self.cc(id).parent {
            if self.cc(id).is_closed && !self.cc(id).is_embed {
                self.inject_closed(id, parent);
            }
            self.dec_dependent(parent, DepKind::Parent, id.0);
        }

        #[cfg(feature = "ccdebug")]
        if let Some(hook) = self.on_cc {
            hook(self, id);
        }
    }

    /// Propagate a completed closed schema into its parent: the parent
    /// becomes closed and admits exactly the labels and patterns the
    /// child admitted (in addition to its own).
    fn inject_closed(&mut self, child: CcId, parent: CcId) {
        debug_assert!(self.cc(child).done);
        if self.cc(parent).is_total {
            return;
        }
        let labels = self.cc(child).allowed.clone();
        let patterns = self.cc(child).patterns.clone();
        let p = self.cc_mut(parent);
        p.is_closed = true;
        for f in labels {
            if !p.allowed.contains(&f) {
                p.allowed.push(f);
            }
        }
        for pat in patterns {
            if !p.patterns.contains(&pat) {
                p.patterns.push(pat);
            }
        }
    }

    /// Record a notification edge: `to` is held alive until `from`
    /// completes.
    pub fn cc_notify(&mut self, from: CcId, to: CcId) {
        self.inc_dependent(to, DepKind::Notify, from.0);
        self.cc_mut(from).notify.push(to);
    }

    /// Record an arc-linked dependent context.
    pub fn cc_arc(&mut self, from: CcId, vertex: VertexId, to: CcId) {
        self.inc_dependent(to, DepKind::Arc, vertex.0);
        self.cc_mut(from).arcs.push((vertex, to));
    }

    /// Release the EVAL dependency as soon as the scheduler has proven
    /// there will be no further scheduling for the conjunct.
    pub fn release_eval_dep(&mut self, id: CcId) {
        if let Some(dependant) = self.cc_mut(id).needs_close_in_schedule.take() {
            self.dec_dependent(id, DepKind::Eval, dependant);
        }
    }

    /// Does this (closed) context admit the label?
    pub fn cc_allows(&self, id: CcId, f: Feature) -> bool {
        let cc = self.cc(id);
        if !cc.is_closed || cc.is_total || f.allowed_in_closed() {
            return true;
        }
        cc.allowed.contains(&f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::feature::FeatureType;

    fn label(i: u32) -> Feature {
        Feature::make(i, FeatureType::StringLabel).unwrap()
    }

    #[test]
    fn done_exactly_once_at_zero() {
        let mut ctx = OpContext::new();
        let cc = ctx.new_cc();
        ctx.inc_dependent(cc, DepKind::Root, 1);
        ctx.inc_dependent(cc, DepKind::Task, 2);
        ctx.dec_dependent(cc, DepKind::Task, 2);
        assert!(!ctx.cc(cc).is_done());
        ctx.dec_dependent(cc, DepKind::Root, 1);
        assert!(ctx.cc(cc).is_done());
    }

    #[test]
    fn spawn_holds_parent_until_child_done() {
        let mut ctx = OpContext::new();
        let root = ctx.new_cc();
        ctx.inc_dependent(root, DepKind::Root, 0);
        let child = ctx.spawn_cc(root, true, false, true);
        ctx.inc_dependent(child, DepKind::Task, 9);
        // Root holds two deps: ROOT and the child's PARENT.
        ctx.dec_dependent(root, DepKind::Root, 0);
        assert!(!ctx.cc(root).is_done());
        ctx.dec_dependent(child, DepKind::Task, 9);
        assert!(ctx.cc(child).is_done());
        assert!(ctx.cc(root).is_done());
    }

    #[test]
    fn inject_closed_merges_allowed_labels() {
        let mut ctx = OpContext::new();
        let root = ctx.new_cc();
        ctx.inc_dependent(root, DepKind::Root, 0);
        let child = ctx.spawn_cc(root, true, false, true);
        ctx.inc_dependent(child, DepKind::Task, 1);
        ctx.cc_mut(child).admit(label(1));
        ctx.cc_mut(child).admit(label(2));
        ctx.dec_dependent(child, DepKind::Task, 1);
        assert!(ctx.cc(root).is_closed);
        assert!(ctx.cc_allows(root, label(1)));
        assert!(!ctx.cc_allows(root, label(3)));
        ctx.dec_dependent(root, DepKind::Root, 0);
    }

    #[test]
    fn embeds_do_not_inject() {
        let mut ctx = OpContext::new();
        let root = ctx.new_cc();
        ctx.inc_dependent(root, DepKind::Root, 0);
        let child = ctx.spawn_cc(root, false, true, true);
        ctx.inc_dependent(child, DepKind::Task, 1);
        ctx.cc_mut(child).admit(label(1));
        ctx.dec_dependent(child, DepKind::Task, 1);
        assert!(ctx.cc(child).is_done());
        assert!(!ctx.cc(root).is_closed);
        ctx.dec_dependent(root, DepKind::Root, 0);
    }

    #[test]
    fn notify_edges_drain_on_completion() {
        let mut ctx = OpContext::new();
        let a = ctx.new_cc();
        let b = ctx.new_cc();
        ctx.inc_dependent(a, DepKind::Root, 0);
        ctx.inc_dependent(b, DepKind::Root, 0);
        ctx.cc_notify(a, b);
        ctx.dec_dependent(b, DepKind::Root, 0);
        assert!(!ctx.cc(b).is_done(), "notify edge still holds b");
        ctx.dec_dependent(a, DepKind::Root, 0);
        assert!(ctx.cc(a).is_done());
        assert!(ctx.cc(b).is_done());
    }

    #[cfg(feature = "ccdebug")]
    #[test]
    fn dep_log_is_balanced() {
        let mut ctx = OpContext::new();
        let cc = ctx.new_cc();
        ctx.inc_dependent(cc, DepKind::Test, 5);
        ctx.dec_dependent(cc, DepKind::Test, 5);
        let log = &ctx.cc(cc).dep_log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, DepKind::Test);
        assert!(log[0].increment);
        assert!(!log[1].increment);
        assert_eq!(log[0].dependant, log[1].dependant);
    }
}
