//! The operation context.
//!
//! One context per root evaluation. It owns the arenas for vertices,
//! close contexts and tasks, the runtime (string interning, imports,
//! native types), and the shared caches. Everything is mutated only on
//! the evaluator's thread; in a multi-tenant embedding a context is
//! created per root evaluation and discarded with it.

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::sync::Lazy;
use regex::Regex;

use strata_core::strings::Runtime;

use crate::closectx::CloseContext;
use crate::errors::Bottom;
use crate::expr::ExprRef;
use crate::reqsets::DefId;
use crate::sched::{Task, TaskId};
use crate::vertex::{NodeState, Vertex, VertexId};

/// The sentinel substituted for a pattern that failed to compile: after
/// the error has been reported once, the pattern matches nothing.
static MATCH_NOTHING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\s\S]").expect("sentinel pattern"));

pub fn match_nothing() -> &'static Regex {
    &MATCH_NOTHING
}

/// Evaluator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compare optional fields and closedness in structural equality.
    pub check_structural: bool,
    /// Recursion bound; exceeding it reports a structural cycle.
    pub max_depth: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            check_structural: false,
            max_depth: 1024,
        }
    }
}

/// The evaluation context: arenas, runtime, caches.
pub struct OpContext {
    pub runtime: Runtime,
    pub config: Config,

    pub(crate) vertices: Vec<Vertex>,
    pub(crate) ccs: Vec<CloseContext>,
    pub(crate) tasks: Vec<Task>,

    /// Currently running tasks; depth equals evaluator recursion depth.
    pub(crate) task_stack: Vec<TaskId>,
    /// All tasks currently in WAITING state, across schedulers.
    pub(crate) blocked_tasks: Vec<TaskId>,

    pub(crate) next_def_id: u32,
    pub(crate) next_hole_id: u32,
    /// Nesting depth of disjunction evaluation; nested disjunctions may
    /// not finalize while an ancestor runs attempt-only.
    pub(crate) disjunct_depth: u32,
    pub(crate) depth: u32,

    regex_cache: HashMap<String, Result<Rc<Regex>, Rc<Bottom>>>,
    /// Shared handle for patterns replaced by the sentinel.
    regex_sentinel: Option<Rc<Regex>>,
    imports: HashMap<String, VertexId>,
    native_types: HashMap<String, ExprRef>,

    #[cfg(feature = "ccdebug")]
    pub on_vertex: Option<fn(&OpContext, VertexId)>,
    #[cfg(feature = "ccdebug")]
    pub on_cc: Option<fn(&OpContext, crate::closectx::CcId)>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OpContext {
    pub fn new() -> OpContext {
        OpContext::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> OpContext {
        OpContext {
            runtime: Runtime::new(),
            config,
            vertices: Vec::new(),
            ccs: Vec::new(),
            tasks: Vec::new(),
            task_stack: Vec::new(),
            blocked_tasks: Vec::new(),
            next_def_id: 0,
            next_hole_id: 0,
            disjunct_depth: 0,
            depth: 0,
            regex_cache: HashMap::new(),
            regex_sentinel: None,
            imports: HashMap::new(),
            native_types: HashMap::new(),
            #[cfg(feature = "ccdebug")]
            on_vertex: None,
            #[cfg(feature = "ccdebug")]
            on_cc: None,
        }
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0 as usize]
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        &mut self.vertices[id.0 as usize]
    }

    /// The evaluation state of a scheduled vertex.
    pub(crate) fn node(&self, id: VertexId) -> &NodeState {
        self.vertex(id).state.as_deref().expect("vertex not scheduled")
    }

    pub(crate) fn node_mut(&mut self, id: VertexId) -> &mut NodeState {
        self.vertex_mut(id)
            .state
            .as_deref_mut()
            .expect("vertex not scheduled")
    }

    /// A fresh schema-invocation id.
    pub fn new_def_id(&mut self) -> DefId {
        self.next_def_id += 1;
        DefId(self.next_def_id)
    }

    pub fn new_hole_id(&mut self) -> u32 {
        self.next_hole_id += 1;
        self.next_hole_id
    }

    /// Compile and cache a regular expression. A compilation failure is
    /// reported exactly once; the failed pattern is then replaced by the
    /// match-nothing sentinel, so repeated evaluation is idempotent.
    pub fn compile_regex(&mut self, pattern: &str) -> Result<Rc<Regex>, Rc<Bottom>> {
        match self.regex_cache.get(pattern) {
            Some(Ok(re)) => return Ok(re.clone()),
            Some(Err(_)) => {
                let re = self
                    .regex_sentinel
                    .get_or_insert_with(|| Rc::new(match_nothing().clone()))
                    .clone();
                return Ok(re);
            }
            None => {}
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Ok(Rc::new(re)),
            Err(e) => Err(Rc::new(Bottom::eval(format!(
                "error parsing regexp: {}",
                e
            )))),
        };
        self.regex_cache
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }

    /// Register an import-path → vertex binding supplied by the loader.
    pub fn register_import(&mut self, path: impl Into<String>, v: VertexId) {
        self.imports.insert(path.into(), v);
    }

    pub fn resolve_import(&self, path: &str) -> Option<VertexId> {
        self.imports.get(path).copied()
    }

    /// Native-type ↔ expression cache.
    pub fn register_native_type(&mut self, name: impl Into<String>, e: ExprRef) {
        self.native_types.insert(name.into(), e);
    }

    pub fn native_type(&self, name: &str) -> Option<&ExprRef> {
        self.native_types.get(name)
    }

    #[cfg(feature = "ccdebug")]
    pub(crate) fn hook_vertex(&self, v: VertexId) {
        if let Some(hook) = self.on_vertex {
            hook(self, v);
        }
    }

    #[cfg(not(feature = "ccdebug"))]
    #[inline(always)]
    pub(crate) fn hook_vertex(&self, _v: VertexId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_patterns_degrade_to_match_nothing() {
        let mut ctx = OpContext::new();
        let err = ctx.compile_regex("(").unwrap_err();
        assert!(err.err.contains("error parsing regexp"));
        // Reported once; from then on the pattern is the sentinel.
        let re = ctx.compile_regex("(").unwrap();
        assert!(re.find("anything").is_none());
        assert!(!re.is_match(""));
        let again = ctx.compile_regex("(").unwrap();
        assert!(Rc::ptr_eq(&re, &again));
    }

    #[test]
    fn regex_cache_reuses_compilations() {
        let mut ctx = OpContext::new();
        let r1 = ctx.compile_regex("^a+$").unwrap();
        let r2 = ctx.compile_regex("^a+$").unwrap();
        assert!(Rc::ptr_eq(&r1, &r2));
        assert!(r1.is_match("aaa"));
    }

    #[test]
    fn def_ids_are_fresh_and_nonzero() {
        let mut ctx = OpContext::new();
        let a = ctx.new_def_id();
        let b = ctx.new_def_id();
        assert!(!a.is_none());
        assert_ne!(a, b);
    }
}
