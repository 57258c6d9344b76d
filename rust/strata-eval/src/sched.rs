//! The per-vertex cooperative task scheduler.
//!
//! Evaluation work runs as discrete tasks coordinated through 16-bit
//! condition bitmasks. Conditions in the counter mask use reference
//! counters: inserting a task that provides a condition increments its
//! counter, completion decrements it, and the transition to zero raises
//! the condition and signals blocked tasks. A task discovering a missing
//! dependency mid-run records `(blocked_on, block_condition)` and
//! returns; there are no stackful coroutines.
//!
//! Deadlocks (mutual waiting without progress) are resolved at finalize
//! by a two-phase unblocker: first the auto-unblock conditions are
//! frozen — states that are meaningful as soon as they can no longer be
//! refined — then remaining block conditions are frozen outright. Each
//! round freezes at least one condition, so finalization terminates.

use std::rc::Rc;

use log::{debug, trace};

use crate::closectx::{CcId, DepKind};
use crate::comprehension::CompTask;
use crate::context::OpContext;
use crate::errors::{combine, Bottom};
use crate::vertex::{Conjunct, VertexId, VertexStatus};

// ── Conditions ──────────────────────────────────────────────────────

pub type CondMask = u16;

pub const ALL_ANCESTORS_PROCESSED: CondMask = 1 << 0;
pub const ARC_TYPE_KNOWN: CondMask = 1 << 1;
pub const VALUE_KNOWN: CondMask = 1 << 2;
pub const SCALAR_KNOWN: CondMask = 1 << 3;
pub const FIELD_CONJUNCTS_KNOWN: CondMask = 1 << 4;
pub const FIELD_SET_KNOWN: CondMask = 1 << 5;

pub const ALL_KNOWN: CondMask = (1 << NUM_CONDITIONS) - 1;
pub const NUM_CONDITIONS: usize = 6;

/// Conditions tracked by reference counters.
pub const COUNTER_MASK: CondMask =
    VALUE_KNOWN | SCALAR_KNOWN | FIELD_CONJUNCTS_KNOWN | FIELD_SET_KNOWN;

/// Conditions promoted in phase one of the deadlock unblocker: once no
/// task can refine them further, the current state is the answer.
pub const AUTO_UNBLOCK: CondMask = SCALAR_KNOWN | FIELD_SET_KNOWN;

fn bits(mask: CondMask) -> impl Iterator<Item = usize> {
    (0..NUM_CONDITIONS).filter(move |i| mask & (1 << i) != 0)
}

// ── Run modes and states ────────────────────────────────────────────

/// How far a `process` call is willing to go to meet its needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Do not run anything; only check.
    Ignore,
    /// Run ready tasks but never suspend the caller.
    AttemptOnly,
    /// Suspend the current task if the needs cannot be met yet.
    Yield,
    /// Drive to completion, breaking deadlocks.
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedState {
    #[default]
    Ready,
    Running,
    Finalizing,
    Done,
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

/// The runner of a task. Dispatch is a closed enum: the set of runners
/// is fixed, and an enum keeps the task record inspectable.
#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Evaluate one conjunct into the node state.
    EvalConjunct(Conjunct),
    /// Drive a comprehension to yield environments.
    ProcessComprehension(CompTask),
    /// Expand the registered disjunctions by cross product.
    HandleDisjunctions,
}

/// One unit of evaluation work for a vertex.
#[derive(Debug)]
pub struct Task {
    pub vertex: VertexId,
    pub kind: TaskKind,
    /// Conditions this task asserts on success.
    pub completes: CondMask,
    /// Conditions required before it may run.
    pub needs: CondMask,
    pub state: TaskState,
    pub blocked_on: Option<VertexId>,
    pub block_condition: CondMask,
    pub err: Option<Rc<Bottom>>,
}

impl Task {
    fn cc(&self) -> Option<CcId> {
        match &self.kind {
            TaskKind::EvalConjunct(c) => c.ci.cc,
            TaskKind::ProcessComprehension(ct) => ct.ci.cc,
            TaskKind::HandleDisjunctions => None,
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

/// The task queue and condition state for one vertex.
#[derive(Debug, Default)]
pub struct Scheduler {
    pub tasks: Vec<TaskId>,
    pub counters: [u32; NUM_CONDITIONS],
    pub completed: CondMask,
    pub frozen: CondMask,
    /// Conditions some queued task may complete.
    pub provided: CondMask,
    /// Conditions some queued task depends on.
    pub needs: CondMask,
    /// Tasks of other schedulers waiting on conditions of this one.
    pub blocking: Vec<TaskId>,
    pub state: SchedState,
}

impl Scheduler {
    /// Conditions that hold, by completion or by freezing.
    pub fn known(&self) -> CondMask {
        self.completed | self.frozen
    }

    pub fn meets(&self, needs: CondMask) -> bool {
        needs & !self.known() == 0
    }
}

// ── Scheduler operations ────────────────────────────────────────────

impl OpContext {
    /// Insert a task for `v`, registering its counters. The vertex must
    /// already be scheduled.
    pub fn insert_task(
        &mut self,
        v: VertexId,
        kind: TaskKind,
        completes: CondMask,
        needs: CondMask,
    ) -> TaskId {
        debug_assert!(completes & !ALL_KNOWN == 0 && needs & !ALL_KNOWN == 0);
        let tid = TaskId(self.tasks.len() as u32);
        let task = Task {
            vertex: v,
            kind,
            completes,
            needs,
            state: TaskState::Ready,
            blocked_on: None,
            block_condition: 0,
            err: None,
        };
        if let Some(cc) = task.cc() {
            self.inc_dependent(cc, DepKind::Task, tid.0);
        }
        self.tasks.push(task);
        let finalizing;
        {
            let sched = self.sched_mut(v);
            finalizing = sched.state == SchedState::Finalizing;
            sched.tasks.push(tid);
            sched.provided |= completes;
            sched.needs |= needs;
            for i in bits(completes & COUNTER_MASK) {
                if sched.counters[i] == 0 && !finalizing {
                    // Re-arm a condition that had settled.
                    sched.completed &= !(1 << i);
                }
                sched.counters[i] += 1;
            }
        }
        trace!("task {:?} inserted on vertex {:?}", tid, v);
        tid
    }

    pub(crate) fn sched(&self, v: VertexId) -> &Scheduler {
        &self
            .vertex(v)
            .state
            .as_ref()
            .expect("vertex not scheduled")
            .scheduler
    }

    pub(crate) fn sched_mut(&mut self, v: VertexId) -> &mut Scheduler {
        &mut self
            .vertex_mut(v)
            .state
            .as_mut()
            .expect("vertex not scheduled")
            .scheduler
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.task_stack.last().copied()
    }

    /// True if the task currently on top of the stack has suspended.
    pub fn suspended(&self) -> bool {
        self.current_task()
            .map(|t| self.tasks[t.0 as usize].state == TaskState::Waiting)
            .unwrap_or(false)
    }

    pub fn task(&self, t: TaskId) -> &Task {
        &self.tasks[t.0 as usize]
    }

    pub(crate) fn task_mut(&mut self, t: TaskId) -> &mut Task {
        &mut self.tasks[t.0 as usize]
    }

    /// Suspend the current task until `cond` holds on `on`.
    pub fn wait_for(&mut self, tid: TaskId, on: VertexId, cond: CondMask) {
        debug_assert!(cond != 0);
        debug!(
            "task {:?} waiting on vertex {:?} for {:#08b}",
            tid, on, cond
        );
        {
            let t = self.task_mut(tid);
            t.blocked_on = Some(on);
            t.block_condition = cond;
            t.state = TaskState::Waiting;
        }
        self.sched_mut(on).blocking.push(tid);
        self.blocked_tasks.push(tid);
    }

    fn unblock_task(&mut self, tid: TaskId) {
        let on = self.task(tid).blocked_on;
        if let Some(on) = on {
            if self.vertex(on).state.is_some() {
                self.sched_mut(on).blocking.retain(|&t| t != tid);
            }
        }
        self.blocked_tasks.retain(|&t| t != tid);
        let t = self.task_mut(tid);
        t.blocked_on = None;
        t.block_condition = 0;
        t.state = TaskState::Ready;
    }

    /// Run one task to completion or suspension.
    pub(crate) fn run_task(&mut self, tid: TaskId) {
        let kind = self.task(tid).kind.clone();
        self.task_mut(tid).state = TaskState::Running;
        self.task_stack.push(tid);
        trace!("task {:?} running (depth {})", tid, self.task_stack.len());
        let result = match kind {
            TaskKind::EvalConjunct(c) => self.task_eval_conjunct(tid, c),
            TaskKind::ProcessComprehension(ct) => self.task_comprehension(tid, ct),
            TaskKind::HandleDisjunctions => self.task_disjunctions(tid),
        };
        self.task_stack.pop();
        if self.task(tid).state == TaskState::Waiting {
            // Suspended: counters stay registered until the re-run.
            return;
        }
        match result {
            Ok(()) => self.finish_task(tid, TaskState::Success, None),
            Err(b) => self.finish_task(tid, TaskState::Failed, Some(b)),
        }
    }

    pub(crate) fn finish_task(&mut self, tid: TaskId, state: TaskState, err: Option<Rc<Bottom>>) {
        let v = self.task(tid).vertex;
        self.task_mut(tid).state = state;
        if let Some(b) = err {
            trace!("task {:?} failed: {}", tid, b);
            self.task_mut(tid).err = Some(b.clone());
            // Failure does not propagate to sibling tasks; the error is
            // recorded on the node.
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
        if let Some(cc) = self.task(tid).cc() {
            self.dec_dependent(cc, DepKind::Task, tid.0);
        }
        // Decrement completion counters; zero transitions raise bits.
        let completes = self.task(tid).completes & COUNTER_MASK;
        let mut gained = 0;
        {
            let sched = self.sched_mut(v);
            for i in bits(completes) {
                debug_assert!(sched.counters[i] > 0);
                sched.counters[i] -= 1;
                if sched.counters[i] == 0 && sched.completed & (1 << i) == 0 {
                    sched.completed |= 1 << i;
                    gained |= 1 << i;
                }
            }
        }
        if gained != 0 {
            self.signal(v);
        }
    }

    /// Called when `v` gained conditions: immediately re-run every task
    /// blocked on conditions that now hold.
    pub fn signal(&mut self, v: VertexId) {
        loop {
            let known = self.sched(v).known();
            let next = self
                .sched(v)
                .blocking
                .iter()
                .copied()
                .find(|&t| {
                    self.task(t).state == TaskState::Waiting
                        && self.task(t).block_condition & !known == 0
                });
            match next {
                Some(t) => {
                    debug!("task {:?} unblocked by vertex {:?}", t, v);
                    self.unblock_task(t);
                    self.run_task(t);
                }
                None => break,
            }
        }
    }

    /// Raise conditions without completing them; frozen conditions
    /// answer with their current state and reject refinement.
    pub fn freeze(&mut self, v: VertexId, mask: CondMask) {
        if self.vertex(v).state.is_none() || self.vertex(v).status == VertexStatus::Finalized {
            return;
        }
        let sched = self.sched_mut(v);
        let new = mask & !sched.frozen;
        if new == 0 {
            return;
        }
        sched.frozen |= new;
        debug!("vertex {:?} froze {:#08b}", v, new);
        self.signal(v);
    }

    /// Run ready tasks of `v` whose needs are met.
    fn run_ready(&mut self, v: VertexId) -> bool {
        let mut progressed = false;
        loop {
            let known = self.sched(v).known();
            let next = self
                .sched(v)
                .tasks
                .iter()
                .copied()
                .find(|&t| {
                    self.task(t).state == TaskState::Ready && self.task(t).needs & !known == 0
                });
            match next {
                Some(t) => {
                    self.run_task(t);
                    progressed = true;
                }
                None => break,
            }
        }
        progressed
    }

    /// Bring the scheduler of `v` to at least `needs`, as far as `mode`
    /// allows. Returns true if the needs are met.
    pub fn process(&mut self, v: VertexId, needs: CondMask, mode: RunMode) -> bool {
        if self.vertex(v).status == VertexStatus::Finalized {
            return true;
        }
        if mode == RunMode::Ignore {
            return self.sched(v).meets(needs);
        }
        if self.sched(v).state == SchedState::Ready {
            self.sched_mut(v).state = SchedState::Running;
        }
        self.run_ready(v);
        if self.sched(v).meets(needs) {
            return true;
        }
        match mode {
            RunMode::Yield => {
                if let Some(cur) = self.current_task() {
                    let mut missing = needs & !self.sched(v).known();
                    if self.task(cur).vertex == v {
                        // Waiting on one's own scheduler is only useful
                        // for conditions the unblocker can promote.
                        missing &= AUTO_UNBLOCK;
                    }
                    if missing != 0 {
                        self.wait_for(cur, v, missing);
                    }
                }
                false
            }
            RunMode::Finalize => {
                self.finalize_sched(v, needs);
                self.sched(v).meets(needs)
            }
            _ => false,
        }
    }

    /// The two-phase deadlock unblocker, run at finalize.
    pub(crate) fn finalize_sched(&mut self, v: VertexId, _needs: CondMask) {
        if self.vertex(v).state.is_none() {
            return;
        }
        self.sched_mut(v).state = SchedState::Finalizing;
        loop {
            self.run_ready(v);
            self.blocked_tasks
                .retain(|&t| matches!(self.tasks[t.0 as usize].state, TaskState::Waiting));
            if self.blocked_tasks.is_empty() {
                break;
            }

            // Phase one: promote states that are meaningful once they
            // are known not to change further.
            let mut progressed = false;
            let snapshot: Vec<TaskId> = self.blocked_tasks.clone();
            for tid in &snapshot {
                if self.task(*tid).state != TaskState::Waiting {
                    continue;
                }
                if let Some(on) = self.task(*tid).blocked_on {
                    if self.vertex(on).state.is_none() {
                        continue;
                    }
                    let promote = AUTO_UNBLOCK & !self.sched(on).known();
                    if promote != 0 {
                        self.freeze(on, promote);
                        progressed = true;
                    }
                }
            }
            if progressed {
                continue;
            }

            // Phase two: freeze the remaining block conditions outright
            // and re-run the tasks.
            let snapshot: Vec<TaskId> = self.blocked_tasks.clone();
            for tid in snapshot {
                if self.task(tid).state != TaskState::Waiting {
                    continue;
                }
                if let Some(on) = self.task(tid).blocked_on {
                    let cond = self.task(tid).block_condition;
                    if self.vertex(on).state.is_some() {
                        self.freeze(on, cond);
                        progressed = true;
                    } else {
                        self.unblock_task(tid);
                        self.run_task(tid);
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        self.run_ready(v);
        self.sched_mut(v).state = SchedState::Done;
    }
}
