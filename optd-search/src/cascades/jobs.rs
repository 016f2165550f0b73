// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Jobs are the units of search work. Each job owns a state machine; the scheduler calls
//! [`Job::execute`] which drives the machine until the job completes or suspends on children.
//!
//! Jobs live in a [`JobArena`] for the duration of a run and refer to each other by [`JobId`].

use std::cell::Cell;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::trace;

use super::jsm::MachineStatus;
use super::memo::{ExprId, GroupId, GroupPhase, JobRequest, Memo};
use super::scheduler::{JobTrace, SchedulerContext};
use crate::error::Result;
use crate::nodes::NodeType;
use crate::rules::{Rule, RuleId};

mod expr_exploration;
mod expr_implementation;
#[cfg(test)]
mod faulty;
mod group_exploration;
mod group_implementation;
mod transformation;

pub use expr_exploration::{ExprExplorationEvent, ExprExplorationJob, ExprExplorationState};
pub use expr_implementation::{
    ExprImplementationEvent, ExprImplementationJob, ExprImplementationState,
};
pub use group_exploration::{GroupExplorationEvent, GroupExplorationJob, GroupExplorationState};
pub use group_implementation::{
    GroupImplementationEvent, GroupImplementationJob, GroupImplementationState,
};
pub use transformation::{TransformationEvent, TransformationJob, TransformationState};

#[cfg(test)]
pub(crate) use faulty::{Fault, FaultyJob};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize)]
pub struct JobId(pub usize);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "J{}", self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumCount,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    GroupExploration,
    ExprExploration,
    GroupImplementation,
    ExprImplementation,
    Transformation,
}

/// The memo entity a job works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobTarget {
    Group(GroupId),
    Expr(ExprId),
    Rule(ExprId, RuleId),
}

impl Display for JobTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Group(group_id) => write!(f, "{group_id}"),
            Self::Expr(expr_id) => write!(f, "{expr_id}"),
            Self::Rule(expr_id, rule_id) => write!(f, "{expr_id},R{rule_id}"),
        }
    }
}

/// All job kinds, one variant each.
#[derive(Debug)]
pub enum Job {
    GroupExploration(GroupExplorationJob),
    ExprExploration(ExprExplorationJob),
    GroupImplementation(GroupImplementationJob),
    ExprImplementation(ExprImplementationJob),
    Transformation(TransformationJob),
    #[cfg(test)]
    Faulty(FaultyJob),
}

impl Job {
    pub fn for_group(group_id: GroupId, phase: GroupPhase) -> Self {
        match phase {
            GroupPhase::Exploration => Self::GroupExploration(GroupExplorationJob::new(group_id)),
            GroupPhase::Implementation => {
                Self::GroupImplementation(GroupImplementationJob::new(group_id))
            }
        }
    }

    pub fn for_expr(expr_id: ExprId, phase: GroupPhase) -> Self {
        match phase {
            GroupPhase::Exploration => Self::ExprExploration(ExprExplorationJob::new(expr_id)),
            GroupPhase::Implementation => {
                Self::ExprImplementation(ExprImplementationJob::new(expr_id))
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::GroupExploration(_) => JobKind::GroupExploration,
            Self::ExprExploration(_) => JobKind::ExprExploration,
            Self::GroupImplementation(_) => JobKind::GroupImplementation,
            Self::ExprImplementation(_) => JobKind::ExprImplementation,
            Self::Transformation(_) => JobKind::Transformation,
            #[cfg(test)]
            Self::Faulty(_) => JobKind::Transformation,
        }
    }

    pub fn target(&self) -> JobTarget {
        match self {
            Self::GroupExploration(job) => JobTarget::Group(job.group_id()),
            Self::ExprExploration(job) => JobTarget::Expr(job.expr_id()),
            Self::GroupImplementation(job) => JobTarget::Group(job.group_id()),
            Self::ExprImplementation(job) => JobTarget::Expr(job.expr_id()),
            Self::Transformation(job) => JobTarget::Rule(job.expr_id(), job.rule_id()),
            #[cfg(test)]
            Self::Faulty(job) => JobTarget::Group(job.group_id()),
        }
    }

    /// Group jobs are registered in their group's job queue and must release it when done.
    pub(crate) fn group_phase(&self) -> Option<(GroupId, GroupPhase)> {
        match self {
            Self::GroupExploration(job) => Some((job.group_id(), GroupPhase::Exploration)),
            Self::GroupImplementation(job) => Some((job.group_id(), GroupPhase::Implementation)),
            _ => None,
        }
    }

    /// Expression jobs claim a group member for one phase.
    pub(crate) fn expr_phase(&self) -> Option<(ExprId, GroupPhase)> {
        match self {
            Self::ExprExploration(job) => Some((job.expr_id(), GroupPhase::Exploration)),
            Self::ExprImplementation(job) => Some((job.expr_id(), GroupPhase::Implementation)),
            _ => None,
        }
    }

    pub fn state_name(&self) -> String {
        match self {
            Self::GroupExploration(job) => job.state().to_string(),
            Self::ExprExploration(job) => job.state().to_string(),
            Self::GroupImplementation(job) => job.state().to_string(),
            Self::ExprImplementation(job) => job.state().to_string(),
            Self::Transformation(job) => job.state().to_string(),
            #[cfg(test)]
            Self::Faulty(job) => job.state().to_string(),
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            Self::GroupExploration(job) => job.is_completed(),
            Self::ExprExploration(job) => job.is_completed(),
            Self::GroupImplementation(job) => job.is_completed(),
            Self::ExprImplementation(job) => job.is_completed(),
            Self::Transformation(job) => job.is_completed(),
            #[cfg(test)]
            Self::Faulty(job) => job.is_completed(),
        }
    }

    pub(crate) fn execute<T: NodeType>(&mut self, cx: &JobContext<'_, T>) -> Result<MachineStatus> {
        match self {
            Self::GroupExploration(job) => job.execute(cx),
            Self::ExprExploration(job) => job.execute(cx),
            Self::GroupImplementation(job) => job.execute(cx),
            Self::ExprImplementation(job) => job.execute(cx),
            Self::Transformation(job) => job.execute(cx),
            #[cfg(test)]
            Self::Faulty(job) => job.execute(cx),
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})@{}", self.kind(), self.target(), self.state_name())
    }
}

/// Dump the state diagram of a job kind in graphviz format.
pub fn state_diagram(kind: JobKind) -> String {
    let title: &'static str = kind.into();
    match kind {
        JobKind::GroupExploration => group_exploration::TABLE.to_graphviz(title),
        JobKind::ExprExploration => expr_exploration::TABLE.to_graphviz(title),
        JobKind::GroupImplementation => group_implementation::TABLE.to_graphviz(title),
        JobKind::ExprImplementation => expr_implementation::TABLE.to_graphviz(title),
        JobKind::Transformation => transformation::TABLE.to_graphviz(title),
    }
}

/// States of a job kind that its state machine can never reach.
pub fn unreachable_states(kind: JobKind) -> Vec<String> {
    fn names<S: Display>(states: Vec<S>) -> Vec<String> {
        states.iter().map(|s| s.to_string()).collect()
    }
    match kind {
        JobKind::GroupExploration => names(group_exploration::TABLE.unreachable_states()),
        JobKind::ExprExploration => names(expr_exploration::TABLE.unreachable_states()),
        JobKind::GroupImplementation => names(group_implementation::TABLE.unreachable_states()),
        JobKind::ExprImplementation => names(expr_implementation::TABLE.unreachable_states()),
        JobKind::Transformation => names(transformation::TABLE.unreachable_states()),
    }
}

pub fn validate_state_machine(kind: JobKind) -> std::result::Result<(), String> {
    match kind {
        JobKind::GroupExploration => group_exploration::TABLE.validate(),
        JobKind::ExprExploration => expr_exploration::TABLE.validate(),
        JobKind::GroupImplementation => group_implementation::TABLE.validate(),
        JobKind::ExprImplementation => expr_implementation::TABLE.validate(),
        JobKind::Transformation => transformation::TABLE.validate(),
    }
}

/// A job slot in the arena.
pub(crate) struct JobEntry {
    pub(crate) id: JobId,
    /// The job that spawned this one. Not an owner; the arena owns every job.
    pub(crate) parent: Option<JobId>,
    pub(crate) kind: JobKind,
    pub(crate) target: JobTarget,
    pub(crate) job: Mutex<Job>,
    /// Children not yet finished, plus one while the job itself is executing.
    pending: AtomicUsize,
    /// Set when the job or one of its children failed.
    failed: AtomicBool,
}

impl JobEntry {
    pub(crate) fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true if this was the last outstanding count.
    pub(crate) fn release_pending(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Called by the worker before executing the job. Every child has finished at this point.
    pub(crate) fn begin_execution(&self) {
        self.pending.store(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Owns every job of a run. Dropping the arena releases all of them at once.
#[derive(Default)]
pub(crate) struct JobArena {
    jobs: RwLock<Vec<Arc<JobEntry>>>,
}

impl JobArena {
    pub(crate) fn alloc(&self, job: Job, parent: Option<JobId>) -> JobId {
        let mut jobs = self.jobs.write();
        let id = JobId(jobs.len());
        jobs.push(Arc::new(JobEntry {
            id,
            parent,
            kind: job.kind(),
            target: job.target(),
            job: Mutex::new(job),
            pending: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        }));
        id
    }

    pub(crate) fn get(&self, id: JobId) -> Arc<JobEntry> {
        self.jobs.read()[id.0].clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.read().len()
    }
}

/// What an action sees of the world: the memo, the rules, and the scheduler on behalf of the
/// executing job.
pub struct JobContext<'a, T: NodeType> {
    sched: &'a SchedulerContext<T>,
    job_id: JobId,
    kind: JobKind,
    target: JobTarget,
    /// Children spawned or waited on during this execution.
    spawned: Cell<usize>,
}

impl<'a, T: NodeType> JobContext<'a, T> {
    pub(crate) fn new(sched: &'a SchedulerContext<T>, entry: &JobEntry) -> Self {
        Self {
            sched,
            job_id: entry.id,
            kind: entry.kind,
            target: entry.target,
            spawned: Cell::new(0),
        }
    }

    pub fn memo(&self) -> &Memo<T> {
        self.sched.memo()
    }

    pub fn rules(&self) -> &[Arc<dyn Rule<T>>] {
        self.sched.rules()
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub(crate) fn spawned(&self) -> usize {
        self.spawned.get()
    }

    pub(crate) fn scheduler(&self) -> &SchedulerContext<T> {
        self.sched
    }

    /// Spawn a child job. The current job is resumed once all its children are done.
    pub(crate) fn spawn(&self, job: Job) -> JobId {
        self.spawned.set(self.spawned.get() + 1);
        self.sched.spawn(job, self.job_id)
    }

    /// Ask for the exploration or implementation of a group, on behalf of the current job.
    /// Unless the phase is already done, the current job must suspend and wait for it.
    pub(crate) fn request_group(&self, group_id: GroupId, phase: GroupPhase) -> Result<JobRequest> {
        let request = self
            .sched
            .request_group_job(group_id, phase, Some(self.job_id))?;
        if request != JobRequest::Done {
            self.spawned.set(self.spawned.get() + 1);
        }
        Ok(request)
    }

    /// Claim every unclaimed logical member of the group for `phase` and spawn one expression
    /// job per member. Returns the number of jobs spawned.
    pub(crate) fn schedule_members(&self, group_id: GroupId, phase: GroupPhase) -> usize {
        let group = self.memo().group(group_id);
        let mut scheduled = 0;
        while let Some((expr_id, _)) = group.claim_next(phase) {
            self.spawn(Job::for_expr(expr_id, phase));
            scheduled += 1;
        }
        scheduled
    }

    /// Spawn one transformation job per rule of the wanted kind that matches the expression and
    /// has not fired on it yet. Returns the number of jobs spawned.
    pub(crate) fn schedule_rules(&self, expr_id: ExprId, impl_rules: bool) -> usize {
        let expr = self.memo().get_expr_memoed(expr_id);
        let mut scheduled = 0;
        for (rule_id, rule) in self.rules().iter().enumerate() {
            if rule.is_impl_rule() != impl_rules {
                continue;
            }
            if self.memo().is_rule_fired(expr_id, rule_id) {
                continue;
            }
            if rule.matcher().top_matches(&expr.typ) {
                self.spawn(Job::Transformation(TransformationJob::new(expr_id, rule_id)));
                scheduled += 1;
            }
        }
        scheduled
    }

    pub(crate) fn on_transition(&self, from: &dyn Display, event: &dyn Display, to: &dyn Display) {
        trace!(
            event = "job_transition",
            job_id = %self.job_id,
            job = %self.kind,
            target = %self.target,
            from = %from,
            on = %event,
            to = %to
        );
        if self.sched.properties().enable_tracing {
            self.sched.record_trace(JobTrace {
                job_id: self.job_id,
                kind: self.kind,
                target: self.target,
                from: from.to_string(),
                event: event.to_string(),
                to: to.to_string(),
            });
        }
    }
}
