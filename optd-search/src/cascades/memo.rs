// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::jobs::JobId;
use crate::nodes::{ArcPlanNode, NodeType, PlanNodeOrGroup, Value};
use crate::rules::RuleId;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub usize);

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize, Deserialize,
)]
pub struct ExprId(pub usize);

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}", self.0)
    }
}

impl Display for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ArcMemoExpr<T> = Arc<MemoExpr<T>>;

/// The plan node representation in the memo table. Store children as group IDs. Equivalent to
/// MExpr in Columbia/Cascades. Two expressions with the same `MemoExpr` are the same expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoExpr<T: NodeType> {
    pub typ: T,
    pub children: Vec<GroupId>,
    pub data: Option<Value>,
}

impl<T: NodeType> Display for MemoExpr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        if let Some(data) = &self.data {
            write!(f, " {data}")?;
        }
        for child in &self.children {
            write!(f, " {child}")?;
        }
        write!(f, ")")
    }
}

/// The two search phases a group goes through. Exploration always completes before
/// implementation begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum GroupPhase {
    Exploration,
    Implementation,
}

/// At most one job per group and phase is in flight. Later requesters wait on the running job
/// instead of spawning a duplicate.
#[derive(Debug, Default)]
pub(crate) enum JobQueue {
    #[default]
    Idle,
    Running {
        main: JobId,
        waiting: Vec<JobId>,
    },
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobRequest {
    /// A new job was created and must be scheduled.
    Scheduled(JobId),
    /// The requester now waits on the running job.
    Attached(JobId),
    /// The phase is already complete.
    Done,
}

struct GroupMember<T: NodeType> {
    expr_id: ExprId,
    expr: ArcMemoExpr<T>,
}

#[derive(Default)]
struct PhaseState {
    /// First member not yet claimed by this phase. Only moves backwards when a failed job
    /// releases the phase.
    cursor: usize,
    /// Members whose expression job of this phase completed.
    finished: HashSet<ExprId>,
    complete: bool,
    queue: JobQueue,
    jobs_created: usize,
}

impl PhaseState {
    fn is_claimable<T: NodeType>(&self, member: &GroupMember<T>) -> bool {
        member.expr.typ.is_logical() && !self.finished.contains(&member.expr_id)
    }
}

struct GroupState<T: NodeType> {
    /// Only grows.
    members: Vec<GroupMember<T>>,
    exploration: PhaseState,
    implementation: PhaseState,
}

impl<T: NodeType> GroupState<T> {
    fn phase_mut(&mut self, phase: GroupPhase) -> &mut PhaseState {
        match phase {
            GroupPhase::Exploration => &mut self.exploration,
            GroupPhase::Implementation => &mut self.implementation,
        }
    }
}

/// A snapshot of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub exprs: Vec<ExprId>,
    pub explored: bool,
    pub implemented: bool,
    pub exploration_jobs: usize,
    pub implementation_jobs: usize,
}

/// An equivalence class of expressions. Every mutation of a group goes through its own lock, so
/// jobs working on different groups never contend.
pub struct Group<T: NodeType> {
    id: GroupId,
    state: Mutex<GroupState<T>>,
}

impl<T: NodeType> Group<T> {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            state: Mutex::new(GroupState {
                members: Vec::new(),
                exploration: PhaseState::default(),
                implementation: PhaseState::default(),
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn is_explored(&self) -> bool {
        self.state.lock().exploration.complete
    }

    pub fn is_implemented(&self) -> bool {
        self.state.lock().implementation.complete
    }

    pub fn is_complete(&self, phase: GroupPhase) -> bool {
        self.state.lock().phase_mut(phase).complete
    }

    pub fn exprs(&self) -> Vec<ExprId> {
        self.state.lock().members.iter().map(|m| m.expr_id).collect()
    }

    pub fn info(&self) -> GroupInfo {
        let state = self.state.lock();
        GroupInfo {
            group_id: self.id,
            exprs: state.members.iter().map(|m| m.expr_id).collect(),
            explored: state.exploration.complete,
            implemented: state.implementation.complete,
            exploration_jobs: state.exploration.jobs_created,
            implementation_jobs: state.implementation.jobs_created,
        }
    }

    fn append(&self, expr_id: ExprId, expr: ArcMemoExpr<T>) {
        self.state.lock().members.push(GroupMember { expr_id, expr });
    }

    /// Fetch the first logical member the phase has not claimed yet and advance the cursor past
    /// it. Physical members and members already finished by the phase are skipped.
    pub(crate) fn claim_next(&self, phase: GroupPhase) -> Option<(ExprId, ArcMemoExpr<T>)> {
        let mut state = self.state.lock();
        let GroupState {
            members,
            exploration,
            implementation,
        } = &mut *state;
        let phase_state = match phase {
            GroupPhase::Exploration => exploration,
            GroupPhase::Implementation => implementation,
        };
        while let Some(member) = members.get(phase_state.cursor) {
            phase_state.cursor += 1;
            if phase_state.is_claimable(member) {
                return Some((member.expr_id, member.expr.clone()));
            }
        }
        None
    }

    /// Record that the expression job of `phase` on `expr_id` completed.
    pub(crate) fn finish_member(&self, phase: GroupPhase, expr_id: ExprId) {
        self.state.lock().phase_mut(phase).finished.insert(expr_id);
    }

    pub(crate) fn mark_complete(&self, phase: GroupPhase) {
        self.state.lock().phase_mut(phase).complete = true;
    }

    /// Ask for the job of `phase` on this group. `charge` is invoked under the group lock
    /// whenever the requester will be notified later (a job was spawned or the requester
    /// attached), so the requester's pending count is raised before the job can finish.
    pub(crate) fn request(
        &self,
        phase: GroupPhase,
        requester: Option<JobId>,
        charge: impl FnOnce(),
        spawn: impl FnOnce() -> JobId,
    ) -> JobRequest {
        let mut state = self.state.lock();
        let phase_state = state.phase_mut(phase);
        if phase_state.complete {
            return JobRequest::Done;
        }
        if let JobQueue::Running { main, waiting } = &mut phase_state.queue {
            if let Some(requester) = requester {
                charge();
                waiting.push(requester);
            }
            return JobRequest::Attached(*main);
        }
        if matches!(phase_state.queue, JobQueue::Completed) {
            return JobRequest::Done;
        }
        let main = spawn();
        if requester.is_some() {
            charge();
        }
        phase_state.queue = JobQueue::Running {
            main,
            waiting: Vec::new(),
        };
        phase_state.jobs_created += 1;
        JobRequest::Scheduled(main)
    }

    /// Called when the main job of `phase` finishes. Returns the dependents to notify.
    ///
    /// A failed phase goes back to idle so that a later run may retry it. Its cursor is rewound
    /// to the first member that was claimed but never finished. The expression jobs of the
    /// phase are children of the main job, so none of them is in flight at this point.
    pub(crate) fn release(&self, phase: GroupPhase, succeeded: bool) -> Vec<JobId> {
        let mut state = self.state.lock();
        let GroupState {
            members,
            exploration,
            implementation,
        } = &mut *state;
        let phase_state = match phase {
            GroupPhase::Exploration => exploration,
            GroupPhase::Implementation => implementation,
        };
        let next = if succeeded {
            JobQueue::Completed
        } else {
            let rewind = members[..phase_state.cursor]
                .iter()
                .position(|member| phase_state.is_claimable(member))
                .unwrap_or(phase_state.cursor);
            if rewind != phase_state.cursor {
                trace!(
                    event = "rewind_cursor",
                    group_id = %self.id,
                    phase = %phase,
                    from = phase_state.cursor,
                    to = rewind
                );
            }
            phase_state.cursor = rewind;
            JobQueue::Idle
        };
        match std::mem::replace(&mut phase_state.queue, next) {
            JobQueue::Running { waiting, .. } => waiting,
            _ => Vec::new(),
        }
    }
}

/// The shared search space. Group and expression ids index into append-only vectors; the
/// expression index deduplicates expressions by signature.
pub struct Memo<T: NodeType> {
    groups: RwLock<Vec<Arc<Group<T>>>>,
    exprs: RwLock<Vec<(ArcMemoExpr<T>, GroupId)>>,
    // Lock order: expr_index, then groups/exprs, then a single group.
    expr_index: Mutex<HashMap<MemoExpr<T>, ExprId>>,
    fired_rules: Mutex<HashMap<ExprId, HashSet<RuleId>>>,
}

impl<T: NodeType> Memo<T> {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            exprs: RwLock::new(Vec::new()),
            expr_index: Mutex::new(HashMap::new()),
            fired_rules: Mutex::new(HashMap::new()),
        }
    }

    /// Add an expression to the memo table. If the expression already exists, it will return
    /// the existing group id and expr id. Otherwise, a new group and expr will be created.
    pub fn add_new_expr(&self, rel_node: ArcPlanNode<T>) -> (GroupId, ExprId) {
        let memo_node = self.memoize(&rel_node);
        let mut index = self.expr_index.lock();
        if let Some(&expr_id) = index.get(&memo_node) {
            return (self.get_group_id(expr_id), expr_id);
        }
        let group_id = {
            let mut groups = self.groups.write();
            let group_id = GroupId(groups.len());
            groups.push(Arc::new(Group::new(group_id)));
            group_id
        };
        let expr_id = self.insert_expr(&mut index, memo_node, group_id);
        trace!(event = "add_new_expr", group_id = %group_id, expr_id = %expr_id, node = %rel_node);
        (group_id, expr_id)
    }

    /// Add a new expression to an existing group. Returns the new expr id, or `None` if nothing
    /// was added: the expression is already in the memo, or the input is a bare group.
    pub fn add_expr_to_group(
        &self,
        rel_node: PlanNodeOrGroup<T>,
        group_id: GroupId,
    ) -> Option<ExprId> {
        let rel_node = match rel_node {
            PlanNodeOrGroup::PlanNode(node) => node,
            PlanNodeOrGroup::Group(other) => {
                if other != group_id {
                    trace!(event = "skip_group_merge", group_id = %group_id, other_group_id = %other);
                }
                return None;
            }
        };
        let memo_node = self.memoize(&rel_node);
        let mut index = self.expr_index.lock();
        if let Some(&expr_id) = index.get(&memo_node) {
            let existing_group_id = self.get_group_id(expr_id);
            if existing_group_id != group_id {
                trace!(
                    event = "skip_group_merge",
                    group_id = %group_id,
                    other_group_id = %existing_group_id,
                    expr_id = %expr_id
                );
            }
            return None;
        }
        let expr_id = self.insert_expr(&mut index, memo_node, group_id);
        trace!(event = "add_expr_to_group", group_id = %group_id, expr_id = %expr_id, node = %rel_node);
        Some(expr_id)
    }

    fn insert_expr(
        &self,
        index: &mut HashMap<MemoExpr<T>, ExprId>,
        memo_node: MemoExpr<T>,
        group_id: GroupId,
    ) -> ExprId {
        let expr = Arc::new(memo_node.clone());
        let expr_id = {
            let mut exprs = self.exprs.write();
            let expr_id = ExprId(exprs.len());
            exprs.push((expr.clone(), group_id));
            expr_id
        };
        index.insert(memo_node, expr_id);
        self.group(group_id).append(expr_id, expr);
        expr_id
    }

    /// Insert all children of a plan node and return its signature.
    fn memoize(&self, rel_node: &ArcPlanNode<T>) -> MemoExpr<T> {
        let children = rel_node
            .children
            .iter()
            .map(|child| match child {
                PlanNodeOrGroup::Group(group_id) => *group_id,
                PlanNodeOrGroup::PlanNode(child) => self.add_new_expr(child.clone()).0,
            })
            .collect_vec();
        MemoExpr {
            typ: rel_node.typ.clone(),
            children,
            data: rel_node.data.clone(),
        }
    }

    /// Look up an already memoized plan without inserting anything.
    pub fn get_expr_info(&self, rel_node: &ArcPlanNode<T>) -> Option<(GroupId, ExprId)> {
        let mut children = Vec::with_capacity(rel_node.children.len());
        for child in &rel_node.children {
            children.push(match child {
                PlanNodeOrGroup::Group(group_id) => *group_id,
                PlanNodeOrGroup::PlanNode(child) => self.get_expr_info(child)?.0,
            });
        }
        let memo_node = MemoExpr {
            typ: rel_node.typ.clone(),
            children,
            data: rel_node.data.clone(),
        };
        let expr_id = *self.expr_index.lock().get(&memo_node)?;
        Some((self.get_group_id(expr_id), expr_id))
    }

    pub fn get_group_id(&self, expr_id: ExprId) -> GroupId {
        self.exprs.read()[expr_id.0].1
    }

    pub fn get_expr_memoed(&self, expr_id: ExprId) -> ArcMemoExpr<T> {
        self.exprs.read()[expr_id.0].0.clone()
    }

    pub fn get_all_group_ids(&self) -> Vec<GroupId> {
        (0..self.groups.read().len()).map(GroupId).collect()
    }

    pub fn get_all_exprs_in_group(&self, group_id: GroupId) -> Vec<ExprId> {
        self.group(group_id).exprs()
    }

    pub fn get_group_info(&self, group_id: GroupId) -> GroupInfo {
        self.group(group_id).info()
    }

    pub fn try_group(&self, group_id: GroupId) -> Option<Arc<Group<T>>> {
        self.groups.read().get(group_id.0).cloned()
    }

    pub fn group(&self, group_id: GroupId) -> Arc<Group<T>> {
        self.groups.read()[group_id.0].clone()
    }

    pub fn is_rule_fired(&self, expr_id: ExprId, rule_id: RuleId) -> bool {
        self.fired_rules
            .lock()
            .get(&expr_id)
            .is_some_and(|rules| rules.contains(&rule_id))
    }

    /// Returns false if the rule was already marked as fired on the expression.
    pub fn mark_rule_fired(&self, expr_id: ExprId, rule_id: RuleId) -> bool {
        self.fired_rules
            .lock()
            .entry(expr_id)
            .or_default()
            .insert(rule_id)
    }

    /// Number of expressions in the memo table.
    pub fn estimated_plan_space(&self) -> usize {
        self.exprs.read().len()
    }
}
