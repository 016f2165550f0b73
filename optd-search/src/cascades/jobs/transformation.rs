// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use tracing::trace;

use super::JobContext;
use crate::cascades::jsm::{
    JobEvent, JobState, JobStateMachine, MachineStatus, Transition, TransitionTable,
};
use crate::cascades::memo::ExprId;
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;
use crate::rules::RuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum TransformationState {
    Initialized,
    Completed,
}

impl JobState for TransformationState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum TransformationEvent {
    Transformed,
}

impl JobEvent for TransformationEvent {}

use TransformationEvent as Event;
use TransformationState as State;

pub(super) static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(State::Initialized, Event::Transformed, State::Completed),
]);

/// Applies one rule to one expression and adds the results to the expression's group.
#[derive(Debug)]
pub struct TransformationJob {
    expr_id: ExprId,
    rule_id: RuleId,
    jsm: JobStateMachine<State, Event>,
}

impl TransformationJob {
    pub fn new(expr_id: ExprId, rule_id: RuleId) -> Self {
        Self {
            expr_id,
            rule_id,
            jsm: JobStateMachine::new(&TABLE),
        }
    }

    pub fn initialize(&mut self, expr_id: ExprId, rule_id: RuleId) {
        self.expr_id = expr_id;
        self.rule_id = rule_id;
        self.jsm.reset();
    }

    pub fn expr_id(&self) -> ExprId {
        self.expr_id
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    pub fn state(&self) -> State {
        self.jsm.current()
    }

    pub fn is_completed(&self) -> bool {
        self.jsm.is_terminal()
    }

    pub(crate) fn execute<T: NodeType>(&mut self, cx: &JobContext<'_, T>) -> Result<MachineStatus> {
        let (expr_id, rule_id) = (self.expr_id, self.rule_id);
        self.jsm.run(
            |state| match state {
                State::Initialized => transform(cx, expr_id, rule_id),
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}

fn transform<T: NodeType>(cx: &JobContext<'_, T>, expr_id: ExprId, rule_id: RuleId) -> Result<Event> {
    let memo = cx.memo();
    let rule = cx.rules()[rule_id].clone();
    if memo.is_rule_fired(expr_id, rule_id) {
        trace!(event = "skip_fired_rule", expr_id = %expr_id, rule = rule.name());
        return Ok(Event::Transformed);
    }
    let expr = memo.get_expr_memoed(expr_id);
    let group_id = memo.get_group_id(expr_id);
    // A failed rule stays unfired so that a later run applies it again.
    let outputs = rule
        .apply(memo, &expr)
        .map_err(|cause| SearchError::RuleFailed {
            rule: rule.name(),
            expr_id,
            cause,
        })?;
    memo.mark_rule_fired(expr_id, rule_id);
    cx.scheduler().stats().rule_applied();
    for output in outputs {
        if let Some(new_expr_id) = memo.add_expr_to_group(output, group_id) {
            cx.scheduler().stats().expr_added();
            trace!(
                event = "apply_rule",
                rule = rule.name(),
                expr_id = %expr_id,
                new_expr_id = %new_expr_id,
                group_id = %group_id,
                new_expr = %memo.get_expr_memoed(new_expr_id)
            );
        }
    }
    Ok(Event::Transformed)
}
