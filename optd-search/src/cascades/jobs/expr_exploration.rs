// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use itertools::Itertools;

use super::JobContext;
use crate::cascades::jsm::{
    JobEvent, JobState, JobStateMachine, MachineStatus, Transition, TransitionTable,
};
use crate::cascades::memo::{ExprId, GroupPhase, JobRequest};
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ExprExplorationState {
    Initialized,
    ChildrenExplored,
    Completed,
}

impl JobState for ExprExplorationState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ExprExplorationEvent {
    ExploringChildren,
    ChildrenExplored,
    ExploringSelf,
    SelfExplored,
}

impl JobEvent for ExprExplorationEvent {}

use ExprExplorationEvent as Event;
use ExprExplorationState as State;

pub(super) static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(State::Initialized, Event::ExploringChildren, State::Initialized),
    Transition::new(State::Initialized, Event::ChildrenExplored, State::ChildrenExplored),
    Transition::new(State::ChildrenExplored, Event::ExploringSelf, State::ChildrenExplored),
    Transition::new(State::ChildrenExplored, Event::SelfExplored, State::Completed),
]);

/// Explores the child groups of an expression, then fires the transformation rules on it.
#[derive(Debug)]
pub struct ExprExplorationJob {
    expr_id: ExprId,
    children_requested: bool,
    rules_scheduled: bool,
    jsm: JobStateMachine<State, Event>,
}

impl ExprExplorationJob {
    pub fn new(expr_id: ExprId) -> Self {
        Self {
            expr_id,
            children_requested: false,
            rules_scheduled: false,
            jsm: JobStateMachine::new(&TABLE),
        }
    }

    pub fn initialize(&mut self, expr_id: ExprId) {
        self.expr_id = expr_id;
        self.children_requested = false;
        self.rules_scheduled = false;
        self.jsm.reset();
    }

    pub fn expr_id(&self) -> ExprId {
        self.expr_id
    }

    pub fn state(&self) -> State {
        self.jsm.current()
    }

    pub fn is_completed(&self) -> bool {
        self.jsm.is_terminal()
    }

    pub(crate) fn execute<T: NodeType>(&mut self, cx: &JobContext<'_, T>) -> Result<MachineStatus> {
        let Self {
            expr_id,
            children_requested,
            rules_scheduled,
            jsm,
        } = self;
        let expr_id = *expr_id;
        jsm.run(
            |state| match state {
                State::Initialized => explore_children(cx, expr_id, children_requested),
                State::ChildrenExplored => explore_self(cx, expr_id, rules_scheduled),
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}

fn explore_children<T: NodeType>(
    cx: &JobContext<'_, T>,
    expr_id: ExprId,
    requested: &mut bool,
) -> Result<Event> {
    if *requested {
        return Ok(Event::ChildrenExplored);
    }
    *requested = true;
    let expr = cx.memo().get_expr_memoed(expr_id);
    let mut waiting = 0;
    for child in expr.children.iter().unique() {
        if cx.request_group(*child, GroupPhase::Exploration)? != JobRequest::Done {
            waiting += 1;
        }
    }
    if waiting > 0 {
        Ok(Event::ExploringChildren)
    } else {
        Ok(Event::ChildrenExplored)
    }
}

fn explore_self<T: NodeType>(
    cx: &JobContext<'_, T>,
    expr_id: ExprId,
    scheduled: &mut bool,
) -> Result<Event> {
    if *scheduled {
        return Ok(Event::SelfExplored);
    }
    *scheduled = true;
    if cx.schedule_rules(expr_id, false) > 0 {
        Ok(Event::ExploringSelf)
    } else {
        Ok(Event::SelfExplored)
    }
}
