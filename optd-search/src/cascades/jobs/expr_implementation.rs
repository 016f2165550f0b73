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
pub enum ExprImplementationState {
    Initialized,
    ChildrenImplemented,
    Completed,
}

impl JobState for ExprImplementationState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ExprImplementationEvent {
    ImplementingChildren,
    ChildrenImplemented,
    ImplementingSelf,
    SelfImplemented,
}

impl JobEvent for ExprImplementationEvent {}

use ExprImplementationEvent as Event;
use ExprImplementationState as State;

pub(super) static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(State::Initialized, Event::ImplementingChildren, State::Initialized),
    Transition::new(
        State::Initialized,
        Event::ChildrenImplemented,
        State::ChildrenImplemented,
    ),
    Transition::new(
        State::ChildrenImplemented,
        Event::ImplementingSelf,
        State::ChildrenImplemented,
    ),
    Transition::new(State::ChildrenImplemented, Event::SelfImplemented, State::Completed),
]);

/// Implements the child groups of an expression, then fires the implementation rules on it.
#[derive(Debug)]
pub struct ExprImplementationJob {
    expr_id: ExprId,
    children_requested: bool,
    rules_scheduled: bool,
    jsm: JobStateMachine<State, Event>,
}

impl ExprImplementationJob {
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
                State::Initialized => implement_children(cx, expr_id, children_requested),
                State::ChildrenImplemented => implement_self(cx, expr_id, rules_scheduled),
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}

fn implement_children<T: NodeType>(
    cx: &JobContext<'_, T>,
    expr_id: ExprId,
    requested: &mut bool,
) -> Result<Event> {
    if *requested {
        return Ok(Event::ChildrenImplemented);
    }
    *requested = true;
    let expr = cx.memo().get_expr_memoed(expr_id);
    let mut waiting = 0;
    for child in expr.children.iter().unique() {
        if cx.request_group(*child, GroupPhase::Implementation)? != JobRequest::Done {
            waiting += 1;
        }
    }
    if waiting > 0 {
        Ok(Event::ImplementingChildren)
    } else {
        Ok(Event::ChildrenImplemented)
    }
}

fn implement_self<T: NodeType>(
    cx: &JobContext<'_, T>,
    expr_id: ExprId,
    scheduled: &mut bool,
) -> Result<Event> {
    if *scheduled {
        return Ok(Event::SelfImplemented);
    }
    *scheduled = true;
    if cx.schedule_rules(expr_id, true) > 0 {
        Ok(Event::ImplementingSelf)
    } else {
        Ok(Event::SelfImplemented)
    }
}
