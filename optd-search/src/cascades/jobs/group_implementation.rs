// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use tracing::trace;

use super::JobContext;
use crate::cascades::jsm::{
    JobEvent, JobState, JobStateMachine, MachineStatus, Transition, TransitionTable,
};
use crate::cascades::memo::{GroupId, GroupPhase, JobRequest};
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum GroupImplementationState {
    Initialized,
    ImplementingChildren,
    Completed,
}

impl JobState for GroupImplementationState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum GroupImplementationEvent {
    /// The group is being explored; wait for it.
    Exploring,
    Explored,
    /// Expression implementation jobs were spawned; wait for them.
    Implementing,
    Implemented,
}

impl JobEvent for GroupImplementationEvent {}

use GroupImplementationEvent as Event;
use GroupImplementationState as State;

pub(super) static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(State::Initialized, Event::Exploring, State::Initialized),
    Transition::new(State::Initialized, Event::Explored, State::ImplementingChildren),
    Transition::new(
        State::ImplementingChildren,
        Event::Implementing,
        State::ImplementingChildren,
    ),
    Transition::new(State::ImplementingChildren, Event::Implemented, State::Completed),
]);

/// Implements every logical expression of a group, after the group is fully explored.
#[derive(Debug)]
pub struct GroupImplementationJob {
    group_id: GroupId,
    jsm: JobStateMachine<State, Event>,
}

impl GroupImplementationJob {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            jsm: JobStateMachine::new(&TABLE),
        }
    }

    /// Re-target the job and rewind its state machine.
    pub fn initialize(&mut self, group_id: GroupId) {
        self.group_id = group_id;
        self.jsm.reset();
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn state(&self) -> State {
        self.jsm.current()
    }

    pub fn is_completed(&self) -> bool {
        self.jsm.is_terminal()
    }

    pub(crate) fn execute<T: NodeType>(&mut self, cx: &JobContext<'_, T>) -> Result<MachineStatus> {
        let group_id = self.group_id;
        self.jsm.run(
            |state| match state {
                State::Initialized => start_implementation(cx, group_id),
                State::ImplementingChildren => implement_children(cx, group_id),
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}

/// Exploration of the group must be complete before any of its members is implemented.
fn start_implementation<T: NodeType>(cx: &JobContext<'_, T>, group_id: GroupId) -> Result<Event> {
    match cx.request_group(group_id, GroupPhase::Exploration)? {
        JobRequest::Done => Ok(Event::Explored),
        _ => {
            trace!(event = "wait_exploration", job_id = %cx.job_id(), group_id = %group_id);
            Ok(Event::Exploring)
        }
    }
}

fn implement_children<T: NodeType>(cx: &JobContext<'_, T>, group_id: GroupId) -> Result<Event> {
    let scheduled = cx.schedule_members(group_id, GroupPhase::Implementation);
    if scheduled > 0 {
        Ok(Event::Implementing)
    } else {
        cx.memo().group(group_id).mark_complete(GroupPhase::Implementation);
        Ok(Event::Implemented)
    }
}
