// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::JobContext;
use crate::cascades::jsm::{
    JobEvent, JobState, JobStateMachine, MachineStatus, Transition, TransitionTable,
};
use crate::cascades::memo::{GroupId, GroupPhase};
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum GroupExplorationState {
    Initialized,
    ExploringChildren,
    Completed,
}

impl JobState for GroupExplorationState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum GroupExplorationEvent {
    StartedExploration,
    Exploring,
    Explored,
}

impl JobEvent for GroupExplorationEvent {}

use GroupExplorationEvent as Event;
use GroupExplorationState as State;

pub(super) static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(
        State::Initialized,
        Event::StartedExploration,
        State::ExploringChildren,
    ),
    Transition::new(State::ExploringChildren, Event::Exploring, State::ExploringChildren),
    Transition::new(State::ExploringChildren, Event::Explored, State::Completed),
]);

/// Explores every logical expression of a group. New members produced while the job waits are
/// picked up when it resumes, so the group is only marked explored once no unclaimed member is
/// left.
#[derive(Debug)]
pub struct GroupExplorationJob {
    group_id: GroupId,
    jsm: JobStateMachine<State, Event>,
}

impl GroupExplorationJob {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            jsm: JobStateMachine::new(&TABLE),
        }
    }

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
                State::Initialized => Ok(Event::StartedExploration),
                State::ExploringChildren => explore_children(cx, group_id),
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}

fn explore_children<T: NodeType>(cx: &JobContext<'_, T>, group_id: GroupId) -> Result<Event> {
    if cx.schedule_members(group_id, GroupPhase::Exploration) > 0 {
        Ok(Event::Exploring)
    } else {
        cx.memo().group(group_id).mark_complete(GroupPhase::Exploration);
        Ok(Event::Explored)
    }
}
