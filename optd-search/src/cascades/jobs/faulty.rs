// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A job that breaks the job contract on purpose, to check how the scheduler copes.

use super::JobContext;
use crate::cascades::jsm::{
    JobEvent, JobState, JobStateMachine, MachineStatus, Transition, TransitionTable,
};
use crate::cascades::memo::{GroupId, GroupPhase};
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum FaultyState {
    Initialized,
    Completed,
}

impl JobState for FaultyState {
    const INITIAL: Self = Self::Initialized;
    const TERMINAL: Self = Self::Completed;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum FaultyEvent {
    Waiting,
    Finished,
    Unexpected,
}

impl JobEvent for FaultyEvent {}

use FaultyEvent as Event;
use FaultyState as State;

static TABLE: TransitionTable<State, Event> = TransitionTable::new(&[
    Transition::new(State::Initialized, Event::Waiting, State::Initialized),
    Transition::new(State::Initialized, Event::Finished, State::Completed),
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Suspends without spawning or waiting on anything.
    SuspendAlone,
    /// Raises an event with no transition from the current state.
    UnknownEvent,
    /// Requests the exploration of its group, then completes without waiting for it.
    AbandonChild,
}

#[derive(Debug)]
pub struct FaultyJob {
    group_id: GroupId,
    fault: Fault,
    jsm: JobStateMachine<State, Event>,
}

impl FaultyJob {
    pub(crate) fn new(group_id: GroupId, fault: Fault) -> Self {
        Self {
            group_id,
            fault,
            jsm: JobStateMachine::new(&TABLE),
        }
    }

    pub(crate) fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub(crate) fn state(&self) -> State {
        self.jsm.current()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.jsm.is_terminal()
    }

    pub(crate) fn execute<T: NodeType>(&mut self, cx: &JobContext<'_, T>) -> Result<MachineStatus> {
        let (group_id, fault) = (self.group_id, self.fault);
        self.jsm.run(
            |state| match state {
                State::Initialized => match fault {
                    Fault::SuspendAlone => Ok(Event::Waiting),
                    Fault::UnknownEvent => Ok(Event::Unexpected),
                    Fault::AbandonChild => {
                        cx.request_group(group_id, GroupPhase::Exploration)?;
                        Ok(Event::Finished)
                    }
                },
                State::Completed => Err(SearchError::MissingAction {
                    state: state.to_string(),
                }),
            },
            |from, event, to| cx.on_transition(&from, &event, &to),
        )
    }
}
