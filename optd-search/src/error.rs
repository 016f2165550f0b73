// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use thiserror::Error;

use crate::cascades::{ExprId, GroupId, JobId};

pub type Result<T, E = SearchError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SearchError {
    /// An action raised an event the current state has no transition for.
    #[error("no transition from state {state} on event {event}")]
    NoTransition { state: String, event: String },

    /// The state machine asked for the action of a state that has none (the terminal state).
    #[error("no action for state {state}")]
    MissingAction { state: String },

    #[error("job {job} reached its terminal state with {pending} unfinished children")]
    UnfinishedChildren { job: JobId, pending: usize },

    #[error("job {job} suspended without waiting on any children")]
    SuspendedWithoutChildren { job: JobId },

    #[error("rule {rule} failed on expression {expr_id}: {cause:#}")]
    RuleFailed {
        rule: &'static str,
        expr_id: ExprId,
        cause: anyhow::Error,
    },

    #[error("job limit of {limit} exceeded")]
    JobLimitExceeded { limit: usize },

    #[error("group {0} does not exist in the memo")]
    UnknownGroup(GroupId),
}

impl SearchError {
    /// Structural errors mean the job graph itself is inconsistent.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NoTransition { .. }
                | Self::MissingAction { .. }
                | Self::UnfinishedChildren { .. }
                | Self::SuspendedWithoutChildren { .. }
        )
    }
}
