// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The cascades-style search core: a memo of groups, jobs driven by state machines, and a
//! multi-threaded scheduler running them.

mod jobs;
pub mod jsm;
mod memo;
mod optimizer;
mod scheduler;

pub use jobs::{
    state_diagram, unreachable_states, validate_state_machine, ExprExplorationEvent,
    ExprExplorationJob, ExprExplorationState, ExprImplementationEvent, ExprImplementationJob,
    ExprImplementationState, GroupExplorationEvent, GroupExplorationJob, GroupExplorationState,
    GroupImplementationEvent, GroupImplementationJob, GroupImplementationState, Job, JobContext,
    JobId, JobKind, JobTarget, TransformationEvent, TransformationJob, TransformationState,
};
pub use memo::{ArcMemoExpr, ExprId, Group, GroupId, GroupInfo, GroupPhase, Memo, MemoExpr};
pub use optimizer::{CascadesSearch, RunReport, SchedulingOrder, SearchProperties};
pub use scheduler::{JobKindStats, JobTrace, SchedulerContext, SearchStatsSnapshot};
