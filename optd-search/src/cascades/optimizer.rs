// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::jobs::{JobKind, JobTarget};
use super::memo::{GroupId, GroupPhase, Memo};
use super::scheduler::{JobTrace, SchedulerContext, SearchStatsSnapshot};
use crate::error::{Result, SearchError};
use crate::nodes::{ArcPlanNode, NodeType};
use crate::rules::Rule;

/// Order in which workers pick ready jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingOrder {
    /// Most recently scheduled job first.
    #[default]
    DepthFirst,
    BreadthFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchProperties {
    /// Number of worker threads. Zero is treated as one.
    pub workers: usize,
    pub order: SchedulingOrder,
    /// Abort the run once more jobs than this have been created.
    pub job_limit: Option<usize>,
    /// Record every state machine transition in the run report.
    pub enable_tracing: bool,
}

impl Default for SearchProperties {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            order: SchedulingOrder::default(),
            job_limit: None,
            enable_tracing: false,
        }
    }
}

/// The outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub root_group: GroupId,
    pub jobs: usize,
    pub elapsed: Duration,
    pub stats: SearchStatsSnapshot,
    pub traces: Vec<JobTrace>,
}

impl RunReport {
    /// The transitions taken by jobs of `kind` working on `target`, in the order they happened.
    pub fn traces_of(&self, kind: JobKind, target: JobTarget) -> Vec<&JobTrace> {
        self.traces
            .iter()
            .filter(|t| t.kind == kind && t.target == target)
            .collect()
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Drives the exploration and implementation of a memo with a set of rules.
pub struct CascadesSearch<T: NodeType> {
    memo: Arc<Memo<T>>,
    rules: Arc<[Arc<dyn Rule<T>>]>,
    prop: SearchProperties,
    /// Held for the whole of a run. Group job queues refer to jobs of the running scheduler
    /// only, so runs on the same memo never overlap.
    run_lock: Mutex<()>,
}

impl<T: NodeType> CascadesSearch<T> {
    pub fn new(rules: Vec<Arc<dyn Rule<T>>>) -> Self {
        Self::new_with_options(rules, SearchProperties::default())
    }

    pub fn new_with_options(rules: Vec<Arc<dyn Rule<T>>>, prop: SearchProperties) -> Self {
        Self {
            memo: Arc::new(Memo::new()),
            rules: rules.into(),
            prop,
            run_lock: Mutex::new(()),
        }
    }

    pub fn memo(&self) -> &Memo<T> {
        &self.memo
    }

    pub fn rules(&self) -> &[Arc<dyn Rule<T>>] {
        &self.rules
    }

    pub fn properties(&self) -> &SearchProperties {
        &self.prop
    }

    /// Memoize a plan and return its root group.
    pub fn add_plan(&self, plan: ArcPlanNode<T>) -> GroupId {
        self.memo.add_new_expr(plan).0
    }

    /// Explore and implement `root` and every group reachable from it. Returns once no job is
    /// left, successful or not. Running again on an already implemented group does nothing.
    /// Concurrent calls are run one after the other.
    pub fn run_optimization(&self, root: GroupId) -> Result<RunReport> {
        if self.memo.try_group(root).is_none() {
            return Err(SearchError::UnknownGroup(root));
        }
        let _run = self.run_lock.lock();
        let start = Instant::now();
        debug!(
            event = "search_begin",
            root_group = %root,
            workers = self.prop.workers,
            order = ?self.prop.order
        );

        let sched = SchedulerContext::new(self.memo.clone(), self.rules.clone(), self.prop.clone());
        sched.request_group_job(root, GroupPhase::Implementation, None)?;
        sched.run_workers();
        let jobs = sched.jobs_created();
        let (error, stats, traces) = sched.finish();
        let elapsed = start.elapsed();

        if let Some(err) = error {
            debug!(event = "search_failed", root_group = %root, jobs, error = %err);
            return Err(err);
        }
        info!(
            event = "search_end",
            root_group = %root,
            jobs,
            groups = self.memo.get_all_group_ids().len(),
            plan_space = self.memo.estimated_plan_space(),
            elapsed_ms = millis(elapsed)
        );
        Ok(RunReport {
            root_group: root,
            jobs,
            elapsed,
            stats,
            traces,
        })
    }

    /// Memoize `plan` and run the search on its root group.
    pub fn optimize(&self, plan: ArcPlanNode<T>) -> Result<RunReport> {
        let root = self.add_plan(plan);
        self.run_optimization(root)
    }

    /// Human readable dump of every group and its members.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for group_id in self.memo.get_all_group_ids() {
            let info = self.memo.get_group_info(group_id);
            let _ = writeln!(
                out,
                "group_id={} explored={} implemented={}",
                group_id, info.explored, info.implemented
            );
            for expr_id in info.exprs {
                let _ = writeln!(
                    out,
                    "  expr_id={} | {}",
                    expr_id,
                    self.memo.get_expr_memoed(expr_id)
                );
            }
        }
        out
    }
}
