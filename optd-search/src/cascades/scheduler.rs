// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The job scheduler: a ready queue drained by a pool of worker threads.
//!
//! A job is *outstanding* from its creation until it has finished and notified everyone waiting
//! on it. The run is over once nothing is outstanding. Suspended jobs are not in the ready queue;
//! they are re-enqueued by whichever child finishes last.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};
use tracing::{debug, trace, warn};

use super::jobs::{Job, JobArena, JobContext, JobEntry, JobId, JobKind, JobTarget};
use super::jsm::MachineStatus;
use super::memo::{GroupId, GroupPhase, JobRequest, Memo};
use super::optimizer::{SchedulingOrder, SearchProperties};
use crate::error::{Result, SearchError};
use crate::nodes::NodeType;
use crate::rules::Rule;

/// One state machine transition taken by a job, recorded when tracing is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTrace {
    pub job_id: JobId,
    pub kind: JobKind,
    pub target: JobTarget,
    pub from: String,
    pub event: String,
    pub to: String,
}

impl Display for JobTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}({}) {} --{}--> {}",
            self.job_id, self.kind, self.target, self.from, self.event, self.to
        )
    }
}

#[derive(Default)]
struct KindCounters {
    created: AtomicUsize,
    executed: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct SearchStats {
    kinds: [KindCounters; JobKind::COUNT],
    discarded: AtomicUsize,
    suspensions: AtomicUsize,
    attached: AtomicUsize,
    rules_applied: AtomicUsize,
    exprs_added: AtomicUsize,
}

impl SearchStats {
    fn kind(&self, kind: JobKind) -> &KindCounters {
        &self.kinds[kind as usize]
    }

    pub(crate) fn rule_applied(&self) {
        self.rules_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn expr_added(&self) {
        self.exprs_added.fetch_add(1, Ordering::Relaxed);
    }

    fn total_created(&self) -> usize {
        self.kinds
            .iter()
            .map(|k| k.created.load(Ordering::Relaxed))
            .sum()
    }

    fn snapshot(&self) -> SearchStatsSnapshot {
        let jobs = JobKind::iter()
            .map(|kind| {
                let k = self.kind(kind);
                (
                    kind,
                    JobKindStats {
                        created: k.created.load(Ordering::Relaxed),
                        executed: k.executed.load(Ordering::Relaxed),
                        completed: k.completed.load(Ordering::Relaxed),
                        failed: k.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        SearchStatsSnapshot {
            jobs,
            discarded: self.discarded.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            attached: self.attached.load(Ordering::Relaxed),
            rules_applied: self.rules_applied.load(Ordering::Relaxed),
            exprs_added: self.exprs_added.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobKindStats {
    pub created: usize,
    /// Number of times a job of this kind was run, resumptions included.
    pub executed: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchStatsSnapshot {
    pub jobs: BTreeMap<JobKind, JobKindStats>,
    /// Jobs dropped without running because the run was aborted or a child failed.
    pub discarded: usize,
    pub suspensions: usize,
    /// Requests answered by waiting on an already running group job.
    pub attached: usize,
    pub rules_applied: usize,
    pub exprs_added: usize,
}

impl SearchStatsSnapshot {
    pub fn kind(&self, kind: JobKind) -> JobKindStats {
        self.jobs.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_created(&self) -> usize {
        self.jobs.values().map(|k| k.created).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.jobs.values().map(|k| k.failed).sum()
    }
}

/// Everything shared by the workers of one run.
pub struct SchedulerContext<T: NodeType> {
    memo: Arc<Memo<T>>,
    rules: Arc<[Arc<dyn Rule<T>>]>,
    prop: SearchProperties,
    jobs: JobArena,
    queue: Mutex<VecDeque<JobId>>,
    ready: Condvar,
    outstanding: AtomicUsize,
    aborted: AtomicBool,
    /// The first error of the run.
    error: Mutex<Option<SearchError>>,
    stats: SearchStats,
    traces: Mutex<Vec<JobTrace>>,
}

impl<T: NodeType> SchedulerContext<T> {
    pub fn new(
        memo: Arc<Memo<T>>,
        rules: Arc<[Arc<dyn Rule<T>>]>,
        prop: SearchProperties,
    ) -> Self {
        Self {
            memo,
            rules,
            prop,
            jobs: JobArena::default(),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            outstanding: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            stats: SearchStats::default(),
            traces: Mutex::new(Vec::new()),
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

    pub(crate) fn stats(&self) -> &SearchStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> SearchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn jobs_created(&self) -> usize {
        self.jobs.len()
    }

    /// Stop the run. Jobs that have not started yet are discarded; running jobs finish their
    /// current step. Only the first error is kept.
    pub fn abort(&self, err: SearchError) {
        let mut error = self.error.lock();
        if error.is_none() {
            warn!(event = "search_abort", structural = err.is_structural(), error = %err);
            *error = Some(err);
        } else {
            debug!(event = "search_abort_ignored", error = %err);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn schedule(&self, job_id: JobId) {
        let mut queue = self.queue.lock();
        queue.push_back(job_id);
        drop(queue);
        self.ready.notify_one();
    }

    pub fn mark_running(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Taking the lock orders this wakeup after any worker's emptiness check.
            let _queue = self.queue.lock();
            self.ready.notify_all();
        }
    }

    pub(crate) fn record_trace(&self, trace: JobTrace) {
        self.traces.lock().push(trace);
    }

    fn create_job(&self, job: Job, parent: Option<JobId>) -> JobId {
        let kind = job.kind();
        self.stats.kind(kind).created.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.prop.job_limit {
            if self.stats.total_created() > limit {
                self.abort(SearchError::JobLimitExceeded { limit });
            }
        }
        self.mark_running();
        let id = self.jobs.alloc(job, parent);
        trace!(event = "job_create", job_id = %id, job = %kind, parent = ?parent);
        id
    }

    /// Create a child of `parent` and make it ready.
    pub(crate) fn spawn(&self, job: Job, parent: JobId) -> JobId {
        self.jobs.get(parent).add_pending();
        let id = self.create_job(job, Some(parent));
        self.schedule(id);
        id
    }

    /// Request the job of `phase` on a group. With a requester, the requester is notified when
    /// the job finishes unless the phase is already done.
    pub(crate) fn request_group_job(
        &self,
        group_id: GroupId,
        phase: GroupPhase,
        requester: Option<JobId>,
    ) -> Result<JobRequest> {
        let group = self
            .memo
            .try_group(group_id)
            .ok_or(SearchError::UnknownGroup(group_id))?;
        let request = group.request(
            phase,
            requester,
            || {
                if let Some(requester) = requester {
                    self.jobs.get(requester).add_pending();
                }
            },
            || self.create_job(Job::for_group(group_id, phase), requester),
        );
        match request {
            JobRequest::Scheduled(job_id) => self.schedule(job_id),
            JobRequest::Attached(main) => {
                self.stats.attached.fetch_add(1, Ordering::Relaxed);
                trace!(
                    event = "job_attach",
                    group_id = %group_id,
                    phase = %phase,
                    main = %main,
                    requester = ?requester
                );
            }
            JobRequest::Done => {}
        }
        Ok(request)
    }

    /// Block until a job is ready. Returns `None` once nothing is outstanding.
    fn next_job(&self) -> Option<JobId> {
        let mut queue = self.queue.lock();
        loop {
            let job = match self.prop.order {
                SchedulingOrder::DepthFirst => queue.pop_back(),
                SchedulingOrder::BreadthFirst => queue.pop_front(),
            };
            if job.is_some() {
                return job;
            }
            if self.outstanding() == 0 {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Drain the ready queue with the configured number of workers. Returns once every job has
    /// finished.
    pub fn run_workers(&self) {
        let workers = self.prop.workers.max(1);
        std::thread::scope(|s| {
            for worker in 0..workers {
                s.spawn(move || self.worker_loop(worker));
            }
        });
    }

    fn worker_loop(&self, worker: usize) {
        trace!(event = "worker_start", worker);
        let mut executed = 0usize;
        while let Some(job_id) = self.next_job() {
            self.run_job(worker, job_id);
            executed += 1;
        }
        trace!(event = "worker_exit", worker, executed);
    }

    fn run_job(&self, worker: usize, job_id: JobId) {
        let entry = self.jobs.get(job_id);
        if self.is_aborted() || entry.is_failed() {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            trace!(event = "job_discard", worker, job_id = %job_id, job = %entry.kind);
            self.finish_job(&entry, false);
            return;
        }

        entry.begin_execution();
        let cx = JobContext::new(self, &entry);
        let result = {
            let mut job = entry.job.lock();
            trace!(event = "job_begin", worker, job_id = %job_id, job = %job);
            self.stats
                .kind(entry.kind)
                .executed
                .fetch_add(1, Ordering::Relaxed);
            job.execute(&cx)
        };

        match result {
            Ok(MachineStatus::Completed) => {
                let pending = entry.pending() - 1;
                if pending != 0 {
                    let err = SearchError::UnfinishedChildren {
                        job: job_id,
                        pending,
                    };
                    self.fail_in_place(&entry, err);
                } else {
                    trace!(event = "job_finish", worker, job_id = %job_id, job = %entry.kind);
                    self.finish_job(&entry, true);
                }
            }
            Ok(MachineStatus::Suspended) => {
                if cx.spawned() == 0 {
                    let err = SearchError::SuspendedWithoutChildren { job: job_id };
                    self.fail_in_place(&entry, err);
                } else {
                    self.stats.suspensions.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        event = "job_suspend",
                        worker,
                        job_id = %job_id,
                        job = %entry.kind,
                        waiting_on = entry.pending() - 1
                    );
                    self.release_guard(&entry);
                }
            }
            Err(err) => self.fail_in_place(&entry, err),
        }
    }

    /// The job failed while it may still have children in flight. It is parked like a suspended
    /// job and discarded once the last child has drained.
    fn fail_in_place(&self, entry: &JobEntry, err: SearchError) {
        warn!(
            event = "job_failed",
            job_id = %entry.id,
            job = %entry.kind,
            target = %entry.target,
            error = %err
        );
        entry.mark_failed();
        self.abort(err);
        self.release_guard(entry);
    }

    /// Drop the running guard. If every child already finished, the job is ready again.
    fn release_guard(&self, entry: &JobEntry) {
        if entry.release_pending() {
            self.schedule(entry.id);
        }
    }

    /// Fan-in: tell the parent and everyone attached to this job that it is done.
    fn finish_job(&self, entry: &JobEntry, succeeded: bool) {
        let (group_phase, expr_phase) = {
            let job = entry.job.lock();
            (job.group_phase(), job.expr_phase())
        };
        if let (true, Some((expr_id, phase))) = (succeeded, expr_phase) {
            let group_id = self.memo.get_group_id(expr_id);
            self.memo.group(group_id).finish_member(phase, expr_id);
        }
        let dependents = match group_phase {
            Some((group_id, phase)) => self.memo.group(group_id).release(phase, succeeded),
            None => Vec::new(),
        };
        let counters = self.stats.kind(entry.kind);
        if succeeded {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(parent) = entry.parent {
            self.notify(parent, succeeded);
        }
        for dependent in dependents {
            self.notify(dependent, succeeded);
        }
        self.mark_done();
    }

    fn notify(&self, job_id: JobId, succeeded: bool) {
        let entry = self.jobs.get(job_id);
        if !succeeded {
            entry.mark_failed();
        }
        if entry.release_pending() {
            self.schedule(job_id);
        }
    }

    /// Consume the context, returning the first error of the run along with the statistics and
    /// the recorded traces.
    pub fn finish(self) -> (Option<SearchError>, SearchStatsSnapshot, Vec<JobTrace>) {
        let stats = self.stats.snapshot();
        (self.error.into_inner(), stats, self.traces.into_inner())
    }
}
