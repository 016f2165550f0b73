// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use strum::IntoEnumIterator;

use super::common::*;
use crate::cascades::{
    CascadesSearch, GroupId, JobId, JobKind, JobTarget, RunReport, SchedulingOrder,
    SearchProperties,
};
use crate::error::SearchError;
use crate::nodes::{ArcPlanNode, NodeType, Value};
use crate::rules::Rule;

fn search(
    rules: Vec<Arc<dyn Rule<MemoTestRelTyp>>>,
    workers: usize,
) -> CascadesSearch<MemoTestRelTyp> {
    init_tracing();
    CascadesSearch::new_with_options(
        rules,
        SearchProperties {
            workers,
            order: SchedulingOrder::DepthFirst,
            job_limit: None,
            enable_tracing: true,
        },
    )
}

fn transitions(
    report: &RunReport,
    kind: JobKind,
    target: JobTarget,
) -> Vec<(String, String, String)> {
    report
        .traces_of(kind, target)
        .into_iter()
        .map(|t| (t.from.clone(), t.event.clone(), t.to.clone()))
        .collect()
}

fn edges(expected: &[(&str, &str, &str)]) -> Vec<(String, String, String)> {
    expected
        .iter()
        .map(|(from, event, to)| (from.to_string(), event.to_string(), to.to_string()))
        .collect()
}

/// Distinct jobs of `kind` that worked on an expression of `group_id`.
fn expr_jobs_in_group(
    search: &CascadesSearch<MemoTestRelTyp>,
    report: &RunReport,
    kind: JobKind,
    group_id: GroupId,
) -> HashSet<JobId> {
    report
        .traces
        .iter()
        .filter(|t| t.kind == kind)
        .filter(|t| matches!(t.target, JobTarget::Expr(e) if search.memo().get_group_id(e) == group_id))
        .map(|t| t.job_id)
        .collect()
}

fn assert_clean(report: &RunReport) {
    for kind in JobKind::iter() {
        let stats = report.stats.kind(kind);
        assert_eq!(stats.created, stats.completed, "{kind}");
        assert_eq!(stats.failed, 0, "{kind}");
    }
    assert_eq!(report.stats.discarded, 0);
    assert_eq!(report.jobs, report.stats.total_created());
}

fn three_way_join() -> ArcPlanNode<MemoTestRelTyp> {
    join(
        join(scan("t1"), scan("t2"), Value::Int64(1)),
        scan("t3"),
        Value::Int64(2),
    )
}

#[test]
fn group_with_three_members_implements_each_once() {
    let search = search(implementation_rules(), 1);
    let left = search.add_plan(scan("a"));
    let right = search.add_plan(scan("b"));
    let root = search.add_plan(join(group(left), group(right), Value::Int64(0)));
    for cond in [1, 2] {
        search
            .memo()
            .add_expr_to_group(join(group(left), group(right), Value::Int64(cond)).into(), root)
            .unwrap();
    }
    assert_eq!(search.memo().get_all_exprs_in_group(root).len(), 3);

    let report = search.run_optimization(root).unwrap();
    assert_clean(&report);

    let implementations = expr_jobs_in_group(&search, &report, JobKind::ExprImplementation, root);
    assert_eq!(implementations.len(), 3);
    let explorations = expr_jobs_in_group(&search, &report, JobKind::ExprExploration, root);
    assert_eq!(explorations.len(), 3);

    // nlj and hash join for every logical join.
    assert_eq!(search.memo().get_all_exprs_in_group(root).len(), 9);
    let info = search.memo().get_group_info(root);
    assert!(info.explored && info.implemented);
    assert_eq!(info.implementation_jobs, 1);
}

#[test]
fn exploration_completes_before_implementation() {
    let search = search(all_rules(), 1);
    let report = search
        .optimize(filter(scan("t1"), Value::Bool(true)))
        .unwrap();
    assert_clean(&report);
    let root = report.root_group;

    assert_eq!(
        transitions(&report, JobKind::GroupImplementation, JobTarget::Group(root)),
        edges(&[
            ("Initialized", "Exploring", "Initialized"),
            ("Initialized", "Explored", "ImplementingChildren"),
            ("ImplementingChildren", "Implementing", "ImplementingChildren"),
            ("ImplementingChildren", "Implemented", "Completed"),
        ])
    );

    for group_id in search.memo().get_all_group_ids() {
        let explored_at = report
            .traces
            .iter()
            .position(|t| {
                t.kind == JobKind::GroupExploration
                    && t.target == JobTarget::Group(group_id)
                    && t.to == "Completed"
            })
            .unwrap();
        let first_implementation = report
            .traces
            .iter()
            .position(|t| {
                t.kind == JobKind::ExprImplementation
                    && matches!(t.target, JobTarget::Expr(e) if search.memo().get_group_id(e) == group_id)
            })
            .unwrap();
        assert!(explored_at < first_implementation, "group {group_id}");
    }
}

#[test]
fn expression_jobs_suspend_on_child_groups() {
    let search = search(all_rules(), 1);
    let report = search
        .optimize(project(scan("t1"), Value::UInt64(0)))
        .unwrap();
    let project_expr = search.memo().get_all_exprs_in_group(report.root_group)[0];

    assert_eq!(
        transitions(&report, JobKind::ExprImplementation, JobTarget::Expr(project_expr)),
        edges(&[
            ("Initialized", "ImplementingChildren", "Initialized"),
            ("Initialized", "ChildrenImplemented", "ChildrenImplemented"),
            ("ChildrenImplemented", "ImplementingSelf", "ChildrenImplemented"),
            ("ChildrenImplemented", "SelfImplemented", "Completed"),
        ])
    );
    // The project has no transformation rule.
    assert_eq!(
        transitions(&report, JobKind::ExprExploration, JobTarget::Expr(project_expr)),
        edges(&[
            ("Initialized", "ExploringChildren", "Initialized"),
            ("Initialized", "ChildrenExplored", "ChildrenExplored"),
            ("ChildrenExplored", "SelfExplored", "Completed"),
        ])
    );
    assert!(report.stats.suspensions > 0);
}

#[test]
fn second_requester_attaches_to_running_exploration() {
    // The join explores the scan group first, then the filter group. Depth-first, the filter's
    // expression asks for the scan group while its exploration job is still queued.
    let search = search(implementation_rules(), 1);
    let report = search
        .optimize(join(
            scan("t1"),
            filter(scan("t1"), Value::Bool(true)),
            Value::Bool(true),
        ))
        .unwrap();
    assert_clean(&report);
    assert!(report.stats.attached >= 1);

    let scan_group = search.memo().get_expr_info(&scan("t1")).unwrap().0;
    assert_eq!(search.memo().get_group_info(scan_group).exploration_jobs, 1);
    assert_eq!(search.memo().get_group_info(scan_group).implementation_jobs, 1);

    let filter_expr = search
        .memo()
        .get_expr_info(&filter(scan("t1"), Value::Bool(true)))
        .unwrap()
        .1;
    assert_eq!(
        transitions(&report, JobKind::ExprExploration, JobTarget::Expr(filter_expr)),
        edges(&[
            ("Initialized", "ExploringChildren", "Initialized"),
            ("Initialized", "ChildrenExplored", "ChildrenExplored"),
            ("ChildrenExplored", "SelfExplored", "Completed"),
        ])
    );
}

#[test]
fn shared_groups_are_implemented_once() {
    for workers in [1, 2, 8] {
        for order in [SchedulingOrder::DepthFirst, SchedulingOrder::BreadthFirst] {
            init_tracing();
            let search = CascadesSearch::new_with_options(
                all_rules(),
                SearchProperties {
                    workers,
                    order,
                    job_limit: None,
                    enable_tracing: false,
                },
            );
            let shared = scan("t1");
            let report = search
                .optimize(join(
                    filter(shared.clone(), Value::Bool(true)),
                    project(shared, Value::UInt64(1)),
                    Value::Bool(true),
                ))
                .unwrap();
            assert_clean(&report);
            for group_id in search.memo().get_all_group_ids() {
                let info = search.memo().get_group_info(group_id);
                assert!(info.explored && info.implemented, "{group_id}");
                assert_eq!(info.exploration_jobs, 1, "{group_id}");
                assert_eq!(info.implementation_jobs, 1, "{group_id}");
            }
        }
    }
}

#[test]
fn every_expression_is_claimed_once_under_contention() {
    for _ in 0..10 {
        let commute = Arc::new(CountingRule::new(JoinCommuteRule::new()));
        let nlj = Arc::new(CountingRule::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Join,
            MemoTestRelTyp::PhysicalNestedLoopJoin,
            "nlj_impl",
        )));
        let mut rules: Vec<Arc<dyn Rule<MemoTestRelTyp>>> = vec![commute.clone(), nlj.clone()];
        rules.extend(implementation_rules());
        let search = search(rules, 8);
        let report = search.optimize(three_way_join()).unwrap();
        assert_clean(&report);

        let logical_joins = search
            .memo()
            .get_all_group_ids()
            .into_iter()
            .flat_map(|g| search.memo().get_all_exprs_in_group(g))
            .filter(|e| search.memo().get_expr_memoed(*e).typ == MemoTestRelTyp::Join)
            .count();
        assert_eq!(commute.fired().len(), logical_joins);
        assert!(commute.fired().values().all(|&n| n == 1));
        assert_eq!(nlj.fired().len(), logical_joins);
        assert!(nlj.fired().values().all(|&n| n == 1));

        for group_id in search.memo().get_all_group_ids() {
            let logical = search
                .memo()
                .get_all_exprs_in_group(group_id)
                .into_iter()
                .filter(|e| search.memo().get_expr_memoed(*e).typ.is_logical())
                .count();
            let implementations =
                expr_jobs_in_group(&search, &report, JobKind::ExprImplementation, group_id);
            assert_eq!(implementations.len(), logical, "{group_id}");
        }
    }
}

#[test]
fn second_run_is_a_no_op() {
    let search = search(all_rules(), 4);
    let first = search.optimize(three_way_join()).unwrap();
    assert!(first.jobs > 0);
    let exprs = search.memo().estimated_plan_space();

    let second = search.run_optimization(first.root_group).unwrap();
    assert_eq!(second.jobs, 0);
    assert_eq!(second.stats.total_created(), 0);
    assert!(second.traces.is_empty());
    assert_eq!(search.memo().estimated_plan_space(), exprs);
}

#[test]
fn implementation_rule_failure_aborts_the_run() {
    for workers in [1, 4] {
        let mut rules = implementation_rules();
        rules.push(Arc::new(FailingRule::new(MemoTestRelTyp::Scan, true)));
        let search = search(rules, workers);
        let err = search.optimize(three_way_join()).unwrap_err();
        assert!(!err.is_structural());
        match err {
            SearchError::RuleFailed { rule, cause, .. } => {
                assert_eq!(rule, "failing");
                assert!(cause.to_string().contains("Scan"));
            }
            other => panic!("unexpected error {other}"),
        }
        let root = search.memo().get_expr_info(&three_way_join()).unwrap().0;
        assert!(!search.memo().group(root).is_implemented());
    }
}

#[test]
fn exploration_rule_failure_aborts_the_run() {
    let search = search(
        vec![Arc::new(FailingRule::new(MemoTestRelTyp::Join, false))],
        2,
    );
    let err = search.optimize(three_way_join()).unwrap_err();
    assert!(matches!(err, SearchError::RuleFailed { rule: "failing", .. }));
    let root = search.memo().get_expr_info(&three_way_join()).unwrap().0;
    assert!(!search.memo().group(root).is_explored());
}

#[test]
fn job_limit_aborts_the_run() {
    init_tracing();
    let search = CascadesSearch::new_with_options(
        all_rules(),
        SearchProperties {
            workers: 2,
            order: SchedulingOrder::BreadthFirst,
            job_limit: Some(3),
            enable_tracing: false,
        },
    );
    let err = search.optimize(three_way_join()).unwrap_err();
    assert!(matches!(err, SearchError::JobLimitExceeded { limit: 3 }));
}

#[test]
fn unknown_root_is_rejected_before_scheduling() {
    let search = search(all_rules(), 1);
    search.add_plan(scan("t1"));
    let err = search.run_optimization(GroupId(42)).unwrap_err();
    assert!(matches!(err, SearchError::UnknownGroup(GroupId(42))));
    assert!(!search.memo().group(GroupId(0)).is_explored());
}

/// Every group is explored and implemented, and holds a physical expression.
fn assert_fully_implemented(search: &CascadesSearch<MemoTestRelTyp>) {
    for group_id in search.memo().get_all_group_ids() {
        let info = search.memo().get_group_info(group_id);
        assert!(info.explored && info.implemented, "{group_id}");
        assert!(
            info.exprs
                .iter()
                .any(|e| !search.memo().get_expr_memoed(*e).typ.is_logical()),
            "{group_id} has no physical expression"
        );
    }
}

#[test]
fn failed_run_is_completed_by_the_next_run() {
    for workers in [1, 4] {
        let mut rules: Vec<Arc<dyn Rule<MemoTestRelTyp>>> = vec![
            Arc::new(JoinCommuteRule::new()),
            Arc::new(FailOnceRule::new(PhysicalConversionRule::new(
                MemoTestRelTyp::Scan,
                MemoTestRelTyp::PhysicalScan,
                "scan_impl",
            ))),
        ];
        rules.extend(
            implementation_rules()
                .into_iter()
                .filter(|rule| rule.name() != "scan_impl"),
        );
        let search = search(rules, workers);

        let err = search.optimize(three_way_join()).unwrap_err();
        assert!(
            matches!(err, SearchError::RuleFailed { rule: "scan_impl", .. }),
            "{err}"
        );
        let root = search.memo().get_expr_info(&three_way_join()).unwrap().0;
        assert!(!search.memo().group(root).is_implemented());

        let report = search.optimize(three_way_join()).unwrap();
        assert_eq!(report.root_group, root);
        assert_fully_implemented(&search);
        for group_id in search.memo().get_all_group_ids() {
            let info = search.memo().get_group_info(group_id);
            assert!(info.implementation_jobs <= 2, "{group_id}");
        }

        // Nothing is left for a third run.
        let third = search.run_optimization(root).unwrap();
        assert_eq!(third.jobs, 0);
    }
}

#[test]
fn concurrent_runs_on_shared_groups_terminate() {
    for _ in 0..20 {
        init_tracing();
        let search = CascadesSearch::new_with_options(
            all_rules(),
            SearchProperties {
                workers: 4,
                order: SchedulingOrder::BreadthFirst,
                job_limit: None,
                enable_tracing: false,
            },
        );
        let left = search.add_plan(filter(three_way_join(), Value::Bool(true)));
        let right = search.add_plan(project(three_way_join(), Value::UInt64(0)));

        let search = &search;
        let reports = std::thread::scope(|s| {
            let handles = [left, right].map(|root| s.spawn(move || search.run_optimization(root)));
            handles.map(|handle| handle.join().unwrap())
        });
        for report in reports {
            assert_clean(&report.unwrap());
        }
        assert_fully_implemented(&search);
        for group_id in search.memo().get_all_group_ids() {
            let info = search.memo().get_group_info(group_id);
            assert_eq!(info.implementation_jobs, 1, "{group_id}");
            assert_eq!(info.exploration_jobs, 1, "{group_id}");
        }
    }
}
