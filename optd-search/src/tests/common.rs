// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::cascades::{GroupId, Memo, MemoExpr};
use crate::nodes::{ArcPlanNode, NodeType, PlanNode, PlanNodeOrGroup, Value};
use crate::rules::{Rule, RuleMatcher};

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MemoTestRelTyp {
    Join,
    Project,
    Scan,
    Filter,
    PhysicalNestedLoopJoin,
    PhysicalHashJoin,
    PhysicalProject,
    PhysicalFilter,
    PhysicalScan,
}

impl std::fmt::Display for MemoTestRelTyp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl NodeType for MemoTestRelTyp {
    fn is_logical(&self) -> bool {
        matches!(self, Self::Project | Self::Scan | Self::Join | Self::Filter)
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(
    typ: MemoTestRelTyp,
    children: Vec<PlanNodeOrGroup<MemoTestRelTyp>>,
    data: Option<Value>,
) -> ArcPlanNode<MemoTestRelTyp> {
    Arc::new(PlanNode::new(typ, children, data))
}

pub(crate) fn join(
    left: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    right: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    cond: Value,
) -> ArcPlanNode<MemoTestRelTyp> {
    node(
        MemoTestRelTyp::Join,
        vec![left.into(), right.into()],
        Some(cond),
    )
}

pub(crate) fn scan(table: &str) -> ArcPlanNode<MemoTestRelTyp> {
    node(
        MemoTestRelTyp::Scan,
        vec![],
        Some(Value::String(table.into())),
    )
}

pub(crate) fn physical_scan(table: &str) -> ArcPlanNode<MemoTestRelTyp> {
    node(
        MemoTestRelTyp::PhysicalScan,
        vec![],
        Some(Value::String(table.into())),
    )
}

pub(crate) fn filter(
    input: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    cond: Value,
) -> ArcPlanNode<MemoTestRelTyp> {
    node(MemoTestRelTyp::Filter, vec![input.into()], Some(cond))
}

pub(crate) fn project(
    input: impl Into<PlanNodeOrGroup<MemoTestRelTyp>>,
    expr_list: Value,
) -> ArcPlanNode<MemoTestRelTyp> {
    node(MemoTestRelTyp::Project, vec![input.into()], Some(expr_list))
}

pub(crate) fn group(group_id: GroupId) -> PlanNodeOrGroup<MemoTestRelTyp> {
    PlanNodeOrGroup::Group(group_id)
}

/// Join(A, B) => Join(B, A)
pub(crate) struct JoinCommuteRule {
    matcher: RuleMatcher<MemoTestRelTyp>,
}

impl JoinCommuteRule {
    pub fn new() -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: MemoTestRelTyp::Join,
            },
        }
    }
}

impl Rule<MemoTestRelTyp> for JoinCommuteRule {
    fn matcher(&self) -> &RuleMatcher<MemoTestRelTyp> {
        &self.matcher
    }

    fn apply(
        &self,
        _memo: &Memo<MemoTestRelTyp>,
        expr: &MemoExpr<MemoTestRelTyp>,
    ) -> Result<Vec<PlanNodeOrGroup<MemoTestRelTyp>>> {
        let [left, right] = expr.children.as_slice() else {
            bail!("join must have two children, found {}", expr.children.len());
        };
        Ok(vec![join(
            group(*right),
            group(*left),
            expr.data.clone().unwrap_or(Value::Bool(true)),
        )
        .into()])
    }

    fn name(&self) -> &'static str {
        "join_commute"
    }
}

/// Implements one logical node type as one physical node type with the same children.
pub(crate) struct PhysicalConversionRule {
    matcher: RuleMatcher<MemoTestRelTyp>,
    to: MemoTestRelTyp,
    name: &'static str,
}

impl PhysicalConversionRule {
    pub fn new(from: MemoTestRelTyp, to: MemoTestRelTyp, name: &'static str) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode { typ: from },
            to,
            name,
        }
    }
}

impl Rule<MemoTestRelTyp> for PhysicalConversionRule {
    fn matcher(&self) -> &RuleMatcher<MemoTestRelTyp> {
        &self.matcher
    }

    fn apply(
        &self,
        _memo: &Memo<MemoTestRelTyp>,
        expr: &MemoExpr<MemoTestRelTyp>,
    ) -> Result<Vec<PlanNodeOrGroup<MemoTestRelTyp>>> {
        Ok(vec![PlanNode::new(
            self.to.clone(),
            expr.children.iter().map(|g| group(*g)).collect(),
            expr.data.clone(),
        )
        .into()])
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_impl_rule(&self) -> bool {
        true
    }
}

/// Always fails on the matched node type.
pub(crate) struct FailingRule {
    matcher: RuleMatcher<MemoTestRelTyp>,
    impl_rule: bool,
}

impl FailingRule {
    pub fn new(typ: MemoTestRelTyp, impl_rule: bool) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode { typ },
            impl_rule,
        }
    }
}

impl Rule<MemoTestRelTyp> for FailingRule {
    fn matcher(&self) -> &RuleMatcher<MemoTestRelTyp> {
        &self.matcher
    }

    fn apply(
        &self,
        _memo: &Memo<MemoTestRelTyp>,
        expr: &MemoExpr<MemoTestRelTyp>,
    ) -> Result<Vec<PlanNodeOrGroup<MemoTestRelTyp>>> {
        bail!("cannot handle {}", expr)
    }

    fn name(&self) -> &'static str {
        "failing"
    }

    fn is_impl_rule(&self) -> bool {
        self.impl_rule
    }
}

/// Wraps a rule and counts how many times it fired on each expression.
pub(crate) struct CountingRule<R> {
    inner: R,
    fired: Mutex<HashMap<MemoExpr<MemoTestRelTyp>, usize>>,
}

impl<R: Rule<MemoTestRelTyp>> CountingRule<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn fired(&self) -> HashMap<MemoExpr<MemoTestRelTyp>, usize> {
        self.fired.lock().clone()
    }
}

impl<R: Rule<MemoTestRelTyp>> Rule<MemoTestRelTyp> for CountingRule<R> {
    fn matcher(&self) -> &RuleMatcher<MemoTestRelTyp> {
        self.inner.matcher()
    }

    fn apply(
        &self,
        memo: &Memo<MemoTestRelTyp>,
        expr: &MemoExpr<MemoTestRelTyp>,
    ) -> Result<Vec<PlanNodeOrGroup<MemoTestRelTyp>>> {
        *self.fired.lock().entry(expr.clone()).or_default() += 1;
        self.inner.apply(memo, expr)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_impl_rule(&self) -> bool {
        self.inner.is_impl_rule()
    }
}

/// Fails the first time it is applied, then behaves like the wrapped rule.
pub(crate) struct FailOnceRule<R> {
    inner: R,
    failed: AtomicBool,
}

impl<R: Rule<MemoTestRelTyp>> FailOnceRule<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            failed: AtomicBool::new(false),
        }
    }
}

impl<R: Rule<MemoTestRelTyp>> Rule<MemoTestRelTyp> for FailOnceRule<R> {
    fn matcher(&self) -> &RuleMatcher<MemoTestRelTyp> {
        self.inner.matcher()
    }

    fn apply(
        &self,
        memo: &Memo<MemoTestRelTyp>,
        expr: &MemoExpr<MemoTestRelTyp>,
    ) -> Result<Vec<PlanNodeOrGroup<MemoTestRelTyp>>> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            bail!("transient failure on {}", expr);
        }
        self.inner.apply(memo, expr)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_impl_rule(&self) -> bool {
        self.inner.is_impl_rule()
    }
}

pub(crate) fn implementation_rules() -> Vec<Arc<dyn Rule<MemoTestRelTyp>>> {
    vec![
        Arc::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Scan,
            MemoTestRelTyp::PhysicalScan,
            "scan_impl",
        )),
        Arc::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Filter,
            MemoTestRelTyp::PhysicalFilter,
            "filter_impl",
        )),
        Arc::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Project,
            MemoTestRelTyp::PhysicalProject,
            "project_impl",
        )),
        Arc::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Join,
            MemoTestRelTyp::PhysicalNestedLoopJoin,
            "nlj_impl",
        )),
        Arc::new(PhysicalConversionRule::new(
            MemoTestRelTyp::Join,
            MemoTestRelTyp::PhysicalHashJoin,
            "hash_join_impl",
        )),
    ]
}

pub(crate) fn all_rules() -> Vec<Arc<dyn Rule<MemoTestRelTyp>>> {
    let mut rules: Vec<Arc<dyn Rule<MemoTestRelTyp>>> = vec![Arc::new(JoinCommuteRule::new())];
    rules.extend(implementation_rules());
    rules
}
