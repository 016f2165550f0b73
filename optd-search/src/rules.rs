// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::mem::Discriminant;

use anyhow::Result;

use crate::cascades::{Memo, MemoExpr};
use crate::nodes::{NodeType, PlanNodeOrGroup};

pub type RuleId = usize;

/// Decides whether a rule is worth firing on a memo expression. Only the top node is matched;
/// rules look into child groups through the memo themselves.
#[derive(Debug, Clone)]
pub enum RuleMatcher<T: NodeType> {
    MatchNode { typ: T },
    MatchDiscriminant { typ_discriminant: Discriminant<T> },
    MatchAny,
}

impl<T: NodeType> RuleMatcher<T> {
    pub fn top_matches(&self, match_typ: &T) -> bool {
        match self {
            Self::MatchNode { typ } => typ == match_typ,
            Self::MatchDiscriminant { typ_discriminant } => {
                std::mem::discriminant(match_typ) == *typ_discriminant
            }
            Self::MatchAny => true,
        }
    }
}

/// A rule can be two kind:
/// 1. transformation rule fired to expand expression, generating new logical expressions
/// 2. implementation rule fired to generating corresponding physical expressions.
///
/// The search only cares about what a rule adds to the group; an error returned from `apply`
/// fails the whole run.
pub trait Rule<T: NodeType>: 'static + Send + Sync {
    fn matcher(&self) -> &RuleMatcher<T>;

    fn apply(&self, memo: &Memo<T>, expr: &MemoExpr<T>) -> Result<Vec<PlanNodeOrGroup<T>>>;

    fn name(&self) -> &'static str;

    fn is_impl_rule(&self) -> bool {
        false
    }
}
