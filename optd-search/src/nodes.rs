// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The plan nodes handed to the memo. A plan node is a tree, but its children may also point
//! at groups that already live in the memo, which is how rules produce expressions that reuse
//! existing groups.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cascades::GroupId;

pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync
{
    fn is_logical(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    UInt64(u64),
    Int64(i64),
    Bool(bool),
    String(Arc<str>),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt64(x) => write!(f, "{x}(u64)"),
            Self::Int64(x) => write!(f, "{x}(i64)"),
            Self::Bool(x) => write!(f, "{x}"),
            Self::String(x) => write!(f, "\"{x}\""),
        }
    }
}

pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PlanNodeOrGroup<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Group(GroupId),
}

impl<T: NodeType> Display for PlanNodeOrGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanNode(node) => write!(f, "{node}"),
            Self::Group(group) => write!(f, "{group}"),
        }
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(node: ArcPlanNode<T>) -> Self {
        Self::PlanNode(node)
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(node: PlanNode<T>) -> Self {
        Self::PlanNode(Arc::new(node))
    }
}

impl<T: NodeType> From<GroupId> for PlanNodeOrGroup<T> {
    fn from(group: GroupId) -> Self {
        Self::Group(group)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlanNode<T: NodeType> {
    /// A generic plan node type
    pub typ: T,
    /// Child plan nodes, which may be materialized or placeholder group IDs
    pub children: Vec<PlanNodeOrGroup<T>>,
    /// Data associated with the plan node, if any
    pub data: Option<Value>,
}

impl<T: NodeType> PlanNode<T> {
    pub fn new(typ: T, children: Vec<PlanNodeOrGroup<T>>, data: Option<Value>) -> Self {
        Self {
            typ,
            children,
            data,
        }
    }
}

impl<T: NodeType> Display for PlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        if let Some(data) = &self.data {
            write!(f, " {data}")?;
        }
        for child in &self.children {
            write!(f, " {child}")?;
        }
        write!(f, ")")
    }
}
