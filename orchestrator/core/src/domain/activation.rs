// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pool activation policy.
//!
//! The declarative side of the system records, per pool, the pending work
//! items that need the pool's blobs accessible. Whether a pool must be active
//! is a pure function of those items ([`decide_activation`]). The predicate
//! [`WorkItemKind::needs_activation`] is an explicit case list: adding a kind
//! forces a decision here because the match has no wildcard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::domain::blob::BlobName;
use crate::domain::pool::{Holder, NodeId, PoolName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What a pending work item is about to do with its blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Creating the blob's thin LV.
    Create,
    /// Populating the blob from `source`.
    Clone { source: BlobName },
    /// Taking a thin snapshot of the blob.
    Snapshot,
    /// A consumer on `node` (a staged volume).
    Stage { node: NodeId },
    /// Network-export-only consumer, no local device needed anywhere.
    Export,
    /// Removing the blob's thin LV.
    Delete,
    /// Growing an unattached blob.
    Expand,
}

impl WorkItemKind {
    pub fn needs_activation(&self) -> bool {
        match self {
            Self::Create => true,
            Self::Clone { .. } => true,
            Self::Snapshot => true,
            Self::Stage { .. } => true,
            Self::Export => true,
            Self::Delete => false,
            Self::Expand => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Clone { .. } => "clone",
            Self::Snapshot => "snapshot",
            Self::Stage { .. } => "stage",
            Self::Export => "export",
            Self::Delete => "delete",
            Self::Expand => "expand",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub blob: BlobName,
    pub kind: WorkItemKind,
    /// Node that asked for the work.
    pub requester: NodeId,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(blob: BlobName, kind: WorkItemKind, requester: NodeId) -> Self {
        Self {
            id: WorkItemId::new(),
            blob,
            kind,
            requester,
            created_at: Utc::now(),
        }
    }

    pub fn needs_activation(&self) -> bool {
        self.kind.needs_activation()
    }

    /// Holder cookie the node reconciler attaches this item under.
    pub fn cookie(&self) -> String {
        format!("{}-{}", self.kind.label(), self.id)
    }

    /// Node the item's attachment lives on: the staging node for consumers,
    /// the assigned node for everything else.
    pub fn target_node<'a>(&'a self, assigned: &'a NodeId) -> &'a NodeId {
        match &self.kind {
            WorkItemKind::Stage { node } => node,
            _ => assigned,
        }
    }
}

/// Outcome of the activation policy for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationDecision {
    Keep,
    Assign(NodeId),
    Clear,
}

/// Pure activation policy over the pending work items.
///
/// Something needs activation and nothing is assigned: assign the first such
/// item's requester. Nothing needs activation: clear. Otherwise keep.
pub fn decide_activation(items: &[WorkItem], assigned: Option<&NodeId>) -> ActivationDecision {
    let first_needing = items.iter().find(|item| item.needs_activation());
    match (first_needing, assigned) {
        (Some(item), None) => ActivationDecision::Assign(item.requester.clone()),
        (Some(_), Some(_)) => ActivationDecision::Keep,
        (None, Some(_)) => ActivationDecision::Clear,
        (None, None) => ActivationDecision::Keep,
    }
}

/// Declarative activation resource for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolActivation {
    pub pool: PoolName,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    /// Node the policy picked to host the pool.
    pub assigned_node: Option<NodeId>,
    /// Holders the node reconcilers currently have attached.
    #[serde(default)]
    pub observed: BTreeSet<Holder>,
}

impl PoolActivation {
    pub fn new(pool: PoolName) -> Self {
        Self {
            pool,
            work_items: Vec::new(),
            assigned_node: None,
            observed: BTreeSet::new(),
        }
    }

    /// Add an item and re-run the policy.
    pub fn add_work_item(&mut self, item: WorkItem) -> ActivationDecision {
        if !self.work_items.iter().any(|existing| existing.id == item.id) {
            self.work_items.push(item);
        }
        self.apply_policy()
    }

    /// Drop a finished item and re-run the policy.
    pub fn complete_work_item(&mut self, id: WorkItemId) -> ActivationDecision {
        self.work_items.retain(|item| item.id != id);
        self.apply_policy()
    }

    /// Apply [`decide_activation`] to this resource.
    pub fn apply_policy(&mut self) -> ActivationDecision {
        let decision = decide_activation(&self.work_items, self.assigned_node.as_ref());
        match &decision {
            ActivationDecision::Assign(node) => self.assigned_node = Some(node.clone()),
            ActivationDecision::Clear => self.assigned_node = None,
            ActivationDecision::Keep => {}
        }
        decision
    }

    /// Copy with the policy applied; repositories store this form so no
    /// write path can skip the policy.
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();
        normalized.apply_policy();
        normalized
    }

    /// Holders `node` should have attached right now.
    pub fn desired_holders_for(&self, node: &NodeId) -> BTreeSet<Holder> {
        let Some(assigned) = &self.assigned_node else {
            return BTreeSet::new();
        };
        self.work_items
            .iter()
            .filter(|item| item.needs_activation())
            .filter(|item| item.target_node(assigned) == node)
            .map(|item| Holder::new(item.blob.clone(), node.clone(), item.cookie()))
            .collect()
    }

    pub fn observed_on(&self, node: &NodeId) -> BTreeSet<Holder> {
        self.observed
            .iter()
            .filter(|holder| &holder.node == node)
            .cloned()
            .collect()
    }

    /// Whether `node` has activation work it cannot start yet because the
    /// policy has not assigned the pool.
    pub fn awaiting_assignment(&self, node: &NodeId) -> bool {
        self.assigned_node.is_none()
            && self.work_items.iter().any(|item| {
                item.needs_activation()
                    && match &item.kind {
                        WorkItemKind::Stage { node: stage } => stage == node,
                        _ => &item.requester == node,
                    }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: WorkItemKind, requester: &str) -> WorkItem {
        WorkItem::new(BlobName::from("blob"), kind, NodeId::from(requester))
    }

    #[test]
    fn test_needs_activation_case_list() {
        let cases = [
            (WorkItemKind::Create, true),
            (WorkItemKind::Clone { source: BlobName::from("src") }, true),
            (WorkItemKind::Snapshot, true),
            (WorkItemKind::Stage { node: NodeId::from("n1") }, true),
            (WorkItemKind::Export, true),
            (WorkItemKind::Delete, false),
            (WorkItemKind::Expand, false),
        ];
        for (kind, expected) in cases {
            assert_eq!(kind.needs_activation(), expected, "case {}", kind.label());
        }
    }

    #[test]
    fn test_decide_assigns_requester_when_unassigned() {
        let items = vec![item(WorkItemKind::Delete, "n9"), item(WorkItemKind::Create, "n2")];
        assert_eq!(
            decide_activation(&items, None),
            ActivationDecision::Assign(NodeId::from("n2"))
        );
    }

    #[test]
    fn test_decide_keeps_existing_assignment() {
        let items = vec![item(WorkItemKind::Export, "n2")];
        let assigned = NodeId::from("n1");
        assert_eq!(decide_activation(&items, Some(&assigned)), ActivationDecision::Keep);
    }

    #[test]
    fn test_decide_clears_when_nothing_needs_activation() {
        let items = vec![item(WorkItemKind::Expand, "n1")];
        let assigned = NodeId::from("n1");
        assert_eq!(decide_activation(&items, Some(&assigned)), ActivationDecision::Clear);
        assert_eq!(decide_activation(&[], Some(&assigned)), ActivationDecision::Clear);
        assert_eq!(decide_activation(&[], None), ActivationDecision::Keep);
    }

    #[test]
    fn test_every_mutation_reapplies_policy() {
        let mut activation = PoolActivation::new(PoolName::from("p"));
        let create = item(WorkItemKind::Create, "n1");
        let create_id = create.id;

        assert_eq!(
            activation.add_work_item(create),
            ActivationDecision::Assign(NodeId::from("n1"))
        );
        assert_eq!(activation.assigned_node, Some(NodeId::from("n1")));

        assert_eq!(activation.complete_work_item(create_id), ActivationDecision::Clear);
        assert_eq!(activation.assigned_node, None);
    }

    #[test]
    fn test_desired_holders_follow_targets() {
        let mut activation = PoolActivation::new(PoolName::from("p"));
        let create = item(WorkItemKind::Create, "n1");
        let stage = item(WorkItemKind::Stage { node: NodeId::from("n2") }, "n2");
        activation.add_work_item(create.clone());
        activation.add_work_item(stage.clone());

        let on_n1 = activation.desired_holders_for(&NodeId::from("n1"));
        let on_n2 = activation.desired_holders_for(&NodeId::from("n2"));
        assert_eq!(on_n1.len(), 1);
        assert_eq!(on_n1.iter().next().unwrap().cookie, create.cookie());
        assert_eq!(on_n2.len(), 1);
        assert_eq!(on_n2.iter().next().unwrap().cookie, stage.cookie());
    }

    #[test]
    fn test_awaiting_assignment() {
        let mut activation = PoolActivation::new(PoolName::from("p"));
        activation
            .work_items
            .push(item(WorkItemKind::Stage { node: NodeId::from("n2") }, "n2"));
        assert!(activation.awaiting_assignment(&NodeId::from("n2")));
        assert!(!activation.awaiting_assignment(&NodeId::from("n1")));

        activation.apply_policy();
        assert!(!activation.awaiting_assignment(&NodeId::from("n2")));
    }

    #[test]
    fn test_duplicate_work_item_is_ignored() {
        let mut activation = PoolActivation::new(PoolName::from("p"));
        let export = item(WorkItemKind::Export, "n1");
        activation.add_work_item(export.clone());
        activation.add_work_item(export);
        assert_eq!(activation.work_items.len(), 1);
    }
}
