// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pool aggregate: exclusive activation plus reference-counted holders.
//!
//! A pool is the thin-pool logical volume shared by a blob and every blob
//! copied from it. Only one node may have the thin-pool active at any time
//! (`active_on`); every consumer of a blob is recorded as a [`Holder`].
//!
//! # Invariants
//!
//! - `holders` is empty if and only if `active_on` is `None`.
//! - A holder on `active_on` is a direct attachment, any other holder is
//!   relayed over NBD from `active_on`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::domain::blob::BlobName;

// ============================================================================
// Value Objects
// ============================================================================

/// Cluster node identifier (the node's name in the cluster).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a pool; also the prefix of its thin-pool LV name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolName(pub String);

impl PoolName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the thin-pool logical volume backing this pool.
    pub fn thin_pool_lv_name(&self) -> String {
        format!("{}-thinpool", self.0)
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One consumer's need for a blob on a node.
///
/// The `cookie` namespaces independent consumers of the same `(blob, node)`
/// pair, e.g. `"staged"` and `"populating-target"`. The device attachment is
/// shared between them and torn down when the last one detaches.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Holder {
    pub blob: BlobName,
    pub node: NodeId,
    pub cookie: String,
}

impl Holder {
    pub fn new(blob: BlobName, node: NodeId, cookie: impl Into<String>) -> Self {
        Self {
            blob,
            node,
            cookie: cookie.into(),
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.blob, self.node, self.cookie)
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Coarse lifecycle of a pool as seen from the state record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PoolPhase {
    /// No holders; thin-pool LV inactive everywhere.
    Idle,
    /// Thin-pool LV active on exactly one node.
    Active { node: NodeId },
}

/// Events that drive [`PoolPhase`] transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolPhaseEvent {
    FirstHolderAttached { node: NodeId },
    ActiveNodeEmptied { successor: Option<NodeId> },
    Optimized { node: NodeId },
}

/// Side effect the caller must perform to realize a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolTransitionEffect {
    None,
    ActivateOn(NodeId),
    MigrateTo { from: NodeId, to: NodeId },
    DeactivateOn(NodeId),
}

impl PoolPhase {
    pub fn active_node(&self) -> Option<&NodeId> {
        match self {
            Self::Idle => None,
            Self::Active { node } => Some(node),
        }
    }

    /// Compute the next phase and the physical effect it requires.
    pub fn transition(
        &self,
        event: PoolPhaseEvent,
    ) -> Result<(PoolPhase, PoolTransitionEffect), PoolError> {
        match (self, event) {
            (Self::Idle, PoolPhaseEvent::FirstHolderAttached { node }) => Ok((
                Self::Active { node: node.clone() },
                PoolTransitionEffect::ActivateOn(node),
            )),
            (Self::Active { .. }, PoolPhaseEvent::FirstHolderAttached { .. }) => {
                Ok((self.clone(), PoolTransitionEffect::None))
            }
            (Self::Active { node }, PoolPhaseEvent::ActiveNodeEmptied { successor: None }) => Ok((
                Self::Idle,
                PoolTransitionEffect::DeactivateOn(node.clone()),
            )),
            (Self::Active { node }, PoolPhaseEvent::ActiveNodeEmptied { successor: Some(to) })
            | (Self::Active { node }, PoolPhaseEvent::Optimized { node: to }) => {
                if &to == node {
                    return Ok((self.clone(), PoolTransitionEffect::None));
                }
                Ok((
                    Self::Active { node: to.clone() },
                    PoolTransitionEffect::MigrateTo {
                        from: node.clone(),
                        to,
                    },
                ))
            }
            (Self::Idle, event) => Err(PoolError::InvalidTransition(format!(
                "{:?} is not valid for an idle pool",
                event
            ))),
        }
    }
}

/// How a `(blob, node)` pair is attached, derived from the pool record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AttachmentPhase {
    Detached,
    /// Thin LV active on this node, backing path is the LV device.
    Direct,
    /// Backing path is a relay client device served by `server`.
    Relayed { server: NodeId },
}

impl AttachmentPhase {
    pub fn is_attached(&self) -> bool {
        !matches!(self, Self::Detached)
    }
}

// ============================================================================
// Aggregate Root: PoolState
// ============================================================================

/// Durable record for one pool, stored under optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub name: PoolName,
    pub volume_group: String,
    pub active_on: Option<NodeId>,
    #[serde(default)]
    pub holders: BTreeSet<Holder>,
    /// Blobs sharing this pool's thin-pool LV.
    #[serde(default)]
    pub blobs: BTreeSet<BlobName>,
}

impl PoolState {
    pub fn new(name: PoolName, volume_group: impl Into<String>) -> Self {
        Self {
            name,
            volume_group: volume_group.into(),
            active_on: None,
            holders: BTreeSet::new(),
            blobs: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> PoolPhase {
        match &self.active_on {
            Some(node) => PoolPhase::Active { node: node.clone() },
            None => PoolPhase::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active_on.is_none()
    }

    pub fn contains(&self, holder: &Holder) -> bool {
        self.holders.contains(holder)
    }

    /// Whether any holder exists for `(blob, node)`, i.e. the device
    /// attachment on that node is in use.
    pub fn has_attachment(&self, blob: &BlobName, node: &NodeId) -> bool {
        self.holders
            .iter()
            .any(|h| &h.blob == blob && &h.node == node)
    }

    pub fn blob_has_holders(&self, blob: &BlobName) -> bool {
        self.holders.iter().any(|h| &h.blob == blob)
    }

    pub fn node_holds_any(&self, node: &NodeId) -> bool {
        self.holders.iter().any(|h| &h.node == node)
    }

    /// Blobs with at least one holder, in name order.
    pub fn held_blobs(&self) -> BTreeSet<BlobName> {
        self.holders.iter().map(|h| h.blob.clone()).collect()
    }

    /// Nodes holding `blob`, in node order.
    pub fn nodes_holding(&self, blob: &BlobName) -> BTreeSet<NodeId> {
        self.holders
            .iter()
            .filter(|h| &h.blob == blob)
            .map(|h| h.node.clone())
            .collect()
    }

    /// Every node holding anything in the pool, in node order.
    pub fn holder_nodes(&self) -> BTreeSet<NodeId> {
        self.holders.iter().map(|h| h.node.clone()).collect()
    }

    /// Number of distinct `(blob, node)` attachments on `node`.
    pub fn attachment_count(&self, node: &NodeId) -> usize {
        self.holders
            .iter()
            .filter(|h| &h.node == node)
            .map(|h| &h.blob)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Attachment phase of `(blob, node)` under the current `active_on`.
    pub fn attachment_phase(&self, blob: &BlobName, node: &NodeId) -> AttachmentPhase {
        if !self.has_attachment(blob, node) {
            return AttachmentPhase::Detached;
        }
        match &self.active_on {
            Some(active) if active == node => AttachmentPhase::Direct,
            Some(active) => AttachmentPhase::Relayed {
                server: active.clone(),
            },
            None => AttachmentPhase::Detached,
        }
    }

    /// Validate the record's structural invariants.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        match (&self.active_on, self.holders.is_empty()) {
            (None, false) => {
                return Err(PoolError::InvariantViolation(format!(
                    "pool {} has {} holder(s) but no active node",
                    self.name,
                    self.holders.len()
                )))
            }
            (Some(node), true) => {
                return Err(PoolError::InvariantViolation(format!(
                    "pool {} is active on {} without holders",
                    self.name, node
                )))
            }
            _ => {}
        }

        if let Some(holder) = self.holders.iter().find(|h| !self.blobs.contains(&h.blob)) {
            return Err(PoolError::InvariantViolation(format!(
                "pool {} has holder {} for a blob outside the pool",
                self.name, holder
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid pool transition: {0}")]
    InvalidTransition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(blob: &str, node: &str, cookie: &str) -> Holder {
        Holder::new(BlobName::from(blob), NodeId::from(node), cookie)
    }

    fn pool_with(holders: &[Holder], active: Option<&str>) -> PoolState {
        let mut pool = PoolState::new(PoolName::from("p"), "vg0");
        pool.blobs.insert(BlobName::from("a"));
        pool.blobs.insert(BlobName::from("b"));
        pool.holders.extend(holders.iter().cloned());
        pool.active_on = active.map(NodeId::from);
        pool
    }

    #[test]
    fn test_thin_pool_lv_name() {
        assert_eq!(PoolName::from("data").thin_pool_lv_name(), "data-thinpool");
    }

    #[test]
    fn test_invariants_hold_for_idle_and_active_pools() {
        assert!(pool_with(&[], None).check_invariants().is_ok());
        assert!(pool_with(&[holder("a", "n1", "x")], Some("n1"))
            .check_invariants()
            .is_ok());
    }

    #[test]
    fn test_holders_without_active_node_is_a_violation() {
        let pool = pool_with(&[holder("a", "n1", "x")], None);
        assert!(matches!(
            pool.check_invariants(),
            Err(PoolError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_active_node_without_holders_is_a_violation() {
        assert!(pool_with(&[], Some("n1")).check_invariants().is_err());
    }

    #[test]
    fn test_holder_for_foreign_blob_is_a_violation() {
        let pool = pool_with(&[holder("zzz", "n1", "x")], Some("n1"));
        assert!(pool.check_invariants().is_err());
    }

    #[test]
    fn test_attachment_queries() {
        let pool = pool_with(
            &[
                holder("a", "n1", "staged"),
                holder("a", "n1", "populating-target"),
                holder("b", "n2", "staged"),
            ],
            Some("n1"),
        );

        assert!(pool.has_attachment(&BlobName::from("a"), &NodeId::from("n1")));
        assert!(!pool.has_attachment(&BlobName::from("a"), &NodeId::from("n2")));
        assert_eq!(pool.attachment_count(&NodeId::from("n1")), 1);
        assert_eq!(pool.holder_nodes().len(), 2);
        assert_eq!(pool.held_blobs().len(), 2);
        assert!(pool.node_holds_any(&NodeId::from("n2")));
    }

    #[test]
    fn test_phase_transitions() {
        let (phase, effect) = PoolPhase::Idle
            .transition(PoolPhaseEvent::FirstHolderAttached { node: "n1".into() })
            .unwrap();
        assert_eq!(phase.active_node(), Some(&NodeId::from("n1")));
        assert_eq!(effect, PoolTransitionEffect::ActivateOn("n1".into()));

        // A second first-holder event on an active pool keeps the active node.
        let (same, effect) = phase
            .transition(PoolPhaseEvent::FirstHolderAttached { node: "n2".into() })
            .unwrap();
        assert_eq!(same.active_node(), Some(&NodeId::from("n1")));
        assert_eq!(effect, PoolTransitionEffect::None);

        let (migrated, effect) = phase
            .transition(PoolPhaseEvent::ActiveNodeEmptied {
                successor: Some("n2".into()),
            })
            .unwrap();
        assert_eq!(migrated.active_node(), Some(&NodeId::from("n2")));
        assert_eq!(
            effect,
            PoolTransitionEffect::MigrateTo {
                from: "n1".into(),
                to: "n2".into()
            }
        );

        let (idle, effect) = migrated
            .transition(PoolPhaseEvent::ActiveNodeEmptied { successor: None })
            .unwrap();
        assert_eq!(idle, PoolPhase::Idle);
        assert_eq!(effect, PoolTransitionEffect::DeactivateOn("n2".into()));
    }

    #[test]
    fn test_idle_pool_cannot_be_emptied() {
        assert!(PoolPhase::Idle
            .transition(PoolPhaseEvent::ActiveNodeEmptied { successor: None })
            .is_err());
    }

    #[test]
    fn test_attachment_phase_follows_active_node() {
        let pool = pool_with(&[holder("a", "n1", "x"), holder("a", "n2", "y")], Some("n1"));
        let blob = BlobName::from("a");
        assert_eq!(pool.attachment_phase(&blob, &NodeId::from("n1")), AttachmentPhase::Direct);
        assert_eq!(
            pool.attachment_phase(&blob, &NodeId::from("n2")),
            AttachmentPhase::Relayed { server: "n1".into() }
        );
        assert!(!pool.attachment_phase(&blob, &NodeId::from("n3")).is_attached());
    }
}
