// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::blob::BlobName;
use crate::domain::pool::{Holder, NodeId, PoolName};

/// Attachment lifecycle events, published after the state store commit that
/// made them true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttachmentEvent {
    BlobAttached {
        pool: PoolName,
        holder: Holder,
        path: PathBuf,
        /// `false` when the access goes through the relay
        direct: bool,
        attached_at: DateTime<Utc>,
    },
    BlobDetached {
        pool: PoolName,
        holder: Holder,
        detached_at: DateTime<Utc>,
    },
    PoolActivated {
        pool: PoolName,
        node: NodeId,
        activated_at: DateTime<Utc>,
    },
    PoolDeactivated {
        pool: PoolName,
        node: NodeId,
        deactivated_at: DateTime<Utc>,
    },
    PoolMigrated {
        pool: PoolName,
        from: NodeId,
        to: NodeId,
        migrated_at: DateTime<Utc>,
    },
}

/// Blob lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlobEvent {
    BlobCreated {
        blob: BlobName,
        pool: PoolName,
        size_bytes: u64,
        created_at: DateTime<Utc>,
    },
    BlobExpanded {
        blob: BlobName,
        pool: PoolName,
        size_bytes: u64,
        expanded_at: DateTime<Utc>,
    },
    BlobDeleted {
        blob: BlobName,
        pool: PoolName,
        deleted_at: DateTime<Utc>,
    },
}

/// Changes to the declarative activation resource; these wake the reconcilers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivationEvent {
    WorkItemsChanged {
        pool: PoolName,
        assigned_node: Option<NodeId>,
        changed_at: DateTime<Utc>,
    },
    /// A reconciler's background engine call finished.
    TaskFinished {
        pool: PoolName,
        node: NodeId,
        task: String,
        succeeded: bool,
        finished_at: DateTime<Utc>,
    },
}

impl AttachmentEvent {
    pub fn pool(&self) -> &PoolName {
        match self {
            Self::BlobAttached { pool, .. }
            | Self::BlobDetached { pool, .. }
            | Self::PoolActivated { pool, .. }
            | Self::PoolDeactivated { pool, .. }
            | Self::PoolMigrated { pool, .. } => pool,
        }
    }
}

impl BlobEvent {
    pub fn pool(&self) -> &PoolName {
        match self {
            Self::BlobCreated { pool, .. } | Self::BlobExpanded { pool, .. } | Self::BlobDeleted { pool, .. } => pool,
        }
    }
}

impl ActivationEvent {
    pub fn pool(&self) -> &PoolName {
        match self {
            Self::WorkItemsChanged { pool, .. } | Self::TaskFinished { pool, .. } => pool,
        }
    }
}
