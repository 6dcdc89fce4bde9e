// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Network block relay contract.
//!
//! The node holding a pool active exports a blob's LV over NBD; any other
//! node connects a client and gets a local `/dev/nbdN` to stack the dual
//! device-mapper wrapper on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::command::CommandError;
use crate::domain::pool::NodeId;

/// Identity of an export: the serving node plus the export name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub node: NodeId,
    pub export: String,
}

impl ServerIdentity {
    pub fn new(node: NodeId, export: impl Into<String>) -> Self {
        Self {
            node,
            export: export.into(),
        }
    }

    /// `nbd://<host>/<export>` for a resolved host.
    pub fn uri(&self, host: &str) -> String {
        format!("nbd://{}/{}", host, self.export)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.export)
    }
}

#[async_trait]
pub trait RelayService: Send + Sync {
    /// Export `backing_path` from `node`; returns the export URI.
    async fn start_server(&self, node: &NodeId, export: &str, backing_path: &Path) -> Result<String, RelayError>;

    async fn stop_server(&self, node: &NodeId, export: &str) -> Result<(), RelayError>;

    /// Error if the export disappeared (e.g. the serving daemon restarted).
    async fn check_health(&self, node: &NodeId, export: &str) -> Result<(), RelayError>;

    /// Connect a client on `node`; returns the local device path.
    async fn connect_client(&self, node: &NodeId, server: &ServerIdentity) -> Result<PathBuf, RelayError>;

    async fn disconnect_client(&self, node: &NodeId, device: &Path) -> Result<(), RelayError>;

    /// Device of the client on `node` connected to `export`, if any.
    async fn client_device(&self, node: &NodeId, export: &str) -> Result<Option<PathBuf>, RelayError>;
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Export {export} is not served by {node}")]
    ExportMissing { node: NodeId, export: String },

    #[error("Relay protocol error: {0}")]
    Protocol(String),

    #[error("No address known for node {0}")]
    UnknownHost(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_identity_uri() {
        let id = ServerIdentity::new(NodeId::from("node-1"), "vol1");
        assert_eq!(id.uri("10.0.0.7"), "nbd://10.0.0.7/vol1");
        assert_eq!(id.to_string(), "node-1:vol1");
    }
}
