// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for an lvblob node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and the cluster address map
// - Pool state store backend
// - Host command execution, relay and attachment retry settings
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::pool::NodeId;
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "lvblob.io/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "lvblob.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    pub node: NodeIdentity,

    /// Every node's address, used for ssh dispatch and NBD URIs
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub attachment: AttachmentConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Cluster-wide node name; holders and `active_on` refer to it
    pub id: String,

    /// Address other nodes reach this node on (defaults to `id`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Upper bound on a single host command
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,

    /// Run local commands through `nsenter --target 1` (containerized agents)
    #[serde(default)]
    pub host_namespace: bool,

    /// User for ssh dispatch to remote nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    /// Extra `-o` options passed to ssh
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// NBD port the storage daemon listens on
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// QMP control socket of the per-node storage daemon
    #[serde(default = "default_qmp_socket")]
    pub qmp_socket: String,

    /// nbd-client I/O timeout
    #[serde(default = "default_client_timeout")]
    pub client_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Attempts per engine call before giving up on CAS conflicts
    #[serde(default = "default_cas_attempts")]
    pub cas_max_attempts: u32,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    120
}

fn default_relay_port() -> u16 {
    10809
}

fn default_qmp_socket() -> String {
    "/run/lvblob/qsd.qmp".to_string()
}

fn default_client_timeout() -> u64 {
    30
}

fn default_cas_attempts() -> u32 {
    8
}

fn default_backoff_initial() -> u64 {
    20
}

fn default_backoff_max() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_command_timeout(),
            host_namespace: false,
            ssh_user: None,
            ssh_options: Vec::new(),
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            qmp_socket: default_qmp_socket(),
            client_timeout_seconds: default_client_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_seconds)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            cas_max_attempts: default_cas_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl AttachmentConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = self
            .backoff_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "lvblob-node".to_string())
}

impl Default for NodeConfigSpec {
    fn default() -> Self {
        Self {
            node: NodeIdentity {
                id: local_hostname(),
                address: None,
            },
            cluster: ClusterConfig::default(),
            storage: StorageConfig::default(),
            commands: CommandsConfig::default(),
            relay: RelayConfig::default(),
            attachment: AttachmentConfig::default(),
            observability: None,
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: local_hostname(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigSpec {
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.id.clone())
    }

    /// Address map of the cluster, including this node.
    pub fn node_addresses(&self) -> HashMap<NodeId, String> {
        let mut addresses: HashMap<NodeId, String> = self
            .cluster
            .nodes
            .iter()
            .map(|n| (NodeId::new(n.id.clone()), n.address.clone()))
            .collect();
        addresses.entry(self.node_id()).or_insert_with(|| {
            self.node
                .address
                .clone()
                .unwrap_or_else(|| self.node.id.clone())
        });
        addresses
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. LVBLOB_CONFIG_PATH environment variable
    /// 2. ./lvblob-config.yaml (working directory)
    /// 3. ~/.lvblob/config.yaml (user home)
    /// 4. /etc/lvblob/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LVBLOB_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./lvblob-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lvblob").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/lvblob/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LVBLOB_NODE_ID") {
            if val.trim().is_empty() {
                tracing::warn!("Ignoring empty LVBLOB_NODE_ID");
            } else {
                tracing::info!("Environment override: LVBLOB_NODE_ID={}", val);
                self.spec.node.id = val;
            }
        }

        if let Ok(url) = std::env::var("LVBLOB_DATABASE_URL") {
            tracing::info!("Environment override: LVBLOB_DATABASE_URL (postgres backend)");
            let max_connections = match &self.spec.storage.backend {
                StorageBackend::Postgres(existing) => existing.max_connections,
                StorageBackend::InMemory => 5,
            };
            self.spec.storage.backend = StorageBackend::Postgres(PostgresConfig {
                connection_string: url,
                max_connections,
            });
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        let mut seen = std::collections::HashSet::new();
        for node in &self.spec.cluster.nodes {
            if node.id.is_empty() || node.address.is_empty() {
                anyhow::bail!("spec.cluster.nodes entries need both id and address");
            }
            if !seen.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate cluster node id: {}", node.id);
            }
        }

        if let StorageBackend::Postgres(pg) = &self.spec.storage.backend {
            if pg.connection_string.is_empty() {
                anyhow::bail!("spec.storage.backend.connection_string cannot be empty");
            }
        }

        if self.spec.commands.timeout_seconds == 0 {
            anyhow::bail!("spec.commands.timeout_seconds must be positive");
        }

        if self.spec.attachment.cas_max_attempts == 0 {
            anyhow::bail!("spec.attachment.cas_max_attempts must be at least 1");
        }

        if self.spec.attachment.backoff_initial_ms > self.spec.attachment.backoff_max_ms {
            anyhow::bail!("spec.attachment.backoff_initial_ms exceeds backoff_max_ms");
        }

        if let Some(logging) = self.spec.observability.as_ref().and_then(|o| o.logging.as_ref()) {
            if logging.format != "json" && logging.format != "text" {
                anyhow::bail!("Invalid logging format: '{}'. Expected json or text", logging.format);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfigManifest::default();
        assert_eq!(manifest.api_version, "lvblob.io/v1");
        assert_eq!(manifest.kind, "NodeConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.storage.backend, StorageBackend::InMemory);
        assert_eq!(manifest.spec.relay.port, 10809);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
apiVersion: lvblob.io/v1
kind: NodeConfig
metadata:
  name: worker-1
spec:
  node:
    id: worker-1
    address: 10.0.0.11
  cluster:
    nodes:
      - id: worker-2
        address: 10.0.0.12
  storage:
    backend:
      type: postgres
      connection_string: postgres://lvblob@db/lvblob
  commands:
    timeout_seconds: 60
    host_namespace: true
  attachment:
    cas_max_attempts: 4
"#;
        let manifest = NodeConfigManifest::from_yaml_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.spec.node_id(), NodeId::from("worker-1"));
        assert!(manifest.spec.commands.host_namespace);
        assert_eq!(manifest.spec.attachment.cas_max_attempts, 4);
        assert_eq!(manifest.spec.attachment.backoff_max_ms, 2000);
        match &manifest.spec.storage.backend {
            StorageBackend::Postgres(pg) => {
                assert_eq!(pg.connection_string, "postgres://lvblob@db/lvblob");
                assert_eq!(pg.max_connections, 5);
            }
            other => panic!("unexpected backend {:?}", other),
        }

        let addresses = manifest.spec.node_addresses();
        assert_eq!(addresses[&NodeId::from("worker-1")], "10.0.0.11");
        assert_eq!(addresses[&NodeId::from("worker-2")], "10.0.0.12");
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut manifest = NodeConfigManifest::default();
        manifest.spec.node.id = "node-a".to_string();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = NodeConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, manifest.metadata.name);
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeConfigManifest::load_or_default(Some(dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = NodeConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.node.id = "".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.node.id = "n1".to_string();

        manifest.spec.cluster.nodes = vec![
            ClusterNode { id: "n2".into(), address: "a".into() },
            ClusterNode { id: "n2".into(), address: "b".into() },
        ];
        assert!(manifest.validate().is_err());
        manifest.spec.cluster.nodes.clear();

        manifest.spec.attachment.cas_max_attempts = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.attachment.cas_max_attempts = 3;

        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = AttachmentConfig {
            cas_max_attempts: 10,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
        };
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(3), Duration::from_millis(40));
        assert_eq!(config.backoff(4), Duration::from_millis(50));
        assert_eq!(config.backoff(40), Duration::from_millis(50));
    }
}
