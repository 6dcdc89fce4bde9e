// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NBD relay
//!
//! Server side: every node runs a long-lived `qemu-storage-daemon` with a QMP
//! control socket. Exports are managed by piping QMP JSON lines through
//! `socat`, one short session per operation:
//!
//! ```text
//! {"execute":"qmp_capabilities"}
//! {"execute":"nbd-server-start","arguments":{"addr":{"type":"inet","data":{"host":"::","port":"10809"}}}}
//! {"execute":"blockdev-add","arguments":{"driver":"host_device","node-name":"lvblob-<export>","filename":"<lv>","cache":{"direct":true}}}
//! {"execute":"block-export-add","arguments":{"type":"nbd","id":"<export>","node-name":"lvblob-<export>","writable":true}}
//! ```
//!
//! Client side: `nbd-client` with the export name as backend identifier, so
//! the client device of an export can be found again under
//! `/sys/block/nbd*/backend`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::command::{
    CommandError, CommandRunner, CommandRunnerExt, HostCommand, ALREADY_IN_USE, FAILED_TO_FIND, NOT_FOUND,
    NO_SUCH_DEVICE,
};
use crate::domain::pool::NodeId;
use crate::domain::relay::{RelayError, RelayService, ServerIdentity};

/// QMP wording for an NBD server that is already listening.
const ALREADY_RUNNING: &str = "already running";
/// QMP wording for a node-name collision on blockdev-add.
const DUPLICATE: &str = "duplicate";

pub const DEFAULT_NBD_PORT: u16 = 10809;

pub struct QmpNbdRelay {
    runner: Arc<dyn CommandRunner>,
    addresses: HashMap<NodeId, String>,
    port: u16,
    qmp_socket: String,
    client_timeout: Duration,
}

/// Storage-daemon node name backing an export.
pub fn block_node_name(export: &str) -> String {
    format!("lvblob-{}", export)
}

impl QmpNbdRelay {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        addresses: HashMap<NodeId, String>,
        port: u16,
        qmp_socket: impl Into<String>,
        client_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            addresses,
            port,
            qmp_socket: qmp_socket.into(),
            client_timeout,
        }
    }

    fn host(&self, node: &NodeId) -> Result<&str, RelayError> {
        self.addresses
            .get(node)
            .map(String::as_str)
            .ok_or_else(|| RelayError::UnknownHost(node.clone()))
    }

    /// Run one QMP session. Returns the `return` payload per command, `Null`
    /// for errors matching `tolerated`.
    async fn qmp(&self, node: &NodeId, commands: &[Value], tolerated: &[&str]) -> Result<Vec<Value>, RelayError> {
        let mut script = String::from("{\"execute\":\"qmp_capabilities\"}\n");
        for command in commands {
            script.push_str(&command.to_string());
            script.push('\n');
        }
        let cmd = HostCommand::new("socat")
            .args(["-t", "5", "-"])
            .arg(format!("UNIX-CONNECT:{}", self.qmp_socket))
            .stdin(script);
        let output = self.runner.run_checked(node, &cmd, &[]).await?;

        let mut responses = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| RelayError::Protocol(format!("invalid QMP line {:?}: {}", line, e)))?;
            if value.get("return").is_some() || value.get("error").is_some() {
                responses.push(value);
            }
        }

        // First response acknowledges qmp_capabilities.
        if responses.len() != commands.len() + 1 {
            return Err(RelayError::Protocol(format!(
                "expected {} QMP responses from {}, got {}",
                commands.len() + 1,
                node,
                responses.len()
            )));
        }

        let mut results = Vec::with_capacity(commands.len());
        for (command, response) in commands.iter().zip(responses.into_iter().skip(1)) {
            match response.get("error") {
                None => results.push(response.get("return").cloned().unwrap_or(Value::Null)),
                Some(error) => {
                    let desc = error
                        .get("desc")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown QMP error")
                        .to_string();
                    let lowered = desc.to_lowercase();
                    if tolerated.iter().any(|marker| lowered.contains(marker)) {
                        debug!(node = %node, error = %desc, "QMP failure tolerated as already converged");
                        results.push(Value::Null);
                    } else {
                        return Err(RelayError::Command(CommandError::Failed {
                            node: node.clone(),
                            command: command.get("execute").map(|v| v.to_string()).unwrap_or_default(),
                            exit_code: 0,
                            output: desc,
                        }));
                    }
                }
            }
        }
        Ok(results)
    }

    async fn list_exports(&self, node: &NodeId) -> Result<Vec<String>, RelayError> {
        let results = self.qmp(node, &[json!({"execute": "query-block-exports"})], &[]).await?;
        let exports = results
            .first()
            .and_then(Value::as_array)
            .ok_or_else(|| RelayError::Protocol("query-block-exports did not return a list".to_string()))?;
        Ok(exports
            .iter()
            .filter_map(|e| e.get("id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

/// Device from `nbd-client` output (`Connected /dev/nbd3`).
fn parse_connected_device(output: &str) -> Option<PathBuf> {
    output
        .split_whitespace()
        .find(|token| token.starts_with("/dev/nbd"))
        .map(|token| PathBuf::from(token.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())))
}

/// Device from a sysfs backend path (`/sys/block/nbd3/backend`).
fn parse_sysfs_backend(path: &str) -> Option<PathBuf> {
    path.trim()
        .split('/')
        .find(|part| part.starts_with("nbd"))
        .map(|dev| PathBuf::from(format!("/dev/{}", dev)))
}

#[async_trait]
impl RelayService for QmpNbdRelay {
    async fn start_server(&self, node: &NodeId, export: &str, backing_path: &Path) -> Result<String, RelayError> {
        let host = self.host(node)?.to_string();
        let node_name = block_node_name(export);
        let commands = [
            json!({
                "execute": "nbd-server-start",
                "arguments": {"addr": {"type": "inet", "data": {"host": "::", "port": self.port.to_string()}}}
            }),
            json!({
                "execute": "blockdev-add",
                "arguments": {
                    "driver": "host_device",
                    "node-name": node_name,
                    "filename": backing_path.display().to_string(),
                    "cache": {"direct": true}
                }
            }),
            json!({
                "execute": "block-export-add",
                "arguments": {"type": "nbd", "id": export, "node-name": node_name, "writable": true}
            }),
        ];
        self.qmp(node, &commands, &[ALREADY_RUNNING, ALREADY_IN_USE, DUPLICATE])
            .await?;

        let uri = ServerIdentity::new(node.clone(), export).uri(&host);
        info!(node = %node, export, uri = %uri, "Relay export started");
        Ok(uri)
    }

    async fn stop_server(&self, node: &NodeId, export: &str) -> Result<(), RelayError> {
        self.qmp(
            node,
            &[json!({"execute": "block-export-del", "arguments": {"id": export, "mode": "hard"}})],
            &[NOT_FOUND, FAILED_TO_FIND],
        )
        .await?;
        self.qmp(
            node,
            &[json!({"execute": "blockdev-del", "arguments": {"node-name": block_node_name(export)}})],
            &[NOT_FOUND, FAILED_TO_FIND],
        )
        .await?;
        info!(node = %node, export, "Relay export stopped");
        Ok(())
    }

    async fn check_health(&self, node: &NodeId, export: &str) -> Result<(), RelayError> {
        let exports = self.list_exports(node).await?;
        if exports.iter().any(|id| id == export) {
            Ok(())
        } else {
            Err(RelayError::ExportMissing {
                node: node.clone(),
                export: export.to_string(),
            })
        }
    }

    async fn connect_client(&self, node: &NodeId, server: &ServerIdentity) -> Result<PathBuf, RelayError> {
        if let Some(device) = self.client_device(node, &server.export).await? {
            debug!(node = %node, server = %server, device = %device.display(), "Reusing relay client");
            return Ok(device);
        }

        let host = self.host(&server.node)?;
        let cmd = HostCommand::new("nbd-client")
            .arg(host)
            .arg(self.port.to_string())
            .arg("-N")
            .arg(&server.export)
            .arg("-i")
            .arg(&server.export)
            .arg("-persistent")
            .arg("-timeout")
            .arg(self.client_timeout.as_secs().to_string());
        let output = self.runner.run_checked(node, &cmd, &[]).await?;
        let device = parse_connected_device(&output.combined).ok_or_else(|| CommandError::UnexpectedOutput {
            node: node.clone(),
            command: cmd.to_string(),
            reason: format!("no device in output: {}", output.combined.trim()),
        })?;

        info!(node = %node, server = %server, device = %device.display(), "Relay client connected");
        Ok(device)
    }

    async fn disconnect_client(&self, node: &NodeId, device: &Path) -> Result<(), RelayError> {
        let cmd = HostCommand::new("nbd-client")
            .arg("-d")
            .arg(device.display().to_string());
        self.runner.run_checked(node, &cmd, &[NO_SUCH_DEVICE, NOT_FOUND]).await?;
        info!(node = %node, device = %device.display(), "Relay client disconnected");
        Ok(())
    }

    async fn client_device(&self, node: &NodeId, export: &str) -> Result<Option<PathBuf>, RelayError> {
        let cmd = HostCommand::new("sh")
            .arg("-c")
            .arg(r#"grep -l -x -F -- "$1" /sys/block/nbd*/backend 2>/dev/null || true"#)
            .arg("sh")
            .arg(export);
        let output = self.runner.run_checked(node, &cmd, &[]).await?;
        Ok(output.stdout.lines().find_map(parse_sysfs_backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::CommandOutput;
    use crate::infrastructure::command::RecordingCommandRunner;

    const GREETING: &str = r#"{"QMP": {"version": {}, "capabilities": []}}"#;

    fn setup() -> (Arc<RecordingCommandRunner>, QmpNbdRelay) {
        let runner = Arc::new(RecordingCommandRunner::new());
        let relay = QmpNbdRelay::new(
            runner.clone(),
            HashMap::from([
                (NodeId::from("n1"), "10.0.0.1".to_string()),
                (NodeId::from("n2"), "10.0.0.2".to_string()),
            ]),
            DEFAULT_NBD_PORT,
            "/run/lvblob/qsd.qmp",
            Duration::from_secs(30),
        );
        (runner, relay)
    }

    fn qmp_output(responses: &[&str]) -> CommandOutput {
        let mut out = format!("{}\n{{\"return\": {{}}}}\n", GREETING);
        for r in responses {
            out.push_str(r);
            out.push('\n');
        }
        CommandOutput::success(out)
    }

    #[test]
    fn test_output_parsers() {
        assert_eq!(
            parse_connected_device("Negotiation: ..size = 1MB\nConnected /dev/nbd3\n"),
            Some(PathBuf::from("/dev/nbd3"))
        );
        assert_eq!(parse_connected_device("nothing here"), None);
        assert_eq!(
            parse_sysfs_backend("/sys/block/nbd12/backend\n"),
            Some(PathBuf::from("/dev/nbd12"))
        );
    }

    #[tokio::test]
    async fn test_start_server_tolerates_existing_export() {
        let (runner, relay) = setup();
        runner.respond(
            "socat",
            qmp_output(&[
                r#"{"error": {"class": "GenericError", "desc": "NBD server already running"}}"#,
                r#"{"error": {"class": "GenericError", "desc": "Duplicate nodes with node-name='lvblob-vol1'"}}"#,
                r#"{"error": {"class": "GenericError", "desc": "Block export id 'vol1' is already in use"}}"#,
            ]),
        );
        let uri = relay
            .start_server(&"n1".into(), "vol1", Path::new("/dev/vg0/vol1"))
            .await
            .unwrap();
        assert_eq!(uri, "nbd://10.0.0.1/vol1");

        let history = runner.history();
        assert_eq!(history[0].line(), "socat -t 5 - UNIX-CONNECT:/run/lvblob/qsd.qmp");
        let script = history[0].command.stdin.clone().unwrap();
        assert!(script.starts_with("{\"execute\":\"qmp_capabilities\"}\n"));
        assert!(script.contains("\"driver\":\"host_device\""));
        assert!(script.contains("\"writable\":true"));
    }

    #[tokio::test]
    async fn test_unexpected_qmp_error_fails() {
        let (runner, relay) = setup();
        runner.respond(
            "socat",
            qmp_output(&[
                r#"{"return": {}}"#,
                r#"{"error": {"class": "GenericError", "desc": "Could not open '/dev/vg0/vol1': No such file or directory"}}"#,
                r#"{"return": {}}"#,
            ]),
        );
        let err = relay
            .start_server(&"n1".into(), "vol1", Path::new("/dev/vg0/vol1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Command(CommandError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_stop_server_tolerates_missing_export() {
        let (runner, relay) = setup();
        runner.respond(
            "socat",
            qmp_output(&[r#"{"error": {"class": "GenericError", "desc": "Export 'vol1' is not found"}}"#]),
        );
        assert!(relay.stop_server(&"n1".into(), "vol1").await.is_ok());
        assert_eq!(runner.lines().len(), 2);
    }

    #[tokio::test]
    async fn test_check_health() {
        let (runner, relay) = setup();
        runner.respond(
            "socat",
            qmp_output(&[r#"{"return": [{"type": "nbd", "id": "vol1", "node-name": "lvblob-vol1", "shutting-down": false}]}"#]),
        );
        assert!(relay.check_health(&"n1".into(), "vol1").await.is_ok());
        assert!(matches!(
            relay.check_health(&"n1".into(), "vol2").await,
            Err(RelayError::ExportMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_client_runs_nbd_client() {
        let (runner, relay) = setup();
        runner.respond("nbd-client", CommandOutput::success("Connected /dev/nbd0\n"));
        let device = relay
            .connect_client(&"n2".into(), &ServerIdentity::new("n1".into(), "vol1"))
            .await
            .unwrap();
        assert_eq!(device, PathBuf::from("/dev/nbd0"));
        let lines = runner.lines();
        assert_eq!(
            lines[1],
            "nbd-client 10.0.0.1 10809 -N vol1 -i vol1 -persistent -timeout 30"
        );
    }

    #[tokio::test]
    async fn test_connect_client_reuses_existing_device() {
        let (runner, relay) = setup();
        runner.respond("/sys/block", CommandOutput::success("/sys/block/nbd5/backend\n"));
        let device = relay
            .connect_client(&"n2".into(), &ServerIdentity::new("n1".into(), "vol1"))
            .await
            .unwrap();
        assert_eq!(device, PathBuf::from("/dev/nbd5"));
        assert_eq!(runner.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_server_host() {
        let (_runner, relay) = setup();
        let err = relay
            .connect_client(&"n2".into(), &ServerIdentity::new("n9".into(), "vol1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownHost(_)));
    }

    #[tokio::test]
    async fn test_disconnect_client() {
        let (runner, relay) = setup();
        relay.disconnect_client(&"n2".into(), Path::new("/dev/nbd0")).await.unwrap();
        assert_eq!(runner.lines(), vec!["nbd-client -d /dev/nbd0"]);
    }
}
