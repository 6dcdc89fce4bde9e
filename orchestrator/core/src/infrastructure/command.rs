// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Host command execution
//!
//! - [`LocalCommandRunner`] spawns processes with `tokio::process`, bounded by a
//!   timeout, optionally inside the host mount/PID namespace via `nsenter`.
//! - [`SshDispatcher`] is the default [`JobDispatcher`]: it runs the command on
//!   another node over `ssh` in batch mode.
//! - [`ClusterCommandRunner`] routes each command to the local runner or the
//!   dispatcher depending on the target node.
//! - [`RecordingCommandRunner`] records command lines and replays scripted
//!   output; used by tests of the LVM, device-mapper and relay adapters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::domain::command::{CommandError, CommandOutput, CommandRunner, HostCommand, JobDispatcher};
use crate::domain::pool::NodeId;

const NSENTER_PREFIX: [&str; 5] = ["nsenter", "--target", "1", "--mount", "--pid"];

/// Runs commands on the node this process lives on.
#[derive(Debug, Clone)]
pub struct LocalCommandRunner {
    node: NodeId,
    timeout: Duration,
    host_namespace: bool,
}

impl LocalCommandRunner {
    pub fn new(node: NodeId, timeout: Duration, host_namespace: bool) -> Self {
        Self {
            node,
            timeout,
            host_namespace,
        }
    }

    /// argv actually executed, including the namespace wrapper.
    pub fn effective_argv(&self, command: &HostCommand) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        if self.host_namespace {
            argv.extend(NSENTER_PREFIX.iter().map(|s| s.to_string()));
            argv.push("--".to_string());
        }
        argv.extend(command.argv());
        argv
    }

    pub async fn execute(&self, command: &HostCommand) -> Result<CommandOutput, CommandError> {
        let argv = self.effective_argv(command);
        let (program, args) = match argv.split_first() {
            Some(split) => split,
            None => {
                return Err(CommandError::Spawn {
                    node: self.node.clone(),
                    command: command.to_string(),
                    reason: "empty command".to_string(),
                })
            }
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if command.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_error = |e: std::io::Error| CommandError::Spawn {
            node: self.node.clone(),
            command: command.to_string(),
            reason: e.to_string(),
        };

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(spawn_error)?;
        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_error)?;
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(spawn_error(e)),
            Err(_) => {
                warn!(node = %self.node, command = %command, timeout = ?self.timeout, "Host command timed out");
                return Err(CommandError::TimedOut {
                    node: self.node.clone(),
                    command: command.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        metrics::histogram!("lvblob_command_duration_seconds", "program" => command.program.clone())
            .record(started.elapsed().as_secs_f64());

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(node = %self.node, command = %command, exit_code, "Host command finished");

        Ok(CommandOutput {
            combined: format!("{}{}", stdout, stderr),
            stdout,
            exit_code,
        })
    }
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Runs commands on other nodes with `ssh -o BatchMode=yes`.
pub struct SshDispatcher {
    local: LocalCommandRunner,
    addresses: HashMap<NodeId, String>,
    user: Option<String>,
    options: Vec<String>,
}

impl SshDispatcher {
    pub fn new(
        local: LocalCommandRunner,
        addresses: HashMap<NodeId, String>,
        user: Option<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            local,
            addresses,
            user,
            options,
        }
    }

    /// The `ssh` invocation that runs `command` on `node`.
    pub fn ssh_command(&self, node: &NodeId, command: &HostCommand) -> Result<HostCommand, CommandError> {
        let host = self
            .addresses
            .get(node)
            .ok_or_else(|| CommandError::Unreachable(node.clone()))?;
        let destination = match &self.user {
            Some(user) => format!("{}@{}", user, host),
            None => host.clone(),
        };
        let remote = command
            .argv()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");

        let mut ssh = HostCommand::new("ssh").args(["-o", "BatchMode=yes"]);
        for option in &self.options {
            ssh = ssh.args(["-o", option.as_str()]);
        }
        ssh = ssh.arg(destination).arg("--").arg(remote);
        if let Some(input) = &command.stdin {
            ssh = ssh.stdin(input.clone());
        }
        Ok(ssh)
    }
}

#[async_trait]
impl JobDispatcher for SshDispatcher {
    async fn dispatch(&self, node: &NodeId, command: &HostCommand) -> Result<CommandOutput, CommandError> {
        let ssh = self.ssh_command(node, command)?;
        let output = self.local.execute(&ssh).await?;
        // ssh reserves 255 for its own failures
        if output.exit_code == 255 {
            return Err(CommandError::Spawn {
                node: node.clone(),
                command: command.to_string(),
                reason: format!("ssh failed: {}", output.combined.trim()),
            });
        }
        Ok(output)
    }
}

/// Routes commands to the local runner or the remote dispatcher.
pub struct ClusterCommandRunner {
    local_node: NodeId,
    local: LocalCommandRunner,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
}

impl ClusterCommandRunner {
    pub fn new(local: LocalCommandRunner, dispatcher: Option<Arc<dyn JobDispatcher>>) -> Self {
        Self {
            local_node: local.node.clone(),
            local,
            dispatcher,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }
}

#[async_trait]
impl CommandRunner for ClusterCommandRunner {
    async fn run(&self, node: &NodeId, command: &HostCommand) -> Result<CommandOutput, CommandError> {
        if node == &self.local_node {
            return self.local.execute(command).await;
        }
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(node, command).await,
            None => Err(CommandError::Unreachable(node.clone())),
        }
    }
}

// ============================================================================
// Recording runner
// ============================================================================

/// A command the [`RecordingCommandRunner`] has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub node: NodeId,
    pub command: HostCommand,
}

impl RecordedCommand {
    pub fn line(&self) -> String {
        self.command.to_string()
    }
}

/// Records every command and answers from a script. The first rule whose
/// pattern is a substring of the command line wins; unmatched commands
/// succeed with empty output.
#[derive(Default)]
pub struct RecordingCommandRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    history: Mutex<Vec<RecordedCommand>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose line contains `pattern` with `output`.
    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.rules.lock().push((pattern.into(), output));
    }

    pub fn history(&self) -> Vec<RecordedCommand> {
        self.history.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.history.lock().iter().map(RecordedCommand::line).collect()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, node: &NodeId, command: &HostCommand) -> Result<CommandOutput, CommandError> {
        self.history.lock().push(RecordedCommand {
            node: node.clone(),
            command: command.clone(),
        });
        let line = command.to_string();
        let rules = self.rules.lock();
        Ok(rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::success("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{CommandRunnerExt, FAILED_TO_FIND};

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("lvchange"), "lvchange");
        assert_eq!(shell_quote("vg0/lv-1"), "vg0/lv-1");
        assert_eq!(shell_quote("0 2048 error"), "'0 2048 error'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_host_namespace_wrapping() {
        let runner = LocalCommandRunner::new("n1".into(), Duration::from_secs(5), true);
        let argv = runner.effective_argv(&HostCommand::new("lvs").arg("vg0"));
        assert_eq!(
            argv,
            vec!["nsenter", "--target", "1", "--mount", "--pid", "--", "lvs", "vg0"]
        );
    }

    #[test]
    fn test_ssh_command_line() {
        let local = LocalCommandRunner::new("n1".into(), Duration::from_secs(5), false);
        let dispatcher = SshDispatcher::new(
            local,
            HashMap::from([(NodeId::from("n2"), "10.0.0.2".to_string())]),
            Some("root".to_string()),
            vec!["StrictHostKeyChecking=no".to_string()],
        );
        let cmd = HostCommand::new("dmsetup").args(["create", "x", "--table", "0 8 error"]);
        let ssh = dispatcher.ssh_command(&"n2".into(), &cmd).unwrap();
        assert_eq!(
            ssh.to_string(),
            "ssh -o BatchMode=yes -o StrictHostKeyChecking=no root@10.0.0.2 -- dmsetup create x --table '0 8 error'"
        );
        assert!(matches!(
            dispatcher.ssh_command(&"n9".into(), &cmd),
            Err(CommandError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_local_runner_captures_output_and_exit_code() {
        let runner = LocalCommandRunner::new("n1".into(), Duration::from_secs(5), false);
        let output = runner
            .execute(&HostCommand::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert!(output.combined.contains("err"));
    }

    #[tokio::test]
    async fn test_local_runner_feeds_stdin() {
        let runner = LocalCommandRunner::new("n1".into(), Duration::from_secs(5), false);
        let output = runner
            .execute(&HostCommand::new("cat").stdin("hello"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_local_runner_times_out() {
        let runner = LocalCommandRunner::new("n1".into(), Duration::from_millis(50), false);
        let result = runner.execute(&HostCommand::new("sleep").arg("5")).await;
        assert!(matches!(result, Err(CommandError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_remote_node_without_dispatcher_is_unreachable() {
        let local = LocalCommandRunner::new("n1".into(), Duration::from_secs(5), false);
        let runner = ClusterCommandRunner::new(local, None);
        let result = runner.run(&"n2".into(), &HostCommand::new("true")).await;
        assert!(matches!(result, Err(CommandError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_run_checked_tolerates_markers() {
        let runner = RecordingCommandRunner::new();
        runner.respond("lvremove", CommandOutput::failure(5, "  Failed to find logical volume"));
        runner.respond("lvcreate", CommandOutput::failure(5, "  Insufficient free space"));
        let node = NodeId::from("n1");

        assert!(runner
            .run_checked(&node, &HostCommand::new("lvremove").arg("vg/x"), &[FAILED_TO_FIND])
            .await
            .is_ok());
        let err = runner
            .run_checked(&node, &HostCommand::new("lvcreate").arg("vg/x"), &[FAILED_TO_FIND])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Failed { exit_code: 5, .. }));
        assert_eq!(runner.lines(), vec!["lvremove vg/x", "lvcreate vg/x"]);
    }
}
