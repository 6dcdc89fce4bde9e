// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host Command Boundary - Anti-Corruption Layer for privileged tools
//!
//! Volume management, device-mapper and NBD operations are carried out by
//! running `lvm`, `dmsetup`, `nbd-client` and friends on a specific node.
//! This module defines the contract for doing so; the process plumbing lives
//! in `crate::infrastructure::command`.
//!
//! A command result is interpreted as
//! `(combined output, exit code) → success | tolerated substring ⇒ success | error`.
//! The tolerated substrings are part of the contract with the underlying
//! tools and are matched against the lower-cased output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::pool::NodeId;

/// Output marker: the object being created is already present.
pub const ALREADY_EXISTS: &str = "already exists";
/// Output marker: the object being removed is already gone (LVM wording).
pub const FAILED_TO_FIND: &str = "failed to find";
/// Output marker: an export/node-name is already registered.
pub const ALREADY_IN_USE: &str = "already in use";
/// Output marker: the object being removed is already gone.
pub const NOT_FOUND: &str = "not found";
/// Output marker: the device-mapper device is already gone.
pub const NO_SUCH_DEVICE: &str = "no such device";

/// A command to execute in the host mount/PID namespace of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Data written to the command's stdin, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Full argv, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Raw result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub combined: String,
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        Self {
            combined: stdout.clone(),
            stdout,
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            combined: output.into(),
            stdout: String::new(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the output contains one of the `tolerated` markers.
    pub fn contains_any(&self, tolerated: &[&str]) -> bool {
        let lowered = self.combined.to_lowercase();
        tolerated.iter().any(|marker| lowered.contains(marker))
    }
}

/// Failure of the command boundary.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("`{command}` on {node} exited with {exit_code}: {output}")]
    Failed {
        node: NodeId,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("`{command}` on {node} timed out after {timeout:?}")]
    TimedOut {
        node: NodeId,
        command: String,
        timeout: Duration,
    },

    #[error("Failed to spawn `{command}` on {node}: {reason}")]
    Spawn {
        node: NodeId,
        command: String,
        reason: String,
    },

    #[error("No way to reach node {0} (no job dispatcher configured)")]
    Unreachable(NodeId),

    #[error("Unexpected output from `{command}` on {node}: {reason}")]
    UnexpectedOutput {
        node: NodeId,
        command: String,
        reason: String,
    },
}

/// Executes host commands on any node of the cluster.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` on `node` and return its raw output. Non-zero exit codes
    /// are not errors at this level; see [`CommandRunnerExt::run_checked`].
    async fn run(&self, node: &NodeId, command: &HostCommand) -> Result<CommandOutput, CommandError>;
}

/// Remote execution collaborator (a job on another node, ssh, ...).
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, node: &NodeId, command: &HostCommand) -> Result<CommandOutput, CommandError>;
}

/// Idempotency-aware helpers on top of [`CommandRunner`].
#[async_trait]
pub trait CommandRunnerExt: CommandRunner {
    /// Run and treat success or any `tolerated` marker as success.
    async fn run_checked(
        &self,
        node: &NodeId,
        command: &HostCommand,
        tolerated: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run(node, command).await?;
        if output.is_success() {
            return Ok(output);
        }
        if output.contains_any(tolerated) {
            tracing::debug!(
                node = %node,
                command = %command,
                exit_code = output.exit_code,
                "Command failure tolerated as already converged"
            );
            return Ok(output);
        }
        Err(CommandError::Failed {
            node: node.clone(),
            command: command.to_string(),
            exit_code: output.exit_code,
            output: output.combined.trim().to_string(),
        })
    }
}

impl<T: CommandRunner + ?Sized> CommandRunnerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_command_builder() {
        let cmd = HostCommand::new("lvchange")
            .arg("--activate")
            .args(["n", "vg0/lv"]);
        assert_eq!(cmd.argv(), vec!["lvchange", "--activate", "n", "vg0/lv"]);
        assert_eq!(cmd.to_string(), "lvchange --activate n vg0/lv");
    }

    #[test]
    fn test_tolerated_markers_match_case_insensitively() {
        let output = CommandOutput::failure(5, "  Failed to find logical volume \"vg0/lv\"");
        assert!(output.contains_any(&[FAILED_TO_FIND]));
        assert!(!output.contains_any(&[ALREADY_EXISTS]));

        let output = CommandOutput::failure(1, "device-mapper: remove ioctl on x failed: No such device or address");
        assert!(output.contains_any(&[NO_SUCH_DEVICE]));
    }
}
