//! Remote command execution over ssh.
//!
//! A transport failure (we could not reach the machine at all) is an error; a
//! non-zero exit status from the remote command is *not* — it comes back as
//! data and the caller decides whether it is fatal. This runner has no retry
//! logic of its own: not every remote command is safe to blindly repeat, so
//! retrying is the caller's call via [`crate::retry::retry`].

use std::process::Command;

use tracing::trace;

use crate::errors::TestError;

/// ssh reserves this exit code for its own failures, as opposed to the exit
/// status of the remote command.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Remote exit status (0 on success).
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Blocking ssh runner for a single remote user.
#[derive(Debug, Clone)]
pub struct SshRunner {
    pub user: String,
    pub connect_timeout_secs: u32,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl SshRunner {
    /// Run `command` on the machine at `address` (`host` or `host:port`),
    /// blocking until the remote side finishes or the transport fails.
    pub fn run(&self, address: &str, command: &str) -> Result<CommandOutput, TestError> {
        let (host, port) = split_host_port(address);

        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            &format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]);
        if let Some(port) = port {
            cmd.args(["-p", port]);
        }
        cmd.arg(format!("{}@{}", self.user, host));
        cmd.arg("--");
        cmd.arg(command);

        trace!("ssh {}@{}: {}", self.user, address, command);
        let output = cmd.output().map_err(|e| TestError::Transport {
            address: address.to_string(),
            detail: format!("failed to spawn ssh: {e}"),
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let status = output.status.code().unwrap_or(-1);
        if status == SSH_TRANSPORT_EXIT {
            return Err(TestError::Transport {
                address: address.to_string(),
                detail: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            status,
        })
    }
}

/// Split `host:port` into host and optional port. Addresses here are always
/// IPv4 or hostnames, so the last colon is unambiguous.
fn split_host_port(address: &str) -> (&str, Option<&str>) {
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (address, None),
    }
}
