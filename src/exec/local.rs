use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{check, CommandOutput, Executor, RemoteCommand};
use crate::error::{Result, RiggerError};

/// Runs commands on this machine, for `--local` deploys.
pub struct LocalExecutor {
    host: String,
    has_sudo: bool,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            has_sudo: which::which("sudo").is_ok(),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &RemoteCommand) -> Result<CommandOutput> {
        debug!(
            "[{}] exec{}: {}",
            self.host,
            if cmd.elevate { " (sudo)" } else { "" },
            cmd.script
        );

        // Without sudo (e.g. root in a container) elevation is a no-op.
        let line = if cmd.needs_sudo() && !self.has_sudo {
            cmd.script.clone()
        } else {
            cmd.shell_line()
        };

        let child = Command::new("bash")
            .arg("-c")
            .arg(&line)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(cmd.timeout, child)
            .await
            .map_err(|_| RiggerError::Timeout {
                host: self.host.clone(),
                command: cmd.script.clone(),
                timeout: cmd.timeout,
            })?
            .map_err(|e| RiggerError::Connection {
                host: self.host.clone(),
                message: format!("failed to spawn bash: {}", e),
            })?;

        let output = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        check(&self.host, cmd, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_scripts_and_reports_exit_codes() {
        let exec = LocalExecutor::new();

        let out = exec.exec("echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");

        assert!(!exec.exec_ok("exit 4").await.unwrap());

        let err = exec.exec("echo oops >&2; exit 4").await.unwrap_err();
        match err {
            RiggerError::Command { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 4);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_primitives_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unit.conf");
        let path = path.to_str().unwrap();
        let exec = LocalExecutor::new();

        assert_eq!(exec.read_file(path, false).await.unwrap(), None);

        let content = "line one\nit's quoted\n";
        exec.write_file(path, content, 0o600, false).await.unwrap();
        assert_eq!(exec.read_file(path, false).await.unwrap().as_deref(), Some(content));

        let moved = format!("{}.moved", path);
        exec.rename(path, &moved, false).await.unwrap();
        assert!(!exec.path_exists(path).await.unwrap());
        assert!(exec.path_exists(&moved).await.unwrap());

        exec.remove_file(&moved, false).await.unwrap();
        assert!(!exec.path_exists(&moved).await.unwrap());
    }

    #[tokio::test]
    async fn commands_that_overrun_time_out() {
        let exec = LocalExecutor::new();
        let cmd = RemoteCommand::new("sleep 5").timeout(std::time::Duration::from_millis(100));
        let err = exec.run(&cmd).await.unwrap_err();
        assert!(matches!(err, RiggerError::Timeout { .. }));
    }
}
