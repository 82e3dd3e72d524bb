pub mod local;
#[cfg(test)]
pub mod mock;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, RiggerError};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// A shell script to run on a host, plus how to run it.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub script: String,
    pub elevate: bool,
    /// Run as this account through `sudo -u`; ignored when `elevate` is set
    pub run_as: Option<String>,
    pub timeout: Duration,
    pub best_effort: bool,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            elevate: false,
            run_as: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            best_effort: false,
        }
    }

    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    /// Nonzero exit is returned as output instead of an error.
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The line handed to `bash -c`, wrapped in sudo when elevated or run
    /// as another account.
    pub fn shell_line(&self) -> String {
        if self.elevate {
            format!("sudo bash -c {}", shell_quote(&self.script))
        } else if let Some(user) = &self.run_as {
            format!("sudo -u {} -H bash -c {}", shell_quote(user), shell_quote(&self.script))
        } else {
            self.script.clone()
        }
    }

    pub fn needs_sudo(&self) -> bool {
        self.elevate || self.run_as.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Turn a finished command into a result, honouring `best_effort`.
pub(crate) fn check(host: &str, cmd: &RemoteCommand, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() || cmd.best_effort {
        return Ok(output);
    }

    Err(RiggerError::Command {
        host: host.to_string(),
        command: cmd.script.clone(),
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_string(),
    })
}

/// Command channel to one host.
///
/// Every call may change remote state. Implementations never retry; a
/// command either finishes (successfully or not) or the call fails with a
/// transport error.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Identity of the host this executor is bound to.
    fn host(&self) -> &str;

    async fn run(&self, cmd: &RemoteCommand) -> Result<CommandOutput>;

    /// Run a script and return stdout, failing on nonzero exit.
    async fn exec(&self, script: &str) -> Result<String> {
        Ok(self.run(&RemoteCommand::new(script)).await?.stdout)
    }

    async fn sudo_exec(&self, script: &str) -> Result<String> {
        Ok(self.run(&RemoteCommand::new(script).elevated()).await?.stdout)
    }

    /// Ok(true) if the script exits 0, Ok(false) otherwise.
    async fn exec_ok(&self, script: &str) -> Result<bool> {
        Ok(self
            .run(&RemoteCommand::new(script).best_effort())
            .await?
            .success())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        self.exec_ok(&format!("test -e {}", shell_quote(path))).await
    }

    /// Write `content` to `path` verbatim and set its mode.
    async fn write_file(&self, path: &str, content: &str, mode: u32, elevate: bool) -> Result<()> {
        debug!("[{}] write {} ({} bytes, mode {:o})", self.host(), path, content.len(), mode);
        let path = shell_quote(path);
        let mut cmd = RemoteCommand::new(format!(
            "umask 077 && printf '%s' {} > {} && chmod {:o} {}",
            shell_quote(content),
            path,
            mode,
            path
        ));
        if elevate {
            cmd = cmd.elevated();
        }
        self.run(&cmd).await?;
        Ok(())
    }

    /// Read a file, or None if it does not exist.
    async fn read_file(&self, path: &str, elevate: bool) -> Result<Option<String>> {
        let quoted = shell_quote(path);
        let mut cmd = RemoteCommand::new(format!("[ -e {} ] || exit 3; cat {}", quoted, quoted))
            .best_effort();
        if elevate {
            cmd = cmd.elevated();
        }
        let output = self.run(&cmd).await?;
        match output.exit_code {
            0 => Ok(Some(output.stdout)),
            3 => Ok(None),
            code => Err(RiggerError::Command {
                host: self.host().to_string(),
                command: cmd.script,
                exit_code: code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Rename within one filesystem, replacing `to`.
    async fn rename(&self, from: &str, to: &str, elevate: bool) -> Result<()> {
        let mut cmd = RemoteCommand::new(format!("mv -f {} {}", shell_quote(from), shell_quote(to)));
        if elevate {
            cmd = cmd.elevated();
        }
        self.run(&cmd).await?;
        Ok(())
    }

    /// Copy preserving mode and ownership.
    async fn copy_file(&self, from: &str, to: &str, elevate: bool) -> Result<()> {
        let mut cmd = RemoteCommand::new(format!("cp -p {} {}", shell_quote(from), shell_quote(to)));
        if elevate {
            cmd = cmd.elevated();
        }
        self.run(&cmd).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str, elevate: bool) -> Result<()> {
        let mut cmd = RemoteCommand::new(format!("rm -f {}", shell_quote(path)));
        if elevate {
            cmd = cmd.elevated();
        }
        self.run(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevated_commands_are_wrapped_in_sudo() {
        let cmd = RemoteCommand::new("echo 'hi'").elevated();
        assert_eq!(cmd.shell_line(), "sudo bash -c 'echo '\\''hi'\\'''");

        let plain = RemoteCommand::new("echo hi");
        assert_eq!(plain.shell_line(), "echo hi");
        assert!(!plain.needs_sudo());
    }

    #[test]
    fn commands_for_another_account_go_through_sudo_u() {
        let cmd = RemoteCommand::new("git pull").as_user("app");
        assert_eq!(cmd.shell_line(), "sudo -u 'app' -H bash -c 'git pull'");
        assert!(cmd.needs_sudo());

        // elevation wins over run_as
        let both = RemoteCommand::new("id").as_user("app").elevated();
        assert_eq!(both.shell_line(), "sudo bash -c 'id'");
    }

    #[test]
    fn nonzero_exit_is_an_error_unless_best_effort() {
        let output = CommandOutput {
            exit_code: 2,
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };

        let err = check("web1", &RemoteCommand::new("false"), output.clone()).unwrap_err();
        match err {
            RiggerError::Command { exit_code, stderr, host, .. } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
                assert_eq!(host, "web1");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let ok = check("web1", &RemoteCommand::new("false").best_effort(), output).unwrap();
        assert_eq!(ok.exit_code, 2);
    }
}
