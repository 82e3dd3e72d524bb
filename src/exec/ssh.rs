use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder};
use tracing::debug;

use super::{check, CommandOutput, Executor, RemoteCommand};
use crate::config::HostConfig;
use crate::error::{Result, RiggerError};

pub struct SshExecutor {
    session: Session,
    host: String,
}

impl SshExecutor {
    pub async fn connect(host: &HostConfig, connect_timeout: Duration) -> Result<Self> {
        let user = host.user();

        if which::which("ssh").is_err() {
            return Err(RiggerError::Connection {
                host: host.address.clone(),
                message: "ssh client not found in PATH".to_string(),
            });
        }

        if let Some(jump) = host.proxy.as_deref() {
            debug!("Connecting to {}@{} via proxy {}", user, host.address, jump);
        } else {
            debug!("Connecting to {}@{}", user, host.address);
        }

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.user(user.to_string());
        builder.connect_timeout(connect_timeout);

        if let Some(port) = host.port {
            builder.port(port);
        }

        if let Some(jump) = host.proxy.as_deref() {
            builder.jump_hosts([jump]);
        }

        let session = builder
            .connect(&host.address)
            .await
            .map_err(|e| RiggerError::Connection {
                host: host.address.clone(),
                message: format!("{}@{}: {}", user, host.address, e),
            })?;

        Ok(Self {
            session,
            host: host.address.clone(),
        })
    }
}

#[async_trait]
impl Executor for SshExecutor {
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

        let line = cmd.shell_line();
        let mut command = self.session.command("bash");
        command.arg("-c").arg(&line);

        let output = tokio::time::timeout(cmd.timeout, command.output())
            .await
            .map_err(|_| RiggerError::Timeout {
                host: self.host.clone(),
                command: cmd.script.clone(),
                timeout: cmd.timeout,
            })?
            .map_err(|e| RiggerError::Connection {
                host: self.host.clone(),
                message: e.to_string(),
            })?;

        let output = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        check(&self.host, cmd, output)
    }
}
