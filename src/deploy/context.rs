use std::time::Duration;

use crate::config::RiggerConfig;
use crate::exec::{shell_quote, Executor, RemoteCommand};
use crate::os::Platform;
use crate::proxy::{ProxyLayout, ProxyRoute, ReverseProxyConfigurator};
use crate::registry::ApplicationDescriptor;
use crate::secrets::SecretSource;
use crate::service::ServiceUnitManager;

use super::probe::HealthProbe;

/// Per-host knobs for a deployment, resolved once before any step runs.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub platform: Platform,
    pub proxy_layout: ProxyLayout,
    pub webroot: String,
    pub contact: Option<String>,
    /// Issue from the ACME staging CA; issuance failures do not halt the run
    pub staging: bool,
    pub renew_before_days: u64,
    pub health_retries: u32,
    pub health_interval: Duration,
    pub command_timeout: Duration,
    /// Print step progress to the terminal
    pub progress: bool,
}

impl DeploySettings {
    pub fn from_config(config: &RiggerConfig, platform: Platform, proxy_layout: ProxyLayout) -> Self {
        Self {
            platform,
            proxy_layout,
            webroot: config.certificates.webroot.clone(),
            contact: config.certificates.contact.clone(),
            staging: config.certificates.staging,
            renew_before_days: config.certificates.renew_before_days,
            health_retries: config.health_check.retries.max(1),
            health_interval: Duration::from_secs(config.health_check.interval),
            command_timeout: Duration::from_secs(config.deploy.command_timeout),
            progress: true,
        }
    }
}

/// Everything a step may read. Borrowed for the length of one run.
pub struct DeployContext<'a> {
    pub app: &'a ApplicationDescriptor,
    pub branch: String,
    pub setup: bool,
    pub exec: &'a dyn Executor,
    pub secrets: &'a dyn SecretSource,
    pub probe: &'a dyn HealthProbe,
    pub settings: &'a DeploySettings,
}

impl<'a> DeployContext<'a> {
    pub fn units(&self) -> ServiceUnitManager<'a> {
        ServiceUnitManager::new(self.exec, self.settings.platform)
    }

    pub fn proxy(&self) -> ReverseProxyConfigurator<'a> {
        ReverseProxyConfigurator::new(
            self.exec,
            self.settings.proxy_layout.clone(),
            self.settings.webroot.clone(),
        )
    }

    /// Run `command` as the application's account.
    pub fn as_app(&self, command: RemoteCommand) -> RemoteCommand {
        match self.app.run_as() {
            Some(user) => command.as_user(user),
            None => command,
        }
    }

    /// A command run in the source tree, before the environment file exists.
    pub fn source_command(&self, command: &str) -> RemoteCommand {
        self.as_app(
            RemoteCommand::new(format!(
                "cd {} && {}",
                shell_quote(&self.app.source_path()),
                command
            ))
            .timeout(self.settings.command_timeout),
        )
    }

    /// An application command, run in the source tree with the
    /// application's environment loaded.
    pub fn app_command(&self, command: &str) -> RemoteCommand {
        self.as_app(
            RemoteCommand::new(format!(
                "cd {} && set -a && . {} && set +a && {}",
                shell_quote(&self.app.source_path()),
                shell_quote(&self.app.env_file()),
                command
            ))
            .timeout(self.settings.command_timeout),
        )
    }
}

/// Facts produced by earlier steps and consumed by later ones.
#[derive(Debug, Default)]
pub struct DeployState {
    pub git_sha: Option<String>,
    pub unit_digest: Option<String>,
    pub route: Option<ProxyRoute>,
}
