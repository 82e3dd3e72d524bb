//! Process-supervision unit definitions: render, install, control.
//!
//! The unit definition never carries secret values. Secrets go into the
//! application's environment file (mode 600), which systemd references via
//! `EnvironmentFile=` and the other platforms source before `exec`.

use std::collections::BTreeMap;
use std::fmt;

use minijinja::Environment;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Result, RiggerError};
use crate::exec::{shell_quote, Executor, RemoteCommand};
use crate::os::{Platform, ServiceAction};
use crate::registry::ApplicationDescriptor;
use crate::secrets::SecretBundle;

const SYSTEMD_TEMPLATE: &str = include_str!("../../templates/systemd.service.j2");
const LAUNCHD_TEMPLATE: &str = include_str!("../../templates/launchd.plist.j2");
const SUPERVISOR_TEMPLATE: &str = include_str!("../../templates/supervisor.conf.j2");

/// Suffix for files written before being renamed into place.
pub const STAGING_SUFFIX: &str = ".rigger-new";

const RESTART_BACKOFF_SECS: u64 = 5;
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartPolicy {
    Always { backoff_secs: u64 },
}

#[derive(Clone, PartialEq, Eq)]
pub struct ServiceUnitSpec {
    pub app: String,
    pub name: String,
    pub unit_name: String,
    pub unit_path: String,
    pub command: String,
    pub working_dir: String,
    pub port: u16,
    pub environment: BTreeMap<String, String>,
    pub env_file: String,
    pub restart: RestartPolicy,
    pub user: String,
}

impl fmt::Debug for ServiceUnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceUnitSpec")
            .field("app", &self.app)
            .field("unit_name", &self.unit_name)
            .field("command", &self.command)
            .field("working_dir", &self.working_dir)
            .field("port", &self.port)
            .field("environment", &self.environment.keys().collect::<Vec<_>>())
            .field("restart", &self.restart)
            .field("user", &self.user)
            .finish()
    }
}

/// The two files that make up an installed service.
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedUnit {
    pub unit: String,
    pub env_file: String,
}

impl RenderedUnit {
    /// SHA-256 over both files; equal digests mean byte-identical installs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.unit.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.env_file.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// What was installed. Carries no secret values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledUnit {
    pub unit_name: String,
    pub unit_path: String,
    pub env_file: String,
    pub environment_keys: Vec<String>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub recent_log_tail: Vec<String>,
}

pub struct ServiceUnitManager<'a> {
    exec: &'a dyn Executor,
    platform: Platform,
}

impl<'a> ServiceUnitManager<'a> {
    pub fn new(exec: &'a dyn Executor, platform: Platform) -> Self {
        Self { exec, platform }
    }

    /// Build the spec. Static descriptor fields first, then descriptor
    /// `env`, then secrets, each layer overriding the previous.
    pub fn spec_for(
        &self,
        app: &ApplicationDescriptor,
        bundle: Option<&SecretBundle>,
    ) -> ServiceUnitSpec {
        let mut environment = BTreeMap::new();
        environment.insert("PORT".to_string(), app.port.to_string());
        environment.insert("RAILS_ENV".to_string(), "production".to_string());
        environment.insert("APP_DOMAIN".to_string(), app.domain.clone());
        environment.insert("RAILS_LOG_TO_STDOUT".to_string(), "1".to_string());

        for (k, v) in &app.env {
            environment.insert(k.clone(), v.clone());
        }

        if let Some(bundle) = bundle {
            for (k, v) in bundle.iter() {
                environment.insert(k.to_string(), v.expose().to_string());
            }
        }

        ServiceUnitSpec {
            app: app.key.clone(),
            name: app.name.clone(),
            unit_name: self.platform.unit_name(&app.key),
            unit_path: self.platform.unit_path(&app.key),
            command: app.commands.start.clone(),
            working_dir: app.source_path(),
            port: app.port,
            environment,
            env_file: app.env_file(),
            restart: RestartPolicy::Always {
                backoff_secs: RESTART_BACKOFF_SECS,
            },
            user: app.user.clone(),
        }
    }

    pub fn render(&self, spec: &ServiceUnitSpec) -> Result<RenderedUnit> {
        let (name, template) = match self.platform {
            Platform::Systemd => ("unit.service", SYSTEMD_TEMPLATE),
            // .xml turns on minijinja's auto-escaping
            Platform::Launchd => ("unit.plist.xml", LAUNCHD_TEMPLATE),
            Platform::Supervisor => ("unit.conf", SUPERVISOR_TEMPLATE),
        };

        let mut env = Environment::new();
        env.add_template(name, template)?;
        let tmpl = env.get_template(name)?;

        let RestartPolicy::Always { backoff_secs } = spec.restart;
        let unit = tmpl.render(minijinja::context! {
            key => &spec.app,
            name => &spec.name,
            unit_name => &spec.unit_name,
            user => &spec.user,
            working_dir => &spec.working_dir,
            env_file => &spec.env_file,
            exec_line => exec_line(self.platform, spec),
            backoff_secs => backoff_secs,
        })?;

        Ok(RenderedUnit {
            unit,
            env_file: render_env_file(&spec.environment),
        })
    }

    /// Make sure the directories the unit lives in exist and return the
    /// static part of the spec. The installed unit is left alone.
    pub async fn prepare(&self, app: &ApplicationDescriptor) -> Result<ServiceUnitSpec> {
        let spec = self.spec_for(app, None);
        let unit_dir = parent_dir(&spec.unit_path);
        let shared = shell_quote(&app.shared_path());
        self.exec
            .sudo_exec(&format!(
                "mkdir -p {} {} && chown {}: {}",
                shell_quote(unit_dir),
                shared,
                shell_quote(&app.user),
                shared
            ))
            .await?;
        // Render once so template problems surface here rather than mid-install.
        self.render(&spec)?;
        Ok(spec)
    }

    /// Write the environment file and unit definition under staging names,
    /// rename both into place, then reload the supervisor.
    pub async fn render_and_install(
        &self,
        app: &ApplicationDescriptor,
        bundle: &SecretBundle,
    ) -> Result<InstalledUnit> {
        self.install(app, bundle)
            .await
            .map_err(|e| RiggerError::UnitInstall {
                app: app.key.clone(),
                source: Box::new(e),
            })
    }

    async fn install(&self, app: &ApplicationDescriptor, bundle: &SecretBundle) -> Result<InstalledUnit> {
        let spec = self.spec_for(app, Some(bundle));
        let rendered = self.render(&spec)?;
        let digest = rendered.digest();

        let staged_env = format!("{}{}", spec.env_file, STAGING_SUFFIX);
        let staged_unit = format!("{}{}", spec.unit_path, STAGING_SUFFIX);

        if let Err(e) = self
            .swap_in(&spec, &rendered, &staged_env, &staged_unit)
            .await
        {
            for staged in [&staged_env, &staged_unit] {
                if let Err(cleanup) = self.exec.remove_file(staged, true).await {
                    debug!("Could not remove {}: {}", staged, cleanup);
                }
            }
            return Err(e);
        }

        self.exec
            .sudo_exec(&self.platform.reload_cmd(&app.key))
            .await?;

        info!(
            "Installed {} ({} environment variables, digest {})",
            spec.unit_name,
            spec.environment.len(),
            &digest[..12]
        );

        Ok(InstalledUnit {
            unit_name: spec.unit_name,
            unit_path: spec.unit_path,
            env_file: spec.env_file,
            environment_keys: spec.environment.into_keys().collect(),
            digest,
        })
    }

    /// Stage both files, then rename the unit before the environment file.
    /// The environment file is owned by the account the service runs as,
    /// which must be able to source it.
    async fn swap_in(
        &self,
        spec: &ServiceUnitSpec,
        rendered: &RenderedUnit,
        staged_env: &str,
        staged_unit: &str,
    ) -> Result<()> {
        self.exec
            .write_file(staged_env, &rendered.env_file, 0o600, true)
            .await?;
        self.exec
            .sudo_exec(&format!("chown {}: {}", shell_quote(&spec.user), shell_quote(staged_env)))
            .await?;
        self.exec
            .write_file(staged_unit, &rendered.unit, 0o644, true)
            .await?;

        self.exec.rename(staged_unit, &spec.unit_path, true).await?;
        self.exec.rename(staged_env, &spec.env_file, true).await?;
        Ok(())
    }

    pub async fn start(&self, app: &ApplicationDescriptor) -> Result<()> {
        self.control(app, ServiceAction::Start).await
    }

    pub async fn stop(&self, app: &ApplicationDescriptor) -> Result<()> {
        self.control(app, ServiceAction::Stop).await
    }

    pub async fn restart(&self, app: &ApplicationDescriptor) -> Result<()> {
        self.control(app, ServiceAction::Restart).await
    }

    async fn control(&self, app: &ApplicationDescriptor, action: ServiceAction) -> Result<()> {
        debug!("{} {}", action.as_str(), self.platform.unit_name(&app.key));
        self.exec
            .sudo_exec(&self.platform.control_cmd(action, &app.key))
            .await
            .map(|_| ())
            .map_err(|e| RiggerError::ServiceControl {
                app: app.key.clone(),
                action: action.as_str(),
                source: Box::new(e),
            })
    }

    /// A stopped or crashed service is a normal state here, not an error.
    pub async fn status(&self, app: &ApplicationDescriptor) -> Result<ServiceStatus> {
        let status = self
            .exec
            .run(&RemoteCommand::new(self.platform.status_cmd(&app.key)).elevated().best_effort())
            .await?;
        let (running, pid) = self.platform.parse_status(&status.stdout);

        let logs = self.logs(app, LOG_TAIL_LINES).await?;

        Ok(ServiceStatus {
            running,
            pid,
            recent_log_tail: logs,
        })
    }

    pub async fn logs(&self, app: &ApplicationDescriptor, lines: usize) -> Result<Vec<String>> {
        let output = self
            .exec
            .run(&RemoteCommand::new(self.platform.logs_cmd(&app.key, lines)).elevated().best_effort())
            .await?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".")
}

/// Command line as the platform's definition format expects it.
fn exec_line(platform: Platform, spec: &ServiceUnitSpec) -> String {
    match platform {
        Platform::Systemd => {
            // systemd expands $ and % inside ExecStart
            let inner = format!("exec {}", spec.command)
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "$$")
                .replace('%', "%%");
            format!("/bin/bash -lc \"{}\"", inner)
        }
        Platform::Launchd => sourced_command(spec),
        Platform::Supervisor => {
            let inner = sourced_command(spec).replace('"', "\\\"").replace('%', "%%");
            format!("/bin/bash -c \"{}\"", inner)
        }
    }
}

fn sourced_command(spec: &ServiceUnitSpec) -> String {
    format!(
        "set -a; . {}; set +a; exec {}",
        shell_quote(&spec.env_file),
        spec.command
    )
}

/// KEY='value' lines, readable by both systemd and `bash`'s `.`.
pub fn render_env_file(environment: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# Managed by rigger\n");
    for (key, value) in environment {
        if value.contains('\'') {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$")
                .replace('`', "\\`");
            out.push_str(&format!("{}=\"{}\"\n", key, escaped));
        } else {
            out.push_str(&format!("{}='{}'\n", key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiggerConfig, SAMPLE_CONFIG};
    use crate::exec::mock::MockExecutor;
    use crate::registry::ApplicationRegistry;
    use crate::secrets::{MemorySecretSource, SecretSource};

    fn sample() -> ApplicationDescriptor {
        let config = RiggerConfig::parse(SAMPLE_CONFIG).unwrap();
        ApplicationRegistry::from_config(&config)
            .unwrap()
            .resolve("sample")
            .unwrap()
            .clone()
    }

    fn bundle() -> SecretBundle {
        MemorySecretSource::new()
            .with("sample", "DB_PASS", "hunter2")
            .with("sample", "API_TOKEN", "tok$en")
            .get_all("sample", &["DB_PASS".to_string(), "API_TOKEN".to_string()])
            .unwrap()
    }

    #[test]
    fn systemd_unit_references_env_file_and_never_secrets() {
        let exec = MockExecutor::new();
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);
        let spec = manager.spec_for(&sample(), Some(&bundle()));
        let rendered = manager.render(&spec).unwrap();

        assert!(rendered.unit.contains("EnvironmentFile=/var/www/sample/shared/.env"));
        assert!(rendered.unit.contains("WorkingDirectory=/var/www/sample/app"));
        assert!(rendered.unit.contains("Restart=always"));
        assert!(rendered.unit.contains("User=deploy"));
        assert!(!rendered.unit.contains("hunter2"));

        assert!(rendered.env_file.contains("DB_PASS='hunter2'"));
        assert!(rendered.env_file.contains("API_TOKEN='tok$en'"));
        assert!(rendered.env_file.contains("PORT='4000'"));
    }

    #[test]
    fn launchd_plist_is_xml_escaped() {
        let exec = MockExecutor::new();
        let manager = ServiceUnitManager::new(&exec, Platform::Launchd);
        let mut app = sample();
        app.commands.start = "bin/server && echo <ok>".to_string();

        let rendered = manager.render(&manager.spec_for(&app, None)).unwrap();
        assert!(rendered.unit.contains("<string>com.rigger.sample</string>"));
        assert!(rendered.unit.contains("&amp;&amp; echo &lt;ok&gt;"));
    }

    #[test]
    fn systemd_exec_line_escapes_dollar_and_percent() {
        let exec = MockExecutor::new();
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);
        let mut app = sample();
        app.commands.start = "run --rate 50% --home $HOME".to_string();

        let spec = manager.spec_for(&app, None);
        assert_eq!(
            exec_line(Platform::Systemd, &spec),
            "/bin/bash -lc \"exec run --rate 50%% --home $$HOME\""
        );
    }

    #[test]
    fn env_file_quotes_values_with_single_quotes() {
        let mut env = BTreeMap::new();
        env.insert("A".to_string(), "it's $x".to_string());
        env.insert("B".to_string(), "plain".to_string());
        let out = render_env_file(&env);
        assert!(out.contains("A=\"it's \\$x\"\n"));
        assert!(out.contains("B='plain'\n"));
    }

    #[tokio::test]
    async fn install_stages_then_renames_then_reloads() {
        let exec = MockExecutor::new();
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);
        let app = sample();

        let installed = manager.render_and_install(&app, &bundle()).await.unwrap();

        let unit_path = "/etc/systemd/system/rigger-sample.service";
        assert_eq!(installed.unit_path, unit_path);
        assert!(exec.file(unit_path).is_some());
        assert_eq!(exec.mode(&app.env_file()), Some(0o600));
        assert!(exec.file(&format!("{}{}", unit_path, STAGING_SUFFIX)).is_none());

        let write = exec.position(&format!("write {}{}", unit_path, STAGING_SUFFIX)).unwrap();
        let rename = exec.position(&format!("mv {}{}", unit_path, STAGING_SUFFIX)).unwrap();
        let rename_env = exec.position(&format!("mv {}{}", app.env_file(), STAGING_SUFFIX)).unwrap();
        let reload = exec.position("systemctl daemon-reload").unwrap();
        assert!(write < rename && rename < rename_env && rename_env < reload);
        assert!(exec.ran("chown 'deploy': '/var/www/sample/shared/.env.rigger-new'"));

        assert!(installed.environment_keys.contains(&"API_TOKEN".to_string()));
    }

    #[tokio::test]
    async fn failed_unit_rename_keeps_previous_files_and_removes_staged_ones() {
        let exec = MockExecutor::new();
        let unit_path = "/etc/systemd/system/rigger-sample.service";
        exec.seed_file(unit_path, "previous unit");
        exec.seed_file("/var/www/sample/shared/.env", "previous env");
        exec.fail(
            &format!("mv -f {}{}", unit_path, STAGING_SUFFIX),
            "mv: cannot move: Read-only file system",
        );
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);

        let err = manager.render_and_install(&sample(), &bundle()).await.unwrap_err();

        assert!(matches!(err, RiggerError::UnitInstall { .. }));
        assert_eq!(exec.file(unit_path).unwrap(), "previous unit");
        assert_eq!(exec.file("/var/www/sample/shared/.env").unwrap(), "previous env");
        assert!(!exec.paths().iter().any(|p| p.ends_with(STAGING_SUFFIX)));
        assert!(!exec.ran("daemon-reload"));
    }

    #[tokio::test]
    async fn env_file_belongs_to_the_service_account() {
        let exec = MockExecutor::new();
        let manager = ServiceUnitManager::new(&exec, Platform::Supervisor);
        let mut app = sample();
        app.user = "app".to_string();

        manager.prepare(&app).await.unwrap();
        manager.render_and_install(&app, &bundle()).await.unwrap();

        assert!(exec.ran("chown 'app': '/var/www/sample/shared'"));
        assert!(exec.ran("chown 'app': '/var/www/sample/shared/.env.rigger-new'"));
        assert_eq!(exec.mode("/var/www/sample/shared/.env"), Some(0o600));
        let unit = exec.file("/etc/supervisor/conf.d/rigger-sample.conf").unwrap();
        assert!(unit.contains("user=app"));
    }

    #[tokio::test]
    async fn failed_reload_is_a_unit_install_error() {
        let exec = MockExecutor::new();
        exec.fail("daemon-reload", "Failed to reload daemon");
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);

        let err = manager.render_and_install(&sample(), &bundle()).await.unwrap_err();
        assert!(matches!(err, RiggerError::UnitInstall { ref app, .. } if app == "sample"));
        assert!(err.to_string().contains("Failed to reload daemon"));
    }

    #[tokio::test]
    async fn control_failures_carry_the_command_error() {
        let exec = MockExecutor::new();
        exec.fail("systemctl stop", "Unit not loaded");
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);

        let err = manager.stop(&sample()).await.unwrap_err();
        match err {
            RiggerError::ServiceControl { action, source, .. } => {
                assert_eq!(action, "stop");
                assert!(matches!(*source, RiggerError::Command { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_of_a_crashed_service_is_not_an_error() {
        let exec = MockExecutor::new();
        exec.on("systemctl show", 3, "MainPID=0\nActiveState=failed\n", "");
        exec.respond("journalctl", "boot\ncrash: missing DATABASE_URL\n");
        let manager = ServiceUnitManager::new(&exec, Platform::Systemd);

        let status = manager.status(&sample()).await.unwrap();
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert_eq!(status.recent_log_tail.last().unwrap(), "crash: missing DATABASE_URL");
    }
}
