use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod validate;

pub use validate::require_contact;

#[derive(Debug, Deserialize, Serialize)]
pub struct RiggerConfig {
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub certificates: CertificatesConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_to")]
    pub deploy_to: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deploy_to: default_deploy_to(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_deploy_to() -> String {
    "/var/www".to_string()
}

fn default_command_timeout() -> u64 {
    900
}

fn default_connect_timeout() -> u64 {
    15
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// JSON secret document, or an age-encrypted one when it ends in `.age`
    #[serde(default = "default_secrets_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            path: default_secrets_path(),
            recipients: Vec::new(),
        }
    }
}

fn default_secrets_path() -> PathBuf {
    PathBuf::from(".secrets.json")
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CertificatesConfig {
    pub contact: Option<String>,
    #[serde(default)]
    pub staging: bool,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
    #[serde(default = "default_acme_webroot")]
    pub webroot: String,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            contact: None,
            staging: false,
            renew_before_days: default_renew_before_days(),
            webroot: default_acme_webroot(),
        }
    }
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_acme_webroot() -> String {
    "/var/www/rigger-acme".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            timeout: default_health_timeout(),
            interval: default_health_interval(),
            retries: default_health_retries(),
        }
    }
}

fn default_health_path() -> String {
    "/up".to_string()
}
fn default_health_timeout() -> u64 {
    10
}
fn default_health_interval() -> u64 {
    2
}
fn default_health_retries() -> u32 {
    15
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    /// systemd, launchd or supervisor; detected over the connection when unset
    pub platform: Option<String>,
    /// Root of the nginx configuration tree when it is not the platform default
    pub nginx_dir: Option<String>,
}

impl HostConfig {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("deploy")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub key: String,
    pub name: Option<String>,
    pub domain: String,
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub path: Option<String>,
    pub port: u16,
    pub host: String,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub setup: bool,
    pub user: Option<String>,
    #[serde(default = "default_live")]
    pub live: bool,
    pub health_path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub commands: CommandsConfig,
    pub database: Option<DatabaseConfig>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_live() -> bool {
    true
}

/// Lifecycle commands run inside the checked-out source tree. An empty
/// string disables the command.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandsConfig {
    #[serde(default = "default_install_cmd")]
    pub install: String,
    #[serde(default = "default_db_create_cmd")]
    pub db_create: String,
    #[serde(default = "default_migrate_cmd")]
    pub migrate: String,
    #[serde(default = "default_assets_cmd")]
    pub assets: String,
    #[serde(default = "default_start_cmd")]
    pub start: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            install: default_install_cmd(),
            db_create: default_db_create_cmd(),
            migrate: default_migrate_cmd(),
            assets: default_assets_cmd(),
            start: default_start_cmd(),
        }
    }
}

fn default_install_cmd() -> String {
    "bundle config set --local deployment true && bundle config set --local without 'development test' && bundle install".to_string()
}
fn default_db_create_cmd() -> String {
    "bin/rails db:create".to_string()
}
fn default_migrate_cmd() -> String {
    "bin/rails db:migrate".to_string()
}
fn default_assets_cmd() -> String {
    "bin/rails assets:precompile".to_string()
}
fn default_start_cmd() -> String {
    "bin/rails server -b 127.0.0.1".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub owner: String,
    /// Secret variable holding the owner's password
    pub password_secret: String,
}

impl RiggerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        validate::validate(&config)?;
        Ok(config)
    }

    pub fn host(&self, name: &str) -> Result<&HostConfig> {
        self.hosts
            .get(name)
            .with_context(|| format!("Host '{}' not found in config", name))
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[certificates]
contact = "ops@example.test"

[hosts.prod]
address = "203.0.113.10"
platform = "systemd"

[[apps]]
key = "sample"
name = "Sample"
domain = "sample.example.test"
repository = "git@example.test:org/sample.git"
port = 4000
host = "prod"
secrets = ["DB_PASS", "API_TOKEN"]

[apps.database]
name = "sample_production"
owner = "sample"
password_secret = "DB_PASS"

[[apps]]
key = "cigar"
domain = "cigar.example.test"
repository = "git@example.test:org/cigar.git"
port = 3001
host = "prod"
"#;
