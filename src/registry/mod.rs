//! Static catalog of deployable applications, built once from `rigger.toml`.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::config::{CommandsConfig, RiggerConfig};
use crate::error::{Result, RiggerError};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub name: String,
    pub owner: String,
    pub password_secret: String,
}

/// One deployable application. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationDescriptor {
    pub key: String,
    pub name: String,
    pub domain: String,
    pub repository: String,
    pub branch: String,
    /// Remote install root; source lives in `app/`, shared state in `shared/`
    pub path: String,
    pub port: u16,
    pub host: String,
    pub required_secrets: Vec<String>,
    pub setup: bool,
    /// Identity the application process runs as
    pub user: String,
    /// Account rigger connects as
    pub deploy_user: String,
    /// Serves real traffic; staging certificates are refused
    pub live: bool,
    pub health_path: String,
    pub env: BTreeMap<String, String>,
    pub commands: CommandsConfig,
    pub database: Option<DatabaseSpec>,
}

impl ApplicationDescriptor {
    pub fn source_path(&self) -> String {
        format!("{}/app", self.path)
    }

    pub fn shared_path(&self) -> String {
        format!("{}/shared", self.path)
    }

    /// Environment file referenced by the unit definition.
    pub fn env_file(&self) -> String {
        format!("{}/.env", self.shared_path())
    }

    pub fn ledger_path(&self) -> String {
        format!("{}/rigger.lock", self.shared_path())
    }

    /// The account application commands must switch to, if it is not the
    /// one rigger connects as.
    pub fn run_as(&self) -> Option<&str> {
        (self.user != self.deploy_user).then_some(self.user.as_str())
    }
}

#[derive(Debug)]
pub struct ApplicationRegistry {
    apps: Vec<ApplicationDescriptor>,
}

impl ApplicationRegistry {
    pub fn from_config(config: &RiggerConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut apps = Vec::with_capacity(config.apps.len());

        for app in &config.apps {
            if !seen.insert(app.key.clone()) {
                return Err(RiggerError::Config(format!(
                    "App key '{}' is defined more than once",
                    app.key
                )));
            }

            let host = config
                .hosts
                .get(&app.host)
                .ok_or_else(|| RiggerError::Config(format!("Unknown host '{}'", app.host)))?;

            apps.push(ApplicationDescriptor {
                key: app.key.clone(),
                name: app.name.clone().unwrap_or_else(|| app.key.clone()),
                domain: app.domain.clone(),
                repository: app.repository.clone(),
                branch: app.branch.clone(),
                path: app
                    .path
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}", config.deploy.deploy_to, app.key)),
                port: app.port,
                host: app.host.clone(),
                required_secrets: app.secrets.clone(),
                setup: app.setup,
                user: app
                    .user
                    .clone()
                    .unwrap_or_else(|| host.user().to_string()),
                deploy_user: host.user().to_string(),
                live: app.live,
                health_path: app
                    .health_path
                    .clone()
                    .unwrap_or_else(|| config.health_check.path.clone()),
                env: app.env.clone(),
                commands: app.commands.clone(),
                database: app.database.as_ref().map(|db| DatabaseSpec {
                    name: db.name.clone(),
                    owner: db.owner.clone(),
                    password_secret: db.password_secret.clone(),
                }),
            });
        }

        Ok(Self { apps })
    }

    pub fn resolve(&self, key: &str) -> Result<&ApplicationDescriptor> {
        self.apps
            .iter()
            .find(|a| a.key == key)
            .ok_or_else(|| RiggerError::UnknownApplication(key.to_string()))
    }

    /// All applications in declaration order.
    pub fn all(&self) -> &[ApplicationDescriptor] {
        &self.apps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE_CONFIG;

    fn registry() -> ApplicationRegistry {
        let config = RiggerConfig::parse(SAMPLE_CONFIG).unwrap();
        ApplicationRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn resolves_descriptors_with_derived_paths() {
        let registry = registry();
        let sample = registry.resolve("sample").unwrap();

        assert_eq!(sample.path, "/var/www/sample");
        assert_eq!(sample.source_path(), "/var/www/sample/app");
        assert_eq!(sample.env_file(), "/var/www/sample/shared/.env");
        assert_eq!(sample.user, "deploy");
        assert_eq!(sample.run_as(), None);
        assert_eq!(sample.health_path, "/up");
        assert_eq!(sample.required_secrets, vec!["DB_PASS", "API_TOKEN"]);
        assert_eq!(sample.database.as_ref().unwrap().owner, "sample");
    }

    #[test]
    fn distinct_app_user_is_switched_to() {
        let mut config = RiggerConfig::parse(SAMPLE_CONFIG).unwrap();
        config.apps[0].user = Some("app".to_string());
        let registry = ApplicationRegistry::from_config(&config).unwrap();
        let sample = registry.resolve("sample").unwrap();

        assert_eq!(sample.deploy_user, "deploy");
        assert_eq!(sample.run_as(), Some("app"));
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = registry().resolve("humidor").unwrap_err();
        assert!(matches!(err, RiggerError::UnknownApplication(k) if k == "humidor"));
    }

    #[test]
    fn all_keeps_declaration_order() {
        let keys: Vec<_> = registry().all().iter().map(|a| a.key.clone()).collect();
        assert_eq!(keys, vec!["sample", "cigar"]);
    }
}
