use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::exec::Executor;
use crate::registry::ApplicationDescriptor;

/// Last successful deployment of an application, kept on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployLedger {
    pub app: String,
    pub branch: String,
    pub git_sha: String,
    #[serde(default)]
    pub previous_git_sha: Option<String>,
    pub deployed_at: String,
    pub unit_digest: String,
    #[serde(default)]
    pub setup: bool,
}

impl DeployLedger {
    pub fn new(
        app: &ApplicationDescriptor,
        branch: &str,
        git_sha: String,
        previous: Option<&DeployLedger>,
        unit_digest: String,
        setup: bool,
    ) -> Self {
        Self {
            app: app.key.clone(),
            branch: branch.to_string(),
            git_sha,
            previous_git_sha: previous.map(|p| p.git_sha.clone()),
            deployed_at: chrono::Utc::now().to_rfc3339(),
            unit_digest,
            setup,
        }
    }

    pub async fn read(exec: &dyn Executor, app: &ApplicationDescriptor) -> Result<Option<Self>> {
        let Some(content) = exec.read_file(&app.ledger_path(), false).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(content.trim())?))
    }

    pub async fn write(&self, exec: &dyn Executor, app: &ApplicationDescriptor) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        // shared/ belongs to the application account, not the connecting one
        exec.write_file(&app.ledger_path(), &content, 0o644, true)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiggerConfig, SAMPLE_CONFIG};
    use crate::exec::mock::MockExecutor;
    use crate::registry::ApplicationRegistry;

    #[tokio::test]
    async fn write_then_read_keeps_previous_sha() {
        let config = RiggerConfig::parse(SAMPLE_CONFIG).unwrap();
        let registry = ApplicationRegistry::from_config(&config).unwrap();
        let app = registry.resolve("sample").unwrap();
        let exec = MockExecutor::new();

        assert!(DeployLedger::read(&exec, app).await.unwrap().is_none());

        let first = DeployLedger::new(app, "main", "aaa".into(), None, "d1".into(), true);
        first.write(&exec, app).await.unwrap();

        let stored = DeployLedger::read(&exec, app).await.unwrap().unwrap();
        let second = DeployLedger::new(app, "main", "bbb".into(), Some(&stored), "d2".into(), false);
        assert_eq!(second.previous_git_sha.as_deref(), Some("aaa"));
        assert!(exec.file("/var/www/sample/shared/rigger.lock").unwrap().contains("\"git_sha\": \"aaa\""));
    }
}
