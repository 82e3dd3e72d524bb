use anyhow::{Context, Result};
use console::style;

use crate::config::RiggerConfig;
use crate::deploy::ledger::DeployLedger;
use crate::os::ServiceAction;
use crate::output;
use crate::registry::ApplicationRegistry;
use crate::service::ServiceUnitManager;

use super::target::Target;

pub async fn status(config: RiggerConfig, key: &str, local: bool, json: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;
    let app = registry.resolve(key)?;
    let target = Target::open(&config, &app.host, local).await?;
    let units = ServiceUnitManager::new(target.exec.as_ref(), target.platform);

    let status = units.status(app).await?;
    let ledger = DeployLedger::read(target.exec.as_ref(), app)
        .await
        .unwrap_or(None);

    if json {
        let document = serde_json::json!({
            "app": app.key,
            "unit": target.platform.unit_name(&app.key),
            "status": status,
            "ledger": ledger,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    output::header(&format!("{} ({})", app.name, target.platform.unit_name(&app.key)));
    if status.running {
        let pid = status.pid.map(|p| format!(" (pid {})", p)).unwrap_or_default();
        output::success(&format!("running{}", pid));
    } else {
        output::warning("not running");
    }

    match ledger {
        Some(l) => output::info(&format!(
            "Last deploy: {} @ {} at {}",
            l.branch,
            l.git_sha.get(..7).unwrap_or(&l.git_sha),
            l.deployed_at
        )),
        None => output::info("No successful deploy recorded"),
    }

    if !status.recent_log_tail.is_empty() {
        println!();
        for line in &status.recent_log_tail {
            println!("  {}", style(line).dim());
        }
    }
    Ok(())
}

pub async fn control(config: RiggerConfig, key: &str, action: ServiceAction, local: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;
    let app = registry.resolve(key)?;
    let target = Target::open(&config, &app.host, local).await?;
    let units = ServiceUnitManager::new(target.exec.as_ref(), target.platform);

    match action {
        ServiceAction::Start => units.start(app).await?,
        ServiceAction::Stop => units.stop(app).await?,
        ServiceAction::Restart => units.restart(app).await?,
    }

    output::success(&format!("{} {}", action.as_str(), app.key));
    Ok(())
}

pub async fn logs(config: RiggerConfig, key: &str, lines: usize, local: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;
    let app = registry.resolve(key)?;
    let target = Target::open(&config, &app.host, local).await?;
    let units = ServiceUnitManager::new(target.exec.as_ref(), target.platform);

    let lines = units
        .logs(app, lines)
        .await
        .with_context(|| format!("Failed to read logs of {}", app.key))?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
