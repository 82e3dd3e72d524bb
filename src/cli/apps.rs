use anyhow::Result;
use console::style;

use crate::config::RiggerConfig;
use crate::registry::ApplicationRegistry;

pub fn run(config: RiggerConfig, json: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(registry.all())?);
        return Ok(());
    }

    for app in registry.all() {
        let secrets = if app.required_secrets.is_empty() {
            String::new()
        } else {
            style(format!("[{}]", app.required_secrets.join(", ")))
                .dim()
                .to_string()
        };
        println!(
            "{:<16} {:<32} {:<6} {:<10} {}",
            style(&app.key).bold(),
            app.domain,
            app.port,
            app.host,
            secrets
        );
    }
    Ok(())
}
