use anyhow::{bail, Context, Result};
use dialoguer::{Input, Select};
use minijinja::Environment;
use std::path::Path;

use crate::config::RiggerConfig;

const TEMPLATE: &str = include_str!("../../templates/rigger.toml.j2");

pub fn run(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    // Detect defaults from git
    let default_key = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .unwrap_or_else(|| "myapp".to_string());

    let default_repo = detect_git_remote().unwrap_or_default();

    let key: String = Input::new()
        .with_prompt("Application key")
        .default(default_key)
        .interact_text()?;

    let domain: String = Input::new()
        .with_prompt("Domain")
        .default(format!("{}.example.com", key))
        .interact_text()?;

    let repository: String = Input::new()
        .with_prompt("Git repository URL")
        .default(default_repo)
        .interact_text()?;

    let branches = ["main", "master"];
    let branch_idx = Select::new()
        .with_prompt("Default branch")
        .items(&branches)
        .default(0)
        .interact()?;

    let port: u16 = Input::new()
        .with_prompt("Application port")
        .default(3000)
        .interact_text()?;

    let address: String = Input::new()
        .with_prompt("Host address")
        .interact_text()?;

    let platforms = ["detect", "systemd", "launchd", "supervisor"];
    let platform_idx = Select::new()
        .with_prompt("Process supervisor")
        .items(&platforms)
        .default(0)
        .interact()?;

    let contact: String = Input::new()
        .with_prompt("ACME contact email")
        .interact_text()?;

    let mut env = Environment::new();
    env.add_template("rigger.toml", TEMPLATE)?;
    let tmpl = env.get_template("rigger.toml")?;
    let content = tmpl.render(minijinja::context! {
        key => key,
        domain => domain,
        repository => repository,
        branch => branches[branch_idx],
        port => port,
        host_name => "production",
        address => address,
        platform => (platform_idx > 0).then(|| platforms[platform_idx]),
        contact => contact,
    })?;

    // Never write something `load` would reject.
    RiggerConfig::parse(&content).context("Generated configuration is invalid")?;

    std::fs::write(config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    crate::output::success(&format!("Created {}", config_path.display()));
    crate::output::info("List required secret names under each app, then run `rigger secrets check`.");

    Ok(())
}

fn detect_git_remote() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["remote", "get-url", "origin"])
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
