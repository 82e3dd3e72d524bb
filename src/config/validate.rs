use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

use super::RiggerConfig;
use crate::os::Platform;

pub fn validate(config: &RiggerConfig) -> Result<()> {
    for (name, host) in &config.hosts {
        if host.address.is_empty() {
            bail!("Host '{}' has an empty address", name);
        }
        if let Some(platform) = &host.platform {
            Platform::from_id(platform)
                .map_err(|e| anyhow::anyhow!("Host '{}': {}", name, e))?;
        }
    }

    if let Some(contact) = &config.certificates.contact {
        if !contact.contains('@') {
            bail!("certificates.contact '{}' is not an email address", contact);
        }
    }
    require_contact(config, false)?;

    let mut keys = HashSet::new();
    let mut domains = HashSet::new();
    let mut ports: HashMap<(&str, u16), &str> = HashMap::new();

    for app in &config.apps {
        if app.key.is_empty() {
            bail!("An app has an empty key");
        }
        if !app
            .key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            bail!(
                "App key '{}' may only contain lowercase letters, digits, '-' and '_'",
                app.key
            );
        }
        if !keys.insert(app.key.as_str()) {
            bail!("App key '{}' is defined more than once", app.key);
        }

        if !is_hostname(&app.domain) {
            bail!(
                "App '{}' domain '{}' is not a hostname (lowercase labels of a-z, 0-9 and '-' separated by dots)",
                app.key,
                app.domain
            );
        }
        if !domains.insert(app.domain.as_str()) {
            bail!("Domain '{}' is used by more than one app", app.domain);
        }

        if app.repository.is_empty() {
            bail!("App '{}' repository cannot be empty", app.key);
        }

        if !config.hosts.contains_key(&app.host) {
            bail!("App '{}' refers to unknown host '{}'", app.key, app.host);
        }

        if app.port == 0 {
            bail!("App '{}' port cannot be 0", app.key);
        }
        if let Some(other) = ports.insert((app.host.as_str(), app.port), app.key.as_str()) {
            bail!(
                "Apps '{}' and '{}' both listen on port {} on host '{}'",
                other,
                app.key,
                app.port,
                app.host
            );
        }

        for name in &app.secrets {
            if !is_env_name(name) {
                bail!("App '{}' has invalid secret name '{}'", app.key, name);
            }
        }
        for name in app.env.keys() {
            if !is_env_name(name) {
                bail!("App '{}' has invalid env variable name '{}'", app.key, name);
            }
        }

        if let Some(db) = &app.database {
            if db.name.is_empty() || db.owner.is_empty() {
                bail!("App '{}' database name and owner cannot be empty", app.key);
            }
            if !app.secrets.contains(&db.password_secret) {
                bail!(
                    "App '{}' database password_secret '{}' must be listed in secrets",
                    app.key,
                    db.password_secret
                );
            }
        }
    }

    Ok(())
}

/// Certificate issuance needs an ACME contact. Apps that provision on every
/// deploy need one up front, as does an explicit `--setup` run; staging runs
/// tolerate issuance failures and are exempt.
pub fn require_contact(config: &RiggerConfig, setup_requested: bool) -> Result<()> {
    if config.certificates.contact.is_some() || config.certificates.staging {
        return Ok(());
    }
    if setup_requested {
        bail!("Setup issues certificates; set [certificates] contact first");
    }
    if let Some(app) = config.apps.iter().find(|a| a.setup) {
        bail!(
            "App '{}' has setup = true, which issues certificates; set [certificates] contact",
            app.key
        );
    }
    Ok(())
}

fn is_hostname(domain: &str) -> bool {
    domain.len() <= 253
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
