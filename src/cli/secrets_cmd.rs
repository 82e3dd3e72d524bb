use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::RiggerConfig;
use crate::deploy::secrets::SecretsDeployer;
use crate::error::RiggerError;
use crate::output;
use crate::registry::ApplicationRegistry;
use crate::secrets::store::{self, FileSecretSource};
use crate::secrets::{key, SecretSource};
use crate::service::ServiceUnitManager;

use super::target::Target;

/// Push the current secrets into the unit's environment and restart.
pub async fn deploy(config: RiggerConfig, app_key: &str, local: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;
    let app = registry.resolve(app_key)?;
    let source = FileSecretSource::new(&config.secrets.path);

    let target = Target::open(&config, &app.host, local).await?;
    let units = ServiceUnitManager::new(target.exec.as_ref(), target.platform);

    let installed = SecretsDeployer::new(&source, &units)
        .deploy(app)
        .await
        .with_context(|| format!("Failed to deploy secrets of {}", app.key))?;

    output::success(&format!(
        "{} restarted with {} environment variables",
        installed.unit_name,
        installed.environment_keys.len()
    ));
    Ok(())
}

/// Report which required secrets are missing. Never prints values.
pub fn check(config: &RiggerConfig, app_key: &str) -> Result<()> {
    let registry = ApplicationRegistry::from_config(config)?;
    let app = registry.resolve(app_key)?;
    let source = FileSecretSource::new(&config.secrets.path);

    match source.get_all(&app.key, &app.required_secrets) {
        Ok(bundle) if bundle.is_empty() => {
            output::info(&format!("{} requires no secrets", app.key));
            Ok(())
        }
        Ok(bundle) => {
            output::success(&format!(
                "All {} required secrets of {} are present in {}",
                bundle.len(),
                app.key,
                source.path().display()
            ));
            Ok(())
        }
        Err(RiggerError::SecretBundleIncomplete { missing, .. }) => {
            for name in &missing {
                output::error(&format!("missing: {}", name));
            }
            bail!(
                "{} of {} required secrets missing for {} in {}",
                missing.len(),
                app.required_secrets.len(),
                app.key,
                source.path().display()
            )
        }
        Err(e) => Err(e.into()),
    }
}

pub fn list(config: &RiggerConfig, app_key: &str, reveal: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(config)?;
    let app = registry.resolve(app_key)?;
    let stored = FileSecretSource::new(&config.secrets.path).load(&app.key)?;

    if stored.is_empty() {
        output::info(&format!("No secrets stored for '{}'", app.key));
        return Ok(());
    }

    output::header(&format!("Secrets for '{}'", app.key));
    for (name, value) in &stored {
        let marker = if app.required_secrets.contains(name) { "" } else { " (unused)" };
        if reveal {
            println!("  {}={}{}", name, value, marker);
        } else {
            println!("  {}={}{}", name, mask_value(value), marker);
        }
    }
    Ok(())
}

pub fn keygen() -> Result<()> {
    let (identity, recipient) = key::generate_keypair();
    let key_path = key::save_identity(&identity)?;

    output::success("Key pair generated");
    println!();
    output::info(&format!("Private key saved to: {}", key_path.display()));
    output::info("Add this line to [secrets] in rigger.toml:");
    println!();
    println!("  [secrets]");
    println!("  recipients = [\"{}\"]", recipient);
    println!();
    output::info("For CI/CD, set RIGGER_AGE_KEY to the private key content.");
    output::warning("Keep the private key safe! Do not commit it to the repository.");

    Ok(())
}

/// Encrypt a plaintext secret document to `<file>.age`.
pub fn seal(config: &RiggerConfig, plain: &Path, recipients: &[String]) -> Result<()> {
    let recipients = if recipients.is_empty() {
        &config.secrets.recipients[..]
    } else {
        recipients
    };
    if recipients.is_empty() {
        bail!("No recipients given. Pass --recipient or add recipients to [secrets] in rigger.toml.");
    }

    let parsed = key::parse_recipients(recipients)?;
    let sealed = store::seal(plain, &parsed)
        .with_context(|| format!("Failed to seal {}", plain.display()))?;

    output::success(&format!("Sealed {} for {} recipient(s)", sealed.display(), parsed.len()));
    output::info(&format!(
        "Point [secrets] path at {} and remove the plaintext file.",
        sealed.display()
    ));
    Ok(())
}

/// Show the first 4 characters, mask the rest.
fn mask_value(value: &str) -> String {
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", value.chars().take(4).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_short_and_long_values() {
        assert_eq!(mask_value("abc"), "****");
        assert_eq!(mask_value("hunter2"), "hunt****");
        assert_eq!(mask_value("ünïcødé"), "ünïc****");
    }
}
