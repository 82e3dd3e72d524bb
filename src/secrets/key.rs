use std::fs;
use std::path::PathBuf;

use age::secrecy::ExposeSecret;
use age::x25519;

use crate::error::{Result, RiggerError};

const KEY_ENV: &str = "RIGGER_AGE_KEY";

/// Generate a new age x25519 keypair
pub fn generate_keypair() -> (x25519::Identity, x25519::Recipient) {
    let identity = x25519::Identity::generate();
    let recipient = identity.to_public();
    (identity, recipient)
}

/// Private keys live in ~/.config/rigger/keys/
fn keys_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| RiggerError::SecretSource("Could not determine config directory".into()))?;
    Ok(config_dir.join("rigger").join("keys"))
}

pub fn key_path() -> Result<PathBuf> {
    Ok(keys_dir()?.join("secrets.key"))
}

/// Save identity with perm 600. Refuses to overwrite an existing key.
pub fn save_identity(identity: &x25519::Identity) -> Result<PathBuf> {
    let dir = keys_dir()?;
    fs::create_dir_all(&dir)?;

    let path = key_path()?;
    if path.exists() {
        return Err(RiggerError::SecretSource(format!(
            "Key already exists at {}",
            path.display()
        )));
    }

    let content = identity.to_string();
    fs::write(&path, content.expose_secret().as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(path)
}

/// Load identity from RIGGER_AGE_KEY or from the key file.
pub fn load_identity() -> Result<x25519::Identity> {
    // CI/CD first
    if let Ok(key_str) = std::env::var(KEY_ENV) {
        return parse_identity(&key_str)
            .map_err(|e| RiggerError::SecretSource(format!("Invalid {}: {}", KEY_ENV, e)));
    }

    let path = key_path()?;
    let content = fs::read_to_string(&path).map_err(|_| {
        RiggerError::SecretSource(format!(
            "Key not found at {}. Run `rigger secrets keygen` or set {}.",
            path.display(),
            KEY_ENV
        ))
    })?;

    parse_identity(&content)
        .map_err(|e| RiggerError::SecretSource(format!("Invalid key file {}: {}", path.display(), e)))
}

fn parse_identity(s: &str) -> std::result::Result<x25519::Identity, String> {
    s.trim().parse::<x25519::Identity>().map_err(|e| e.to_string())
}

pub fn parse_recipients(recipients: &[String]) -> Result<Vec<x25519::Recipient>> {
    recipients
        .iter()
        .map(|r| {
            r.parse::<x25519::Recipient>()
                .map_err(|e| RiggerError::SecretSource(format!("Invalid recipient '{}': {}", r, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipients_parse_from_generated_keys() {
        let (_, recipient) = generate_keypair();
        let parsed = parse_recipients(&[recipient.to_string()]).unwrap();
        assert_eq!(parsed.len(), 1);

        let err = parse_recipients(&["age1nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Invalid recipient"));
    }
}
