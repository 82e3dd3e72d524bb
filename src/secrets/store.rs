//! JSON secret document on the operator's machine.
//!
//! Layout: `{ "<app key>": { "<VAR>": "<value>", ... }, ... }`. Numbers and
//! booleans are stringified; nested objects (e.g. a `databases` section) are
//! ignored. A path ending in `.age` is decrypted with the local identity.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use age::x25519;
use serde_json::Value;
use tracing::debug;

use super::{key, SecretSource};
use crate::error::{Result, RiggerError};

pub struct FileSecretSource {
    path: PathBuf,
}

impl FileSecretSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_encrypted(&self) -> bool {
        self.path.extension().is_some_and(|ext| ext == "age")
    }

    fn read_document(&self) -> Result<String> {
        let raw = fs::read(&self.path).map_err(|e| {
            RiggerError::SecretSource(format!("Failed to read {}: {}", self.path.display(), e))
        })?;

        if self.is_encrypted() {
            let identity = key::load_identity()?;
            decrypt(&raw, &identity)
        } else {
            String::from_utf8(raw).map_err(|_| {
                RiggerError::SecretSource(format!("{} is not valid UTF-8", self.path.display()))
            })
        }
    }
}

impl SecretSource for FileSecretSource {
    fn load(&self, app: &str) -> Result<BTreeMap<String, String>> {
        let document = self.read_document()?;
        parse_document(&document, app)
    }
}

/// Extract the variables of one application from a secret document.
pub fn parse_document(document: &str, app: &str) -> Result<BTreeMap<String, String>> {
    let root: Value = serde_json::from_str(document)
        .map_err(|e| RiggerError::SecretSource(format!("Secret document is not valid JSON: {}", e)))?;

    let Some(section) = root.get(app) else {
        return Ok(BTreeMap::new());
    };

    let Some(vars) = section.as_object() else {
        return Err(RiggerError::SecretSource(format!(
            "Secrets for '{}' must be a JSON object",
            app
        )));
    };

    let mut map = BTreeMap::new();
    for (name, value) in vars {
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                debug!("Ignoring non-scalar secret entry {}.{}", app, name);
                continue;
            }
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}

/// Encrypt plaintext for the given recipients, returning armored age output
pub fn encrypt(plaintext: &str, recipients: &[x25519::Recipient]) -> Result<Vec<u8>> {
    let encryptor =
        age::Encryptor::with_recipients(recipients.iter().map(|r| r as &dyn age::Recipient))
            .map_err(|e| RiggerError::SecretSource(format!("Encryption setup failed: {}", e)))?;

    let mut output = vec![];
    let armor_writer =
        age::armor::ArmoredWriter::wrap_output(&mut output, age::armor::Format::AsciiArmor)?;
    let mut writer = encryptor.wrap_output(armor_writer)?;
    writer.write_all(plaintext.as_bytes())?;

    let armor_writer = writer.finish()?;
    armor_writer.finish()?;

    Ok(output)
}

/// Decrypt armored age ciphertext using the given identity
pub fn decrypt(ciphertext: &[u8], identity: &x25519::Identity) -> Result<String> {
    let decryptor = age::Decryptor::new(age::armor::ArmoredReader::new(ciphertext))
        .map_err(|e| RiggerError::SecretSource(format!("Failed to parse age file: {}", e)))?;

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| RiggerError::SecretSource(format!("Decryption failed: {}", e)))?;

    let mut plaintext = String::new();
    reader.read_to_string(&mut plaintext)?;

    Ok(plaintext)
}

/// Encrypt a plaintext secret document next to itself as `<file>.age`.
pub fn seal(plain: &Path, recipients: &[x25519::Recipient]) -> Result<PathBuf> {
    if recipients.is_empty() {
        return Err(RiggerError::SecretSource(
            "No recipients given to seal the secret document for".into(),
        ));
    }

    let plaintext = fs::read_to_string(plain)?;
    // Refuse to seal something the source could not read back.
    let _: Value = serde_json::from_str(&plaintext)
        .map_err(|e| RiggerError::SecretSource(format!("{} is not valid JSON: {}", plain.display(), e)))?;

    let ciphertext = encrypt(&plaintext, recipients)?;

    let mut sealed = plain.as_os_str().to_owned();
    sealed.push(".age");
    let sealed = PathBuf::from(sealed);
    fs::write(&sealed, ciphertext)?;
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "sample": { "DB_PASS": "hunter2", "API_TOKEN": "tok", "WORKERS": 4 },
        "cigar": { "DB_PASS": "leaf" },
        "databases": { "hosting_production": { "username": "postgres" } }
    }"#;

    #[test]
    fn parses_one_application_section() {
        let vars = parse_document(DOCUMENT, "sample").unwrap();
        assert_eq!(vars.get("DB_PASS").map(String::as_str), Some("hunter2"));
        assert_eq!(vars.get("WORKERS").map(String::as_str), Some("4"));
        assert_eq!(vars.len(), 3);

        assert!(parse_document(DOCUMENT, "whiskey").unwrap().is_empty());
    }

    #[test]
    fn file_source_rereads_on_every_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".secrets.json");
        fs::write(&path, r#"{"sample": {"DB_PASS": "one"}}"#).unwrap();

        let source = FileSecretSource::new(&path);
        assert_eq!(source.get("sample", "DB_PASS").unwrap().expose(), "one");

        fs::write(&path, r#"{"sample": {"DB_PASS": "two"}}"#).unwrap();
        assert_eq!(source.get("sample", "DB_PASS").unwrap().expose(), "two");
    }

    #[test]
    fn missing_file_is_a_source_error() {
        let source = FileSecretSource::new("/nonexistent/.secrets.json");
        assert_eq!(source.path(), Path::new("/nonexistent/.secrets.json"));
        assert!(matches!(
            source.load("sample"),
            Err(RiggerError::SecretSource(_))
        ));
    }

    #[test]
    fn sealed_documents_decrypt_with_the_matching_identity() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join(".secrets.json");
        fs::write(&plain, DOCUMENT).unwrap();

        let (identity, recipient) = key::generate_keypair();
        let sealed = seal(&plain, &[recipient]).unwrap();
        assert!(sealed.to_string_lossy().ends_with(".secrets.json.age"));

        let ciphertext = fs::read(&sealed).unwrap();
        let plaintext = decrypt(&ciphertext, &identity).unwrap();
        let vars = parse_document(&plaintext, "cigar").unwrap();
        assert_eq!(vars.get("DB_PASS").map(String::as_str), Some("leaf"));
    }
}
