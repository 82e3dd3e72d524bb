pub mod key;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, RiggerError};

/// A secret value. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(****)")
    }
}

/// Complete set of secrets required by one application.
#[derive(Clone)]
pub struct SecretBundle {
    app: String,
    values: BTreeMap<String, SecretValue>,
}

impl SecretBundle {
    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("app", &self.app)
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read-only key-value store of secrets, keyed by application and name.
///
/// `load` is called on every lookup; implementations must not cache across
/// calls since secrets may rotate between runs.
pub trait SecretSource: Send + Sync {
    /// All variables stored for `app`. An unknown app yields an empty map.
    fn load(&self, app: &str) -> Result<BTreeMap<String, String>>;

    fn get(&self, app: &str, name: &str) -> Result<SecretValue> {
        self.load(app)?
            .remove(name)
            .filter(|v| !v.is_empty())
            .map(SecretValue)
            .ok_or_else(|| RiggerError::SecretNotFound {
                app: app.to_string(),
                name: name.to_string(),
            })
    }

    /// Fetch exactly `names`. Fails listing every missing or empty name;
    /// never returns a partial bundle.
    fn get_all(&self, app: &str, names: &[String]) -> Result<SecretBundle> {
        let mut stored = self.load(app)?;
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();

        for name in names {
            if values.contains_key(name) || missing.contains(name) {
                continue;
            }
            match stored.remove(name) {
                Some(value) if !value.is_empty() => {
                    values.insert(name.clone(), SecretValue(value));
                }
                _ => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(RiggerError::SecretBundleIncomplete {
                app: app.to_string(),
                missing,
            });
        }

        Ok(SecretBundle {
            app: app.to_string(),
            values,
        })
    }
}

#[cfg(test)]
pub use memory::MemorySecretSource;


#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_required_names_is_an_empty_bundle() {
        let source = MemorySecretSource::new().with("sample", "DB_PASS", "hunter2");
        let bundle = source.get_all("sample", &[]).unwrap();
        assert!(bundle.is_empty());
        assert_eq!(bundle.app(), "sample");
    }

    #[test]
    fn get_all_returns_only_requested_names() {
        let source = MemorySecretSource::new()
            .with("sample", "DB_PASS", "hunter2")
            .with("sample", "API_TOKEN", "tok")
            .with("sample", "UNUSED", "x");

        let bundle = source
            .get_all("sample", &names(&["DB_PASS", "API_TOKEN"]))
            .unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("DB_PASS").unwrap().expose(), "hunter2");
        assert!(bundle.get("UNUSED").is_none());
    }

    #[test]
    fn get_all_lists_every_missing_or_empty_name() {
        let source = MemorySecretSource::new()
            .with("sample", "DB_PASS", "hunter2")
            .with("sample", "SMTP_PASS", "");

        let err = source
            .get_all("sample", &names(&["DB_PASS", "API_TOKEN", "SMTP_PASS"]))
            .unwrap_err();
        match err {
            RiggerError::SecretBundleIncomplete { app, missing } => {
                assert_eq!(app, "sample");
                assert_eq!(missing, names(&["API_TOKEN", "SMTP_PASS"]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn get_reports_absent_secret() {
        let source = MemorySecretSource::new().with("sample", "DB_PASS", "hunter2");
        assert_eq!(source.get("sample", "DB_PASS").unwrap().expose(), "hunter2");
        assert!(matches!(
            source.get("cigar", "DB_PASS"),
            Err(RiggerError::SecretNotFound { .. })
        ));
    }

    #[test]
    fn debug_output_never_contains_values() {
        let source = MemorySecretSource::new().with("sample", "DB_PASS", "hunter2");
        let bundle = source.get_all("sample", &names(&["DB_PASS"])).unwrap();
        let printed = format!("{:?}", bundle);
        assert!(printed.contains("DB_PASS"));
        assert!(!printed.contains("hunter2"));
    }
}
