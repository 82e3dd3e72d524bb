//! Error types for rigger

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the deployment core.
///
/// Every variant is fatal to the step that raised it. Nothing in the core
/// retries on these; the orchestrator records the first one and halts.
#[derive(Error, Debug)]
pub enum RiggerError {
    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("Command failed on {host} (exit {exit_code}): {command}\nstderr: {stderr}")]
    Command {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command timed out on {host} after {}s: {command}", .timeout.as_secs())]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("Secret '{name}' not found for application '{app}'")]
    SecretNotFound { app: String, name: String },

    #[error("Secret bundle for '{app}' is incomplete, missing: {}", .missing.join(", "))]
    SecretBundleIncomplete { app: String, missing: Vec<String> },

    #[error("Secret source error: {0}")]
    SecretSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown application '{0}'")]
    UnknownApplication(String),

    #[error("Failed to install service unit for '{app}': {source}")]
    UnitInstall {
        app: String,
        source: Box<RiggerError>,
    },

    #[error("Failed to {action} service '{app}': {source}")]
    ServiceControl {
        app: String,
        action: &'static str,
        source: Box<RiggerError>,
    },

    #[error("Proxy configuration for {domain} is invalid: {detail}")]
    ProxyConfigInvalid { domain: String, detail: String },

    #[error("Failed to install proxy route for {domain}: {source}")]
    ProxyInstall {
        domain: String,
        source: Box<RiggerError>,
    },

    #[error("Certificate issuance for {domain} failed: {detail}")]
    Issuance { domain: String, detail: String },

    #[error("Verification of {url} failed: {detail}")]
    VerificationFailed { url: String, detail: String },

    #[error("Template error: {0}")]
    Render(#[from] minijinja::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RiggerError>;

impl RiggerError {
    /// True for transport failures, which say nothing about the remote state.
    pub fn is_connection(&self) -> bool {
        matches!(self, RiggerError::Connection { .. })
    }
}
