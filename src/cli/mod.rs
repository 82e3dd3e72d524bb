use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod apps;
pub mod cert;
pub mod deploy;
pub mod init;
pub mod secrets_cmd;
pub mod service_cmd;
pub mod target;

#[derive(Parser)]
#[command(
    name = "rigger",
    version,
    about = "Provision and deploy web apps to VMs: service units, nginx routes, certificates, secrets"
)]
pub struct Cli {
    /// Path to rigger.toml
    #[arg(short, long, default_value = "rigger.toml")]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold rigger.toml in the current directory
    Init,

    /// Deploy one application, or all of them
    Deploy {
        /// Application key
        #[arg(short, long, required_unless_present = "all", conflicts_with = "all")]
        app: Option<String>,
        /// Deploy every application in the registry
        #[arg(long)]
        all: bool,
        /// Branch to deploy instead of the configured one
        #[arg(short, long)]
        branch: Option<String>,
        /// First-time provisioning: database and certificate
        #[arg(long)]
        setup: bool,
        /// Run on this machine instead of over SSH
        #[arg(long)]
        local: bool,
        /// Print the deployment run as JSON
        #[arg(long)]
        json: bool,
        /// With --all, deploy applications concurrently
        #[arg(long, conflicts_with = "app")]
        parallel: bool,
    },

    /// Show whether an application is running
    Status {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        local: bool,
        #[arg(long)]
        json: bool,
    },

    /// Start an application's service
    Start {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        local: bool,
    },

    /// Stop an application's service
    Stop {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        local: bool,
    },

    /// Restart an application's service
    Restart {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        local: bool,
    },

    /// Show recent log output of an application
    Logs {
        #[arg(short, long)]
        app: String,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
        #[arg(long)]
        local: bool,
    },

    /// List configured applications
    Apps {
        #[arg(long)]
        json: bool,
    },

    /// Issue or renew an application's TLS certificate
    Cert {
        #[arg(short, long)]
        app: String,
        /// Use the ACME staging CA
        #[arg(long)]
        staging: bool,
        #[arg(long)]
        local: bool,
    },

    /// Manage application secrets
    Secrets {
        #[command(subcommand)]
        action: SecretsAction,
    },
}

#[derive(Subcommand)]
pub enum SecretsAction {
    /// Install current secrets into the unit's environment and restart
    Deploy {
        #[arg(short, long)]
        app: String,
        #[arg(long)]
        local: bool,
    },
    /// Report missing required secrets
    Check {
        #[arg(short, long)]
        app: String,
    },
    /// List stored secrets (values masked by default)
    List {
        #[arg(short, long)]
        app: String,
        /// Show actual values
        #[arg(long)]
        reveal: bool,
    },
    /// Generate an age keypair for encrypted secret documents
    Keygen,
    /// Encrypt a plaintext secret document to <file>.age
    Seal {
        /// Plaintext JSON document
        file: PathBuf,
        /// age recipient (repeatable); defaults to [secrets] recipients
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,
    },
}
