mod certs;
mod cli;
mod config;
mod deploy;
mod error;
mod exec;
mod os;
mod output;
mod proxy;
mod registry;
mod secrets;
mod service;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, SecretsAction};
use os::ServiceAction;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match cli.command {
        Command::Init => {
            cli::init::run(&cli.config)?;
        }

        Command::Deploy {
            app,
            all,
            branch,
            setup,
            local,
            json,
            parallel,
        } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::deploy::run(
                config,
                cli::deploy::DeployArgs {
                    app,
                    all,
                    branch,
                    setup,
                    local,
                    json,
                    parallel,
                },
            )
            .await?;
        }

        Command::Status { app, local, json } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::service_cmd::status(config, &app, local, json).await?;
        }

        Command::Start { app, local } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::service_cmd::control(config, &app, ServiceAction::Start, local).await?;
        }

        Command::Stop { app, local } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::service_cmd::control(config, &app, ServiceAction::Stop, local).await?;
        }

        Command::Restart { app, local } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::service_cmd::control(config, &app, ServiceAction::Restart, local).await?;
        }

        Command::Logs { app, lines, local } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::service_cmd::logs(config, &app, lines, local).await?;
        }

        Command::Apps { json } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::apps::run(config, json)?;
        }

        Command::Cert {
            app,
            staging,
            local,
        } => {
            let config = config::RiggerConfig::load(&cli.config)?;
            cli::cert::run(config, &app, staging, local).await?;
        }

        Command::Secrets { action } => match action {
            SecretsAction::Keygen => {
                cli::secrets_cmd::keygen()?;
            }
            SecretsAction::Deploy { app, local } => {
                let config = config::RiggerConfig::load(&cli.config)?;
                cli::secrets_cmd::deploy(config, &app, local).await?;
            }
            SecretsAction::Check { app } => {
                let config = config::RiggerConfig::load(&cli.config)?;
                cli::secrets_cmd::check(&config, &app)?;
            }
            SecretsAction::List { app, reveal } => {
                let config = config::RiggerConfig::load(&cli.config)?;
                cli::secrets_cmd::list(&config, &app, reveal)?;
            }
            SecretsAction::Seal { file, recipients } => {
                let config = config::RiggerConfig::load(&cli.config)?;
                cli::secrets_cmd::seal(&config, &file, &recipients)?;
            }
        },
    }

    Ok(())
}
