use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::join_all;

use crate::config::{require_contact, RiggerConfig};
use crate::deploy::context::DeploySettings;
use crate::deploy::probe::HttpProbe;
use crate::deploy::run::{CancelFlag, DeploymentRun, RunOutcome};
use crate::deploy::Orchestrator;
use crate::output;
use crate::registry::ApplicationRegistry;
use crate::secrets::store::FileSecretSource;
use crate::secrets::SecretSource;

use super::target::Target;

pub struct DeployArgs {
    pub app: Option<String>,
    pub all: bool,
    pub branch: Option<String>,
    pub setup: bool,
    pub local: bool,
    pub json: bool,
    pub parallel: bool,
}

pub async fn run(config: RiggerConfig, args: DeployArgs) -> Result<()> {
    if args.parallel && !args.all {
        bail!("--parallel only applies together with --all");
    }
    require_contact(&config, args.setup)?;

    let registry = Arc::new(ApplicationRegistry::from_config(&config)?);

    let keys: Vec<String> = if args.all {
        registry.all().iter().map(|a| a.key.clone()).collect()
    } else {
        let key = args.app.clone().context("Pass --app <key> or --all")?;
        registry.resolve(&key)?;
        vec![key]
    };

    let secrets: Arc<dyn SecretSource> = Arc::new(FileSecretSource::new(&config.secrets.path));

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Cancelling after the current step...");
                cancel.cancel();
            }
        });
    }

    // Interleaved step output from parallel runs is unreadable.
    let progress = !args.json && !(args.parallel && keys.len() > 1);

    let runs: Vec<(String, Result<DeploymentRun>)> = if args.parallel {
        let futures = keys.iter().map(|key| {
            deploy_one(&config, &registry, &secrets, &cancel, key, &args, progress)
        });
        keys.iter().cloned().zip(join_all(futures).await).collect()
    } else {
        let mut runs = Vec::with_capacity(keys.len());
        for key in &keys {
            let run = deploy_one(&config, &registry, &secrets, &cancel, key, &args, progress).await;
            let stop = run.as_ref().map_or(false, |r| r.outcome == RunOutcome::Cancelled);
            runs.push((key.clone(), run));
            if stop {
                break;
            }
        }
        runs
    };

    if args.json {
        let records: Vec<serde_json::Value> = runs
            .iter()
            .map(|(key, run)| match run {
                Ok(run) => serde_json::to_value(run).unwrap_or_default(),
                Err(e) => serde_json::json!({ "app": key, "outcome": "failed", "error": format!("{:#}", e) }),
            })
            .collect();
        let document = if records.len() == 1 {
            records.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(records)
        };
        println!("{}", serde_json::to_string_pretty(&document)?);
    }

    let mut failures = Vec::new();
    for (key, run) in &runs {
        match run {
            Ok(run) if run.is_success() => {
                if !args.json {
                    output::success(&format!("{} deployed ({})", key, run.branch));
                }
            }
            Ok(run) => failures.push(describe_failure(key, run)),
            Err(e) => failures.push(format!("{}: {:#}", key, e)),
        }
    }

    if !failures.is_empty() {
        bail!("{}", failures.join("\n"));
    }
    Ok(())
}

async fn deploy_one(
    config: &RiggerConfig,
    registry: &Arc<ApplicationRegistry>,
    secrets: &Arc<dyn SecretSource>,
    cancel: &CancelFlag,
    key: &str,
    args: &DeployArgs,
    progress: bool,
) -> Result<DeploymentRun> {
    let app = registry.resolve(key)?;
    let target = Target::open(config, &app.host, args.local).await?;

    let mut settings = DeploySettings::from_config(config, target.platform, target.proxy_layout.clone());
    settings.progress = progress;

    let probe = HttpProbe::new(
        Duration::from_secs(config.health_check.timeout),
        config.certificates.staging,
    )?;

    let orchestrator = Orchestrator::new(
        registry.clone(),
        target.exec.clone(),
        secrets.clone(),
        Arc::new(probe),
        settings,
    )
    .with_cancel(cancel.clone());

    Ok(orchestrator
        .deploy(key, args.branch.as_deref(), args.setup)
        .await?)
}

fn describe_failure(key: &str, run: &DeploymentRun) -> String {
    match (&run.outcome, &run.failure) {
        (RunOutcome::Cancelled, _) => format!("{}: cancelled", key),
        (RunOutcome::VerificationFailed, Some(f)) => {
            format!("{}: verification failed: {}", key, f.message)
        }
        (_, Some(f)) => format!("{}: step '{}' failed: {}", key, f.step, f.message),
        (_, None) => format!("{}: deployment did not complete", key),
    }
}
