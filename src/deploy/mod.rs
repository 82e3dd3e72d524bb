//! The fixed provisioning sequence for one application.
//!
//! Steps run strictly in order. The first failing step ends the run; nothing
//! already applied is undone, and the run record names the step and the
//! error that stopped it.

pub mod context;
pub mod ledger;
pub mod probe;
pub mod run;
pub mod secrets;
pub mod steps;

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::exec::Executor;
use crate::output;
use crate::registry::ApplicationRegistry;
use crate::secrets::SecretSource;

use context::{DeployContext, DeploySettings, DeployState};
use ledger::DeployLedger;
use probe::HealthProbe;
use run::{CancelFlag, DeploymentRun, Step};
use steps::StepOutcome;

pub struct Orchestrator {
    registry: Arc<ApplicationRegistry>,
    exec: Arc<dyn Executor>,
    secrets: Arc<dyn SecretSource>,
    probe: Arc<dyn HealthProbe>,
    settings: DeploySettings,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ApplicationRegistry>,
        exec: Arc<dyn Executor>,
        secrets: Arc<dyn SecretSource>,
        probe: Arc<dyn HealthProbe>,
        settings: DeploySettings,
    ) -> Self {
        Self {
            registry,
            exec,
            secrets,
            probe,
            settings,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deploy `key`. Only an unknown key is an `Err`; every other failure is
    /// recorded on the returned run.
    pub async fn deploy(&self, key: &str, branch: Option<&str>, setup: bool) -> Result<DeploymentRun> {
        let app = self.registry.resolve(key)?;
        let branch = branch.unwrap_or(&app.branch).to_string();
        let setup = setup || app.setup;

        let ctx = DeployContext {
            app,
            branch: branch.clone(),
            setup,
            exec: self.exec.as_ref(),
            secrets: self.secrets.as_ref(),
            probe: self.probe.as_ref(),
            settings: &self.settings,
        };
        let mut state = DeployState::default();
        let mut run = DeploymentRun::new(&app.key, &branch, setup);

        if self.settings.progress {
            output::header(&format!(
                "Deploying {} ({}) to {}{}",
                app.name,
                branch,
                self.exec.host(),
                if setup { " [setup]" } else { "" }
            ));
        }

        for step in Step::ALL {
            if self.cancel.is_cancelled() {
                warn!("Deployment of {} cancelled before {}", app.key, step);
                run.cancel();
                return Ok(run);
            }

            run.begin(step);
            if self.settings.progress {
                output::step(step.number(), Step::ALL.len(), step.description());
            }

            match steps::run_step(step, &ctx, &mut state).await {
                Ok(StepOutcome::Done(detail)) => {
                    if self.settings.progress {
                        output::success(detail.as_deref().unwrap_or("done"));
                    }
                    run.succeed(detail);
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    if self.settings.progress {
                        output::skipped(&format!("skipped: {}", reason));
                    }
                    run.skip(reason);
                }
                Err(e) => {
                    warn!("{} failed at {}: {}", app.key, step, e);
                    if e.is_connection() {
                        warn!("Lost {} during {}; its state is unknown", self.exec.host(), step);
                    }
                    if self.settings.progress {
                        output::error(&format!("{} failed: {}", step, e));
                    }
                    run.fail(e.to_string());
                    return Ok(run);
                }
            }
        }

        if let Err(e) = self.write_ledger(&ctx, &state).await {
            warn!("Could not update the deploy ledger for {}: {}", app.key, e);
        }

        run.finish();
        info!("Deployed {} ({})", app.key, branch);
        Ok(run)
    }

    async fn write_ledger(&self, ctx: &DeployContext<'_>, state: &DeployState) -> Result<()> {
        let previous = DeployLedger::read(ctx.exec, ctx.app).await.unwrap_or(None);
        DeployLedger::new(
            ctx.app,
            &ctx.branch,
            state.git_sha.clone().unwrap_or_default(),
            previous.as_ref(),
            state.unit_digest.clone().unwrap_or_default(),
            ctx.setup,
        )
        .write(ctx.exec, ctx.app)
        .await
    }
}
