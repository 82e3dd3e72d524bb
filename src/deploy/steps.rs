use tracing::{debug, info, warn};

use crate::certs::{CertificateIssuer, CertificateRequest};
use crate::error::{Result, RiggerError};
use crate::exec::{shell_quote, RemoteCommand};

use super::context::{DeployContext, DeployState};
use super::run::Step;
use super::secrets::SecretsDeployer;

pub enum StepOutcome {
    Done(Option<String>),
    Skipped(String),
}

pub async fn run_step(step: Step, ctx: &DeployContext<'_>, state: &mut DeployState) -> Result<StepOutcome> {
    match step {
        Step::Directories => create_directories(ctx).await,
        Step::FetchSource => fetch_source(ctx, state).await,
        Step::InstallDependencies => install_dependencies(ctx).await,
        Step::ServiceUnit => prepare_unit(ctx).await,
        Step::Secrets => inject_secrets(ctx, state).await,
        Step::Database => prepare_database(ctx).await,
        Step::Assets => build_assets(ctx).await,
        Step::ProxyRoute => configure_route(ctx, state).await,
        Step::Certificate => issue_certificate(ctx, state).await,
        Step::StartService => start_service(ctx).await,
        Step::Verify => verify(ctx, state).await,
    }
}

async fn create_directories(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    let app = ctx.app;
    let path = shell_quote(&app.path);
    let shared = shell_quote(&app.shared_path());
    ctx.exec
        .sudo_exec(&format!(
            "mkdir -p {path} {shared} && chown {user}: {path} {shared}",
            path = path,
            shared = shared,
            user = shell_quote(&app.user)
        ))
        .await?;
    Ok(StepOutcome::Done(None))
}

async fn fetch_source(ctx: &DeployContext<'_>, state: &mut DeployState) -> Result<StepOutcome> {
    let src = shell_quote(&ctx.app.source_path());
    let branch = shell_quote(&ctx.branch);
    let script = format!(
        "if [ -d {src}/.git ]; then \
         git -C {src} fetch --prune origin && git -C {src} checkout -f -B {branch} origin/{branch}; \
         else git clone --branch {branch} {repo} {src}; fi",
        src = src,
        branch = branch,
        repo = shell_quote(&ctx.app.repository),
    );
    ctx.exec
        .run(&ctx.as_app(RemoteCommand::new(script).timeout(ctx.settings.command_timeout)))
        .await?;

    let sha = ctx
        .exec
        .run(&ctx.as_app(RemoteCommand::new(format!("git -C {} rev-parse HEAD", src))))
        .await?
        .stdout
        .trim()
        .to_string();
    debug!("{} is at {}", ctx.app.key, sha);

    let short = sha.get(..7).unwrap_or(&sha).to_string();
    state.git_sha = Some(sha);
    Ok(StepOutcome::Done(Some(format!("{} @ {}", ctx.branch, short))))
}

async fn install_dependencies(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    let install = &ctx.app.commands.install;
    if install.is_empty() {
        return Ok(StepOutcome::Skipped("no install command".to_string()));
    }
    ctx.exec.run(&ctx.source_command(install)).await?;
    Ok(StepOutcome::Done(None))
}

async fn prepare_unit(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    let spec = ctx.units().prepare(ctx.app).await?;
    Ok(StepOutcome::Done(Some(spec.unit_name)))
}

async fn inject_secrets(ctx: &DeployContext<'_>, state: &mut DeployState) -> Result<StepOutcome> {
    let units = ctx.units();
    let installed = SecretsDeployer::new(ctx.secrets, &units)
        .inject(ctx.app)
        .await?;

    let detail = format!(
        "{} secrets, unit {}",
        ctx.app.required_secrets.len(),
        &installed.digest[..12]
    );
    state.unit_digest = Some(installed.digest);
    Ok(StepOutcome::Done(Some(detail)))
}

/// Role and database are created only in setup mode; migrations always run.
async fn prepare_database(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    let commands = &ctx.app.commands;
    let mut done = Vec::new();

    if ctx.setup {
        if let Some(db) = &ctx.app.database {
            let script = format!(
                "set -a && . {env} && set +a && sudo -u postgres psql -v ON_ERROR_STOP=1 \
                 -v owner={owner} -v db={db} -v pw=\"${secret}\" <<'SQL'\n{sql}SQL",
                env = shell_quote(&ctx.app.env_file()),
                owner = shell_quote(&db.owner),
                db = shell_quote(&db.name),
                secret = db.password_secret,
                sql = BOOTSTRAP_SQL,
            );
            ctx.exec
                .run(&RemoteCommand::new(script).elevated().timeout(ctx.settings.command_timeout))
                .await?;
            done.push(format!("role {} and database {}", db.owner, db.name));
        }

        if !commands.db_create.is_empty() {
            ctx.exec.run(&ctx.app_command(&commands.db_create)).await?;
            done.push("db_create".to_string());
        }
    }

    if !commands.migrate.is_empty() {
        ctx.exec.run(&ctx.app_command(&commands.migrate)).await?;
        done.push("migrate".to_string());
    }

    if done.is_empty() {
        Ok(StepOutcome::Skipped("nothing to do".to_string()))
    } else {
        Ok(StepOutcome::Done(Some(done.join(", "))))
    }
}

// Idempotent: each statement is generated only when the object is missing.
const BOOTSTRAP_SQL: &str = "\
SELECT format('CREATE ROLE %I LOGIN PASSWORD %L', :'owner', :'pw')
WHERE NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = :'owner')\\gexec
SELECT format('ALTER ROLE %I PASSWORD %L', :'owner', :'pw')\\gexec
SELECT format('CREATE DATABASE %I OWNER %I', :'db', :'owner')
WHERE NOT EXISTS (SELECT 1 FROM pg_database WHERE datname = :'db')\\gexec
";

async fn build_assets(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    let assets = &ctx.app.commands.assets;
    if assets.is_empty() {
        return Ok(StepOutcome::Skipped("no assets command".to_string()));
    }
    ctx.exec.run(&ctx.app_command(assets)).await?;
    Ok(StepOutcome::Done(None))
}

async fn configure_route(ctx: &DeployContext<'_>, state: &mut DeployState) -> Result<StepOutcome> {
    let route = ctx.proxy().configure(&ctx.app.domain, ctx.app.port).await?;
    let detail = format!("{}://{} -> 127.0.0.1:{}", route.scheme(), route.domain, route.upstream_port);
    state.route = Some(route);
    Ok(StepOutcome::Done(Some(detail)))
}

async fn issue_certificate(ctx: &DeployContext<'_>, state: &mut DeployState) -> Result<StepOutcome> {
    if !ctx.setup {
        return Ok(StepOutcome::Skipped("setup only".to_string()));
    }

    let result = match &ctx.settings.contact {
        Some(contact) => {
            let proxy = ctx.proxy();
            let issuer = CertificateIssuer::new(
                ctx.exec,
                &proxy,
                ctx.settings.webroot.clone(),
                ctx.settings.renew_before_days,
            );
            issuer
                .issue(&CertificateRequest {
                    domain: ctx.app.domain.clone(),
                    upstream_port: ctx.app.port,
                    contact: contact.clone(),
                    staging: ctx.settings.staging,
                    live: ctx.app.live,
                })
                .await
        }
        None => Err(RiggerError::Issuance {
            domain: ctx.app.domain.clone(),
            detail: "no ACME contact configured under [certificates]".to_string(),
        }),
    };

    match result {
        Ok(cert) => {
            let name = cert.name.clone();
            if let Some(route) = state.route.as_mut() {
                route.certificate = Some(cert);
            }
            Ok(StepOutcome::Done(Some(name)))
        }
        Err(e) if ctx.settings.staging => {
            warn!("Staging certificate for {} not issued: {}", ctx.app.domain, e);
            Ok(StepOutcome::Skipped(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

async fn start_service(ctx: &DeployContext<'_>) -> Result<StepOutcome> {
    // restart also starts a stopped unit
    ctx.units().restart(ctx.app).await?;
    Ok(StepOutcome::Done(None))
}

/// Only a 200 on the health path counts. Anything else after the last
/// attempt fails verification.
async fn verify(ctx: &DeployContext<'_>, state: &DeployState) -> Result<StepOutcome> {
    let scheme = state.route.as_ref().map_or("http", |r| r.scheme());
    let url = format!("{}://{}{}", scheme, ctx.app.domain, ctx.app.health_path);
    let attempts = ctx.settings.health_retries.max(1);

    let mut last = String::new();
    for attempt in 1..=attempts {
        match ctx.probe.probe(&url).await {
            Ok(200) => {
                info!("{} answered 200 (attempt {}/{})", url, attempt, attempts);
                return Ok(StepOutcome::Done(Some(url)));
            }
            Ok(status) => last = format!("HTTP {}", status),
            Err(e) => last = e,
        }
        debug!("{} not healthy yet: {} (attempt {}/{})", url, last, attempt, attempts);
        if attempt < attempts {
            tokio::time::sleep(ctx.settings.health_interval).await;
        }
    }

    Err(RiggerError::VerificationFailed {
        url,
        detail: format!("{} after {} attempts", last, attempts),
    })
}
