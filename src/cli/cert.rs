use anyhow::{Context, Result};

use crate::certs::{CertificateIssuer, CertificateRequest};
use crate::config::RiggerConfig;
use crate::output;
use crate::proxy::ReverseProxyConfigurator;
use crate::registry::ApplicationRegistry;

use super::target::Target;

/// Issue or renew the certificate of one application outside a deploy.
pub async fn run(config: RiggerConfig, key: &str, staging: bool, local: bool) -> Result<()> {
    let registry = ApplicationRegistry::from_config(&config)?;
    let app = registry.resolve(key)?;
    let contact = config
        .certificates
        .contact
        .clone()
        .context("Set [certificates] contact in rigger.toml before issuing certificates")?;

    let target = Target::open(&config, &app.host, local).await?;
    let proxy = ReverseProxyConfigurator::new(
        target.exec.as_ref(),
        target.proxy_layout.clone(),
        config.certificates.webroot.clone(),
    );

    // The challenge is served through the route, so it must exist first.
    proxy
        .configure(&app.domain, app.port)
        .await
        .with_context(|| format!("Failed to configure the route for {}", app.domain))?;

    let issuer = CertificateIssuer::new(
        target.exec.as_ref(),
        &proxy,
        config.certificates.webroot.clone(),
        config.certificates.renew_before_days,
    );

    let spinner = output::create_spinner(&format!("Requesting certificate for {}...", app.domain));
    let result = issuer
        .issue(&CertificateRequest {
            domain: app.domain.clone(),
            upstream_port: app.port,
            contact,
            staging: staging || config.certificates.staging,
            live: app.live,
        })
        .await;
    spinner.finish_and_clear();

    let cert = result?;
    output::success(&format!(
        "Certificate {}{} at {}",
        cert.name,
        if cert.staging { " (staging)" } else { "" },
        cert.fullchain
    ));
    Ok(())
}
