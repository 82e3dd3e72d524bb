//! ACME certificates via certbot's webroot mode.
//!
//! The HTTP-01 challenge is answered from the webroot location every route
//! carries, so nginx keeps serving while certbot runs.

use tracing::info;

use crate::error::{Result, RiggerError};
use crate::exec::{shell_quote, Executor, RemoteCommand};
use crate::proxy::{CertificateReference, ProxyRoute, ReverseProxyConfigurator};

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub domain: String,
    pub upstream_port: u16,
    pub contact: String,
    pub staging: bool,
    /// The domain serves real traffic
    pub live: bool,
}

pub struct CertificateIssuer<'a> {
    exec: &'a dyn Executor,
    proxy: &'a ReverseProxyConfigurator<'a>,
    webroot: String,
    renew_before_days: u64,
}

impl<'a> CertificateIssuer<'a> {
    pub fn new(
        exec: &'a dyn Executor,
        proxy: &'a ReverseProxyConfigurator<'a>,
        webroot: impl Into<String>,
        renew_before_days: u64,
    ) -> Self {
        Self {
            exec,
            proxy,
            webroot: webroot.into(),
            renew_before_days,
        }
    }

    /// Obtain (or keep) a certificate for the request's domain and switch
    /// its route to TLS.
    pub async fn issue(&self, request: &CertificateRequest) -> Result<CertificateReference> {
        let domain = &request.domain;
        if request.staging && request.live {
            return Err(RiggerError::Issuance {
                domain: domain.clone(),
                detail: "staging certificates are refused for live applications".to_string(),
            });
        }

        let cert = CertificateReference::letsencrypt(domain, request.staging);

        if self.still_valid(&cert).await? {
            info!("Certificate {} is valid beyond the renewal window", cert.name);
            return Ok(cert);
        }

        self.exec
            .sudo_exec(&format!("mkdir -p {}", shell_quote(&self.webroot)))
            .await?;

        let output = self
            .exec
            .run(&RemoteCommand::new(self.certbot_cmd(request, &cert)).elevated().best_effort())
            .await?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(RiggerError::Issuance {
                domain: domain.clone(),
                detail,
            });
        }

        info!("Issued certificate {}", cert.name);

        self.proxy
            .apply(&ProxyRoute {
                domain: domain.clone(),
                upstream_port: request.upstream_port,
                certificate: Some(cert.clone()),
            })
            .await?;

        Ok(cert)
    }

    async fn still_valid(&self, cert: &CertificateReference) -> Result<bool> {
        if !self.exec.path_exists(&cert.fullchain).await? {
            return Ok(false);
        }
        let window = self.renew_before_days * SECS_PER_DAY;
        let script = format!(
            "openssl x509 -checkend {} -noout -in {}",
            window,
            shell_quote(&cert.fullchain)
        );
        Ok(self
            .exec
            .run(&RemoteCommand::new(script).elevated().best_effort())
            .await?
            .success())
    }

    fn certbot_cmd(&self, request: &CertificateRequest, cert: &CertificateReference) -> String {
        let mut cmd = format!(
            "certbot certonly --webroot -w {} -d {} --cert-name {} --non-interactive --agree-tos -m {} --keep-until-expiring",
            shell_quote(&self.webroot),
            shell_quote(&request.domain),
            shell_quote(&cert.name),
            shell_quote(&request.contact),
        );
        if request.staging {
            cmd.push_str(" --staging");
        }
        cmd
    }
}
