//! nginx routes, one server file per domain.
//!
//! A route is never swapped in unvalidated: the new file is staged, checked
//! in isolation, swapped over the live one, and the whole configuration is
//! checked again before nginx reloads. A failed check restores the previous
//! file.

use minijinja::Environment;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, RiggerError};
use crate::exec::{shell_quote, Executor, RemoteCommand};
use crate::os::Platform;

const ROUTE_TEMPLATE: &str = include_str!("../../templates/nginx-route.conf.j2");
const CHECK_TEMPLATE: &str = include_str!("../../templates/nginx-check.conf.j2");

const STAGED_SUFFIX: &str = ".rigger-new";
const BACKUP_SUFFIX: &str = ".rigger-prev";
const LETSENCRYPT_LIVE: &str = "/etc/letsencrypt/live";

/// TLS material referenced by a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateReference {
    pub name: String,
    pub fullchain: String,
    pub private_key: String,
    pub staging: bool,
}

impl CertificateReference {
    pub fn letsencrypt(domain: &str, staging: bool) -> Self {
        let name = cert_name(domain, staging);
        Self {
            fullchain: format!("{}/{}/fullchain.pem", LETSENCRYPT_LIVE, name),
            private_key: format!("{}/{}/privkey.pem", LETSENCRYPT_LIVE, name),
            name,
            staging,
        }
    }
}

/// Staging certificates live under their own name so they never shadow a
/// production one.
pub fn cert_name(domain: &str, staging: bool) -> String {
    if staging {
        format!("{}-staging", domain)
    } else {
        domain.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    pub domain: String,
    pub upstream_port: u16,
    pub certificate: Option<CertificateReference>,
}

impl ProxyRoute {
    pub fn upstream_name(&self) -> String {
        format!("rigger_{}", self.domain.replace(['.', '-'], "_"))
    }

    pub fn scheme(&self) -> &'static str {
        if self.certificate.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// Where nginx keeps server files on a host, and how it is reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLayout {
    pub available_dir: String,
    /// Symlink directory for Debian-style `sites-enabled` trees
    pub enabled_dir: Option<String>,
    pub check_dir: String,
    pub mime_types: String,
    pub reload: String,
}

impl ProxyLayout {
    pub fn for_platform(platform: Platform, nginx_dir: Option<&str>) -> Self {
        match platform {
            Platform::Systemd => {
                let root = nginx_dir.unwrap_or("/etc/nginx");
                Self {
                    available_dir: format!("{}/sites-available", root),
                    enabled_dir: Some(format!("{}/sites-enabled", root)),
                    check_dir: format!("{}/rigger-check", root),
                    mime_types: format!("{}/mime.types", root),
                    reload: "systemctl reload nginx".to_string(),
                }
            }
            Platform::Launchd => {
                let root = nginx_dir.unwrap_or("/opt/homebrew/etc/nginx");
                Self {
                    available_dir: format!("{}/servers", root),
                    enabled_dir: None,
                    check_dir: format!("{}/rigger-check", root),
                    mime_types: format!("{}/mime.types", root),
                    reload: "nginx -s reload".to_string(),
                }
            }
            Platform::Supervisor => {
                let root = nginx_dir.unwrap_or("/etc/nginx");
                Self {
                    available_dir: format!("{}/conf.d", root),
                    enabled_dir: None,
                    check_dir: format!("{}/rigger-check", root),
                    mime_types: format!("{}/mime.types", root),
                    reload: "nginx -s reload".to_string(),
                }
            }
        }
    }

    pub fn route_path(&self, domain: &str) -> String {
        format!("{}/{}.conf", self.available_dir, domain)
    }

    pub fn enabled_path(&self, domain: &str) -> Option<String> {
        self.enabled_dir
            .as_ref()
            .map(|dir| format!("{}/{}.conf", dir, domain))
    }
}

pub struct ReverseProxyConfigurator<'a> {
    exec: &'a dyn Executor,
    layout: ProxyLayout,
    webroot: String,
}

impl<'a> ReverseProxyConfigurator<'a> {
    pub fn new(exec: &'a dyn Executor, layout: ProxyLayout, webroot: impl Into<String>) -> Self {
        Self {
            exec,
            layout,
            webroot: webroot.into(),
        }
    }

    pub fn render(&self, route: &ProxyRoute) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("route.conf", ROUTE_TEMPLATE)?;
        let tmpl = env.get_template("route.conf")?;
        Ok(tmpl.render(minijinja::context! {
            domain => &route.domain,
            port => route.upstream_port,
            upstream => route.upstream_name(),
            webroot => &self.webroot,
            certificate => &route.certificate,
        })?)
    }

    /// A certificate already issued for `domain` on this host, production
    /// preferred over staging.
    pub async fn existing_certificate(&self, domain: &str) -> Result<Option<CertificateReference>> {
        for staging in [false, true] {
            let cert = CertificateReference::letsencrypt(domain, staging);
            if self.exec.path_exists(&cert.fullchain).await? {
                return Ok(Some(cert));
            }
        }
        Ok(None)
    }

    /// Install or update the route for `domain`, keeping TLS if a
    /// certificate is already on the host.
    pub async fn configure(&self, domain: &str, port: u16) -> Result<ProxyRoute> {
        let route = ProxyRoute {
            domain: domain.to_string(),
            upstream_port: port,
            certificate: self.existing_certificate(domain).await?,
        };
        self.apply(&route).await?;
        Ok(route)
    }

    pub async fn apply(&self, route: &ProxyRoute) -> Result<()> {
        let content = self.render(route)?;
        let domain = &route.domain;
        let live = self.layout.route_path(domain);
        let staged = format!("{}{}", live, STAGED_SUFFIX);
        let backup = format!("{}{}", live, BACKUP_SUFFIX);

        self.exec
            .sudo_exec(&format!(
                "mkdir -p {} {} {}",
                shell_quote(&self.layout.available_dir),
                shell_quote(&self.layout.check_dir),
                shell_quote(&self.webroot)
            ))
            .await
            .map_err(|e| install_error(domain, e))?;
        if let Some(dir) = &self.layout.enabled_dir {
            self.exec
                .sudo_exec(&format!("mkdir -p {}", shell_quote(dir)))
                .await
                .map_err(|e| install_error(domain, e))?;
        }

        self.exec
            .write_file(&staged, &content, 0o644, true)
            .await
            .map_err(|e| install_error(domain, e))?;

        if let Err(detail) = self.check_staged(domain, &staged).await? {
            self.exec.remove_file(&staged, true).await?;
            return Err(RiggerError::ProxyConfigInvalid {
                domain: domain.clone(),
                detail,
            });
        }

        let had_live = self.exec.path_exists(&live).await?;
        if had_live {
            self.exec
                .copy_file(&live, &backup, true)
                .await
                .map_err(|e| install_error(domain, e))?;
        }

        self.exec
            .rename(&staged, &live, true)
            .await
            .map_err(|e| install_error(domain, e))?;

        if let Some(enabled) = self.layout.enabled_path(domain) {
            self.exec
                .sudo_exec(&format!("ln -sfn {} {}", shell_quote(&live), shell_quote(&enabled)))
                .await
                .map_err(|e| install_error(domain, e))?;
        }

        let full = self
            .exec
            .run(&RemoteCommand::new("nginx -t").elevated().best_effort())
            .await?;
        if !full.success() {
            warn!("nginx rejected the configuration with {}; restoring the previous route", domain);
            if had_live {
                self.exec.rename(&backup, &live, true).await?;
            } else {
                self.exec.remove_file(&live, true).await?;
                if let Some(enabled) = self.layout.enabled_path(domain) {
                    self.exec.remove_file(&enabled, true).await?;
                }
            }
            return Err(RiggerError::ProxyConfigInvalid {
                domain: domain.clone(),
                detail: full.stderr.trim().to_string(),
            });
        }

        if had_live {
            self.exec.remove_file(&backup, true).await?;
        }

        self.exec
            .sudo_exec(&self.layout.reload)
            .await
            .map_err(|e| install_error(domain, e))?;

        info!("Route {} -> 127.0.0.1:{} ({})", domain, route.upstream_port, route.scheme());
        Ok(())
    }

    /// Check the staged file alone, wrapped in a throwaway top-level config.
    /// The outer result is transport failure, the inner one nginx's verdict.
    async fn check_staged(&self, domain: &str, staged: &str) -> Result<std::result::Result<(), String>> {
        let harness_path = format!("{}/{}.conf", self.layout.check_dir, domain);

        let mut env = Environment::new();
        env.add_template("check.conf", CHECK_TEMPLATE)?;
        let harness = env.get_template("check.conf")?.render(minijinja::context! {
            domain => domain,
            mime_types => &self.layout.mime_types,
            staged => staged,
        })?;

        self.exec
            .write_file(&harness_path, &harness, 0o644, true)
            .await
            .map_err(|e| install_error(domain, e))?;

        let output = self
            .exec
            .run(
                &RemoteCommand::new(format!("nginx -t -c {}", shell_quote(&harness_path)))
                    .elevated()
                    .best_effort(),
            )
            .await?;
        self.exec.remove_file(&harness_path, true).await?;

        if output.success() {
            debug!("Staged route for {} passed the isolated check", domain);
            Ok(Ok(()))
        } else {
            Ok(Err(output.stderr.trim().to_string()))
        }
    }
}

fn install_error(domain: &str, source: RiggerError) -> RiggerError {
    RiggerError::ProxyInstall {
        domain: domain.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::MockExecutor;

    const LIVE: &str = "/etc/nginx/sites-available/sample.example.test.conf";
    const OTHER: &str = "/etc/nginx/sites-available/cigar.example.test.conf";

    fn configurator(exec: &MockExecutor) -> ReverseProxyConfigurator<'_> {
        ReverseProxyConfigurator::new(
            exec,
            ProxyLayout::for_platform(Platform::Systemd, None),
            "/var/www/rigger-acme",
        )
    }

    #[tokio::test]
    async fn configure_writes_live_route_and_reloads() {
        let exec = MockExecutor::new();
        let route = configurator(&exec)
            .configure("sample.example.test", 4000)
            .await
            .unwrap();

        assert!(route.certificate.is_none());
        let content = exec.file(LIVE).unwrap();
        assert!(content.contains("server_name sample.example.test;"));
        assert!(content.contains("server 127.0.0.1:4000;"));
        assert!(content.contains("/.well-known/acme-challenge/"));
        assert!(!content.contains("ssl_certificate"));

        assert!(exec.ran("ln -sfn"));
        let isolated = exec.position("nginx -t -c").unwrap();
        let swap = exec.position(&format!("mv {}{}", LIVE, STAGED_SUFFIX)).unwrap();
        let reload = exec.position("systemctl reload nginx").unwrap();
        assert!(isolated < swap && swap < reload);
        assert!(exec.paths().iter().all(|p| !p.contains("rigger-check")));
    }

    #[tokio::test]
    async fn existing_certificate_is_kept_on_redeploy() {
        let exec = MockExecutor::new();
        exec.seed_file("/etc/letsencrypt/live/sample.example.test/fullchain.pem", "pem");

        let route = configurator(&exec)
            .configure("sample.example.test", 4000)
            .await
            .unwrap();

        assert_eq!(route.scheme(), "https");
        let content = exec.file(LIVE).unwrap();
        // the listen-parameter form is understood by nginx before and after 1.25.1
        let listens: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("listen"))
            .collect();
        assert_eq!(
            listens,
            vec![
                "listen 80;",
                "listen [::]:80;",
                "listen 443 ssl http2;",
                "listen [::]:443 ssl http2;",
            ]
        );
        assert!(!content.lines().any(|l| l.trim().starts_with("http2 ")));
        assert!(content.contains("ssl_certificate /etc/letsencrypt/live/sample.example.test/fullchain.pem;"));
        assert!(content.contains("return 301 https://$host$request_uri;"));
    }

    #[tokio::test]
    async fn isolated_check_failure_leaves_live_and_other_routes_untouched() {
        let exec = MockExecutor::new();
        exec.seed_file(LIVE, "previous route");
        exec.seed_file(OTHER, "cigar route");
        exec.on("nginx -t -c", 1, "", "nginx: [emerg] unknown directive \"proxy_pas\"\n");

        let err = configurator(&exec)
            .configure("sample.example.test", 4000)
            .await
            .unwrap_err();

        match err {
            RiggerError::ProxyConfigInvalid { domain, detail } => {
                assert_eq!(domain, "sample.example.test");
                assert!(detail.contains("unknown directive"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(exec.file(LIVE).unwrap(), "previous route");
        assert_eq!(exec.file(OTHER).unwrap(), "cigar route");
        assert!(exec.file(&format!("{}{}", LIVE, STAGED_SUFFIX)).is_none());
        assert!(!exec.ran("systemctl reload nginx"));
    }

    #[tokio::test]
    async fn full_check_failure_restores_previous_route() {
        let exec = MockExecutor::new();
        exec.seed_file(LIVE, "previous route");
        // The isolated check passes, the full one does not.
        exec.on("nginx -t", 1, "", "nginx: [emerg] duplicate upstream\n");
        exec.respond("nginx -t -c", "");

        let err = configurator(&exec)
            .configure("sample.example.test", 4000)
            .await
            .unwrap_err();

        assert!(matches!(err, RiggerError::ProxyConfigInvalid { .. }));
        assert_eq!(exec.file(LIVE).unwrap(), "previous route");
        assert!(exec.file(&format!("{}{}", LIVE, BACKUP_SUFFIX)).is_none());
        assert!(!exec.ran("systemctl reload nginx"));
    }

    #[tokio::test]
    async fn rendering_is_deterministic() {
        let exec = MockExecutor::new();
        let proxy = configurator(&exec);
        let route = ProxyRoute {
            domain: "sample.example.test".to_string(),
            upstream_port: 4000,
            certificate: Some(CertificateReference::letsencrypt("sample.example.test", true)),
        };
        let first = proxy.render(&route).unwrap();
        assert_eq!(first, proxy.render(&route).unwrap());
        assert!(first.contains("/etc/letsencrypt/live/sample.example.test-staging/privkey.pem"));
        assert!(first.contains("upstream rigger_sample_example_test"));
    }

    #[test]
    fn layouts_follow_platform() {
        let launchd = ProxyLayout::for_platform(Platform::Launchd, None);
        assert_eq!(
            launchd.route_path("a.test"),
            "/opt/homebrew/etc/nginx/servers/a.test.conf"
        );
        assert!(launchd.enabled_path("a.test").is_none());

        let custom = ProxyLayout::for_platform(Platform::Supervisor, Some("/usr/local/nginx"));
        assert_eq!(custom.route_path("a.test"), "/usr/local/nginx/conf.d/a.test.conf");
    }
}
