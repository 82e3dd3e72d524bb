use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::RiggerConfig;
use crate::exec::local::LocalExecutor;
use crate::exec::ssh::SshExecutor;
use crate::exec::Executor;
use crate::os::Platform;
use crate::output;
use crate::proxy::ProxyLayout;

/// An open command channel to one host plus what was resolved about it.
pub struct Target {
    pub exec: Arc<dyn Executor>,
    pub platform: Platform,
    pub proxy_layout: ProxyLayout,
}

impl Target {
    /// Connect to `host_name` (or this machine with `local`) and settle the
    /// platform, detecting it when the config does not pin one.
    pub async fn open(config: &RiggerConfig, host_name: &str, local: bool) -> Result<Self> {
        let host = config.host(host_name)?;

        let exec: Arc<dyn Executor> = if local {
            Arc::new(LocalExecutor::new())
        } else {
            let spinner = output::create_spinner(&format!("Connecting to {}...", host.address));
            let session = SshExecutor::connect(host, Duration::from_secs(config.deploy.connect_timeout)).await;
            spinner.finish_and_clear();
            Arc::new(session.with_context(|| format!("Failed to connect to {}", host.address))?)
        };

        let platform = Platform::resolve(host.platform.as_deref(), exec.as_ref())
            .await
            .with_context(|| format!("Failed to determine the platform of {}", exec.host()))?;
        let proxy_layout = ProxyLayout::for_platform(platform, host.nginx_dir.as_deref());

        tracing::info!("{} runs {}", exec.host(), platform);

        Ok(Self {
            exec,
            platform,
            proxy_layout,
        })
    }
}
