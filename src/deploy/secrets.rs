//! Deliver an application's secrets to its process environment.

use tracing::info;

use crate::error::Result;
use crate::registry::ApplicationDescriptor;
use crate::secrets::SecretSource;
use crate::service::{InstalledUnit, ServiceUnitManager};

pub struct SecretsDeployer<'a> {
    source: &'a dyn SecretSource,
    units: &'a ServiceUnitManager<'a>,
}

impl<'a> SecretsDeployer<'a> {
    pub fn new(source: &'a dyn SecretSource, units: &'a ServiceUnitManager<'a>) -> Self {
        Self { source, units }
    }

    /// Install a unit carrying the current secrets without restarting.
    ///
    /// The bundle is fetched before anything is written, so an incomplete
    /// bundle leaves the installed unit and the running process as they were.
    pub async fn inject(&self, app: &ApplicationDescriptor) -> Result<InstalledUnit> {
        let bundle = self.source.get_all(&app.key, &app.required_secrets)?;
        info!("Fetched {} secrets for {}", bundle.len(), bundle.app());
        self.units.render_and_install(app, &bundle).await
    }

    /// Inject and restart so the running process picks up the new values.
    pub async fn deploy(&self, app: &ApplicationDescriptor) -> Result<InstalledUnit> {
        let installed = self.inject(app).await?;
        self.units.restart(app).await?;
        Ok(installed)
    }
}
