//! Process-level wiring: config, inventory, initial reconcile, orchestrator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::credentials::{CredentialKey, CredentialProvider, Credentials};
use vcdcrm_runtime::accounting::{self, ResourceUsage};
use vcdcrm_runtime::inventory::Inventory;
use vcdcrm_runtime::orchestrator::Orchestrator;
use vcdcrm_runtime::platform::PlatformClient;

/// A running engine bound to one cloudlet's platform account.
pub struct Engine {
    orchestrator: Orchestrator,
}

impl Engine {
    /// Load config from `path` and start against `client`.
    pub fn from_config_file(path: &Path, client: Arc<dyn PlatformClient>) -> Result<Self> {
        let config = OrchestratorConfig::from_file(path)?;
        Self::start(config, client)
    }

    /// Build the orchestrator and run the startup reconciliation.
    ///
    /// The inventory is not persisted, so every start rebuilds it from the
    /// platform; a failed reconcile aborts startup.
    pub fn start(config: OrchestratorConfig, client: Arc<dyn PlatformClient>) -> Result<Self> {
        let orchestrator = Orchestrator::new(client, Arc::new(Inventory::new()), config)?;
        let report = orchestrator
            .reconcile()
            .context("Initial inventory reconciliation failed")?;
        info!(
            groups = report.groups,
            vms = report.vms,
            networks = report.networks,
            skipped = report.skipped.len(),
            "engine started"
        );
        Ok(Self { orchestrator })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Quota view of the VDC.
    pub fn resource_usage(&self) -> Result<ResourceUsage> {
        let o = &self.orchestrator;
        accounting::get_resource_usage(o.client(), o.inventory(), o.config())
            .context("Failed to compute resource usage")
    }
}

/// Look up this cloudlet's platform credentials through `provider`.
///
/// The key is derived from the configured region and org plus the
/// cloudlet's physical name.
pub fn load_credentials(
    provider: &dyn CredentialProvider,
    config: &OrchestratorConfig,
    physical_name: &str,
) -> Result<Credentials> {
    let key = CredentialKey::new(&config.platform.region, &config.platform.org, physical_name);
    provider
        .get_credentials(&key)
        .with_context(|| format!("Failed to load credentials from {}", key.vault_path()))
}
