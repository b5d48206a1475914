use serde::Serialize;
use tracing::{debug, instrument};

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::error::{Error, PlatformResultExt, Result};

use crate::allocator::ExternalPool;
use crate::inventory::Inventory;
use crate::platform::PlatformClient;

/// Normalized quota view of the VDC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResourceUsage {
    pub vcpu_used: u64,
    pub vcpu_max: u64,
    pub mem_used_mb: u64,
    pub mem_max_mb: u64,
    pub external_ips_used: u32,
    pub external_ips_max: u32,
    pub instances_used: u32,
    pub instances_max: u32,
    pub storage_used_gb: u64,
    pub storage_max_gb: u64,
}

/// vCPU speed used to turn MHz counters into vCPU counts.
fn cpu_speed_mhz(client: &dyn PlatformClient, config: &OrchestratorConfig) -> Result<u64> {
    if let Some(mhz) = config.cpu_speed_override() {
        return Ok(mhz);
    }
    let vdc = &config.platform.vdc;
    match client
        .admin_cpu_speed_mhz(vdc)
        .op("fetch admin vdc", vdc)?
    {
        Some(mhz) if mhz > 0 => Ok(mhz),
        _ => Err(Error::invalid_state(
            vdc.as_str(),
            "vcpu speed in admin metadata or override",
            "none",
        )),
    }
}

/// Read capacity counters and external address usage.
///
/// Nothing is written to the inventory or the platform. A missing CPU speed
/// fails the whole call rather than returning partial counters.
#[instrument(skip_all)]
pub fn get_resource_usage(
    client: &dyn PlatformClient,
    inventory: &Inventory,
    config: &OrchestratorConfig,
) -> Result<ResourceUsage> {
    let speed = cpu_speed_mhz(client, config)?;
    let vdc = client
        .fetch_vdc(&config.platform.org, &config.platform.vdc)
        .op("fetch vdc", &config.platform.vdc)?;
    let cap = vdc.capacity;

    let ext_name = &config.platform.external_network;
    let pool = match inventory.network(ext_name) {
        Some(net) => ExternalPool::from_network(&net.config),
        None => {
            let net = client
                .fetch_network(ext_name)
                .op("fetch network", ext_name)?;
            ExternalPool::from_network(&net.config)
        }
    };

    let records = client
        .query_vm_records()
        .op("query vms", &config.platform.vdc)?;
    let deployed = records.iter().filter(|r| r.deployed);
    let external_ips_used = deployed
        .clone()
        .filter(|r| &r.network_name == ext_name)
        .count() as u32;
    let instances_used = deployed.count() as u32;

    let usage = ResourceUsage {
        vcpu_used: cap.cpu_used_mhz / speed,
        vcpu_max: cap.cpu_limit_mhz / speed,
        mem_used_mb: cap.mem_used_mb,
        mem_max_mb: cap.mem_limit_mb,
        external_ips_used,
        external_ips_max: pool.capacity(),
        instances_used,
        instances_max: cap.vm_quota,
        storage_used_gb: cap.storage_used_mb / 1024,
        storage_max_gb: cap.storage_limit_mb / 1024,
    };
    debug!(?usage, speed, "resource usage");
    Ok(usage)
}
