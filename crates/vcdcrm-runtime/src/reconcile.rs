use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::error::{PlatformResultExt, Result};
use vcdcrm_core::naming::{self, NetworkOwner};
use vcdcrm_core::retry::retry;

use crate::inventory::{Discovered, Inventory};
use crate::platform::{GroupRecord, PlatformClient, ResourceEntity};

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BASE_DELAY: Duration = Duration::from_millis(100);

/// What a resource-pool entry is, decided from its media type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Catalog,
    Template,
    Group,
    Vm,
    Media,
}

/// Classify a resource-pool entry. Unknown tags yield `None`.
pub fn classify(type_tag: &str) -> Option<ResourceKind> {
    let kind = type_tag
        .strip_prefix("application/vnd.vmware.vcloud.")?
        .strip_suffix("+xml")?;
    match kind {
        "network" | "orgNetwork" | "orgVdcNetwork" => Some(ResourceKind::Network),
        "catalog" => Some(ResourceKind::Catalog),
        "vAppTemplate" => Some(ResourceKind::Template),
        "vApp" => Some(ResourceKind::Group),
        "vm" => Some(ResourceKind::Vm),
        "media" => Some(ResourceKind::Media),
        _ => None,
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub networks: usize,
    pub catalogs: usize,
    pub templates: usize,
    pub groups: usize,
    pub vms: usize,
    pub media: usize,
    /// Cluster owners recovered from internal network names.
    pub clusters: Vec<NetworkOwner>,
    /// Entries that could not be fetched: (name, error).
    pub skipped: Vec<(String, String)>,
}

/// Full pull of the resource pool into `inventory`.
///
/// Failing to fetch the org or the resource pool aborts with an error and
/// leaves the inventory untouched. Failures on individual entries are logged
/// and skipped. Not safe to run concurrently with allocation.
#[instrument(skip_all, fields(org = %config.platform.org, vdc = %config.platform.vdc))]
pub fn reconcile(
    client: &dyn PlatformClient,
    inventory: &Inventory,
    config: &OrchestratorConfig,
) -> Result<ReconcileReport> {
    let platform = &config.platform;
    retry(FETCH_ATTEMPTS, FETCH_BASE_DELAY, "fetch org", || {
        client.fetch_org(&platform.org)
    })
    .op("fetch org", &platform.org)?;
    let vdc = retry(FETCH_ATTEMPTS, FETCH_BASE_DELAY, "fetch vdc", || {
        client.fetch_vdc(&platform.org, &platform.vdc)
    })
    .op("fetch vdc", &platform.vdc)?;

    let mut found = Discovered::default();
    let mut report = ReconcileReport::default();

    for entity in &vdc.entities {
        match classify(&entity.type_tag) {
            Some(kind) => discover(client, config, entity, kind, &mut found, &mut report),
            None => debug!(name = %entity.name, tag = %entity.type_tag, "ignoring unknown entity"),
        }
    }

    if !found.networks.contains_key(&platform.external_network) {
        match client.fetch_network(&platform.external_network) {
            Ok(net) => {
                found.networks.insert(net.config.name.clone(), net);
            }
            Err(e) => {
                warn!(network = %platform.external_network, error = %e, "external network not found");
                report
                    .skipped
                    .push((platform.external_network.clone(), e.to_string()));
            }
        }
    }

    report.networks = found.networks.len();
    report.catalogs = found.catalogs.len();
    report.templates = found.templates.len();
    report.groups = found.groups.len();
    report.vms = found.vms.len();
    report.media = found.media.len();

    let hrefs: Vec<(String, String, String)> = if config.orchestrator.vm_href_cache_enabled {
        found
            .vms
            .values()
            .map(|v| (v.group.clone(), v.name.clone(), v.href.clone()))
            .collect()
    } else {
        Vec::new()
    };
    inventory.install(found);
    for (group, name, href) in hrefs {
        inventory.cache_vm_href(&group, &name, &href);
    }

    info!(
        networks = report.networks,
        groups = report.groups,
        clusters = report.clusters.len(),
        vms = report.vms,
        templates = report.templates,
        skipped = report.skipped.len(),
        "reconciliation complete"
    );
    Ok(report)
}

fn discover(
    client: &dyn PlatformClient,
    config: &OrchestratorConfig,
    entity: &ResourceEntity,
    kind: ResourceKind,
    found: &mut Discovered,
    report: &mut ReconcileReport,
) {
    let name = entity.name.clone();
    let mut skip = |err: String| {
        warn!(name = %entity.name, ?kind, error = %err, "skipping inventory entry");
        report.skipped.push((entity.name.clone(), err));
    };

    match kind {
        ResourceKind::Network => match client.fetch_network(&name) {
            Ok(n) => {
                found.networks.insert(name, n);
            }
            Err(e) => skip(e.to_string()),
        },
        ResourceKind::Catalog => match client.fetch_catalog(&name) {
            Ok(c) => {
                found.catalogs.insert(name, c);
            }
            Err(e) => skip(e.to_string()),
        },
        ResourceKind::Template => match client.fetch_template(&config.platform.catalog, &name) {
            Ok(t) => {
                found.templates.insert(name, t);
            }
            Err(e) => skip(e.to_string()),
        },
        ResourceKind::Media => match client.fetch_media(&name) {
            Ok(m) => {
                found.media.insert(name, m);
            }
            Err(e) => skip(e.to_string()),
        },
        ResourceKind::Vm => match client.fetch_vm_by_href(&entity.href) {
            Ok(v) => found.add_vm(v),
            Err(e) => skip(e.to_string()),
        },
        ResourceKind::Group => {
            let group = match client.fetch_group(&name) {
                Ok(g) => g,
                Err(e) => return skip(e.to_string()),
            };
            report
                .clusters
                .extend(cluster_owners(&group, &config.network.internal_net_prefix));
            for vm in &group.vms {
                match client.fetch_vm(&group.name, vm) {
                    Ok(v) => found.add_vm(v),
                    Err(e) => {
                        warn!(group = %group.name, vm = %vm, error = %e, "skipping VM");
                        report.skipped.push((vm.clone(), e.to_string()));
                    }
                }
            }
            found.groups.insert(name, group);
        }
    }
}

/// Owners of the group's internal networks, recovered from their names.
///
/// Isolated networks that do not parse under `prefix` belong to something
/// else and are skipped.
fn cluster_owners(group: &GroupRecord, prefix: &str) -> Vec<NetworkOwner> {
    let mut owners = Vec::new();
    for net in group.networks.iter().filter(|n| n.isolated) {
        let Some(owner) = naming::parse_internal_network_name(prefix, &net.name) else {
            debug!(group = %group.name, network = %net.name, "isolated network is not cluster-owned");
            continue;
        };
        if naming::group_name(&owner.cluster) != group.name {
            warn!(
                group = %group.name,
                network = %net.name,
                cluster = %owner.cluster,
                "internal network names a different cluster"
            );
        }
        owners.push(owner);
    }
    owners
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use vcdcrm_core::error::{Error, PlatformError};
    use vcdcrm_core::vm::{IpAllocationMode, NetworkConnection, PowerState};

    use crate::allocator::{self, ExternalPool};
    use crate::platform::{IpRange, NetworkConfig};
    use crate::platform_mock::MockPlatform;

    fn mock() -> MockPlatform {
        MockPlatform::new()
            .with_external_network(
                "ext-net",
                Ipv4Addr::new(192, 168, 1, 1),
                24,
                IpRange::new(Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 20)),
            )
            .with_media("ubuntu.iso")
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("application/vnd.vmware.vcloud.vApp+xml"),
            Some(ResourceKind::Group)
        );
        assert_eq!(
            classify("application/vnd.vmware.vcloud.vAppTemplate+xml"),
            Some(ResourceKind::Template)
        );
        assert_eq!(
            classify("application/vnd.vmware.vcloud.orgVdcNetwork+xml"),
            Some(ResourceKind::Network)
        );
        assert_eq!(
            classify("application/vnd.vmware.vcloud.vm+xml"),
            Some(ResourceKind::Vm)
        );
        assert_eq!(
            classify("application/vnd.vmware.vcloud.media+xml"),
            Some(ResourceKind::Media)
        );
        assert_eq!(classify("application/vnd.vmware.vcloud.disk+xml"), None);
        assert_eq!(classify("text/plain"), None);
    }

    #[test]
    fn test_reconcile_populates_inventory() {
        let mock = mock()
            .with_vm("g1-vapp", "vm1", PowerState::PoweredOn, vec![])
            .with_vm("g1-vapp", "vm2", PowerState::PoweredOn, vec![]);
        let inv = Inventory::new();
        let report = reconcile(&mock, &inv, &OrchestratorConfig::default()).unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.vms, 2);
        assert_eq!(report.networks, 1);
        assert_eq!(report.templates, 1);
        assert_eq!(report.catalogs, 1);
        assert_eq!(report.media, 1);
        assert!(report.skipped.is_empty());
        assert!(inv.group("g1-vapp").is_some());
        assert!(inv.vm_href("g1-vapp", "vm1").is_some());
    }

    #[test]
    fn test_reconcile_skips_broken_vm() {
        let mut m = mock();
        for i in 0..10 {
            m = m.with_vm("g1-vapp", &format!("vm{}", i), PowerState::PoweredOn, vec![]);
        }
        m.fail_vm_fetch("vm7");
        let inv = Inventory::new();
        let report = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap();
        assert_eq!(report.vms, 9);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "vm7");
        assert!(inv.vm("g1-vapp", "vm7").is_none());
    }

    fn static_ext(addr: Ipv4Addr) -> Vec<NetworkConnection> {
        vec![NetworkConnection {
            network: "ext-net".to_string(),
            index: 0,
            mode: IpAllocationMode::Manual,
            address: Some(addr),
            primary: true,
        }]
    }

    #[test]
    fn test_reconcile_keeps_same_named_vms_of_different_groups() {
        let m = MockPlatform::new()
            .with_external_network(
                "ext-net",
                Ipv4Addr::new(192, 168, 1, 1),
                24,
                IpRange::new(Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 11)),
            )
            .with_vm(
                "a-vapp",
                "lb",
                PowerState::PoweredOn,
                static_ext(Ipv4Addr::new(192, 168, 1, 10)),
            )
            .with_vm(
                "b-vapp",
                "lb",
                PowerState::PoweredOn,
                static_ext(Ipv4Addr::new(192, 168, 1, 11)),
            );
        let inv = Inventory::new();
        let report = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.vms, 2);
        assert!(inv.vm("a-vapp", "lb").is_some());
        assert!(inv.vm("b-vapp", "lb").is_some());

        let pool = ExternalPool::from_network(&inv.network("ext-net").unwrap().config);
        let next = inv.read(|st| allocator::next_external_address(st, &pool));
        assert!(matches!(next, Err(Error::PoolExhausted { .. })));
    }

    #[test]
    fn test_reconcile_recovers_cluster_owners() {
        let m = mock().with_vm("clust1-vapp", "m", PowerState::PoweredOn, vec![]);
        let owned = NetworkConfig {
            name: "mex-k8s-subnet-cld1-clust1-acme".to_string(),
            gateway: Ipv4Addr::new(10, 101, 1, 1),
            prefix: 24,
            ranges: vec![],
            dns: vec![],
            isolated: true,
        };
        let unmanaged = NetworkConfig {
            name: "scratch".to_string(),
            ..owned.clone()
        };
        m.create_group_network("clust1-vapp", &owned).unwrap();
        m.create_group_network("clust1-vapp", &unmanaged).unwrap();

        let inv = Inventory::new();
        let report = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap();
        assert_eq!(report.clusters, vec![NetworkOwner::new("cld1", "clust1", "acme")]);
    }

    #[test]
    fn test_reconcile_missing_vdc_is_fatal() {
        let mut config = OrchestratorConfig::default();
        config.platform.vdc = "nope".to_string();
        let inv = Inventory::new();
        let err = reconcile(&mock(), &inv, &config).unwrap_err();
        assert!(err.is_not_found());
        assert!(inv.snapshot().reconciled_at.is_none());
    }

    #[test]
    fn test_reconcile_retries_transient_vdc_failure() {
        let m = mock();
        m.fail_next("fetch_vdc", PlatformError::api("session expired"));
        let inv = Inventory::new();
        assert!(reconcile(&m, &inv, &OrchestratorConfig::default()).is_ok());
    }

    #[test]
    fn test_reconcile_gives_up_on_persistent_org_failure() {
        let m = mock();
        for _ in 0..FETCH_ATTEMPTS {
            m.fail_next("fetch_org", PlatformError::api("auth failure"));
        }
        let inv = Inventory::new();
        let err = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Platform { op: "fetch org", .. }));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let m = mock().with_vm("g1-vapp", "vm1", PowerState::PoweredOn, vec![]);
        let inv = Inventory::new();
        let first = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap();
        let second = reconcile(&m, &inv, &OrchestratorConfig::default()).unwrap();
        assert_eq!(first, second);
    }
}
