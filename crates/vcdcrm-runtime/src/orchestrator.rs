use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::context::OpContext;
use vcdcrm_core::error::{Error, ObjectKind, PlatformResultExt, Result, ok_if_exists};
use vcdcrm_core::retry::poll_until;
use vcdcrm_core::spec::{VmGroupSpec, VmSpec};
use vcdcrm_core::vm::{
    GroupResources, LifecycleState, PowerAction, PowerState, ServerAddress, ServerDetail,
    ServerStatus, VmResource, validate_transition,
};

use crate::allocator::InternalCidrParams;
use crate::guest;
use crate::inventory::{Inventory, vm_key};
use crate::platform::{
    ComposeRequest, GroupRecord, PlatformClient, PlatformResult, TaskHandle, TemplateRecord,
    VmRecord, await_task,
};
use crate::reconcile::{self, ReconcileReport};
use crate::topology::{InternalNetwork, TopologyManager};

/// Realizes VM groups on the platform and keeps the inventory in step.
pub struct Orchestrator {
    client: Arc<dyn PlatformClient>,
    inventory: Arc<Inventory>,
    config: OrchestratorConfig,
    cidr_params: InternalCidrParams,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        inventory: Arc<Inventory>,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let cidr_params = InternalCidrParams::from_config(&config)?;
        Ok(Self {
            client,
            inventory,
            config,
            cidr_params,
        })
    }

    pub fn client(&self) -> &dyn PlatformClient {
        self.client.as_ref()
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn topology(&self) -> TopologyManager<'_> {
        TopologyManager {
            client: self.client.as_ref(),
            inventory: &self.inventory,
            config: &self.config,
            params: &self.cidr_params,
        }
    }

    /// Refresh the inventory from the platform.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        reconcile::reconcile(self.client.as_ref(), &self.inventory, &self.config)
    }

    fn run(
        &self,
        ctx: &OpContext,
        op: &'static str,
        object: &str,
        submit: impl FnOnce() -> PlatformResult<TaskHandle>,
    ) -> Result<()> {
        await_task(
            self.client.as_ref(),
            ctx,
            self.config.task_poll_policy(),
            op,
            object,
            submit,
        )
    }

    fn resolve_template(&self) -> Result<TemplateRecord> {
        let name = &self.config.platform.template;
        if let Some(t) = self.inventory.template(name) {
            return Ok(t);
        }
        let t = self
            .client
            .fetch_template(&self.config.platform.catalog, name)
            .op("fetch template", name)?;
        self.inventory.upsert_template(t.clone());
        Ok(t)
    }

    fn fetch_group(&self, group: &str) -> Result<GroupRecord> {
        let rec = self.client.fetch_group(group).op("fetch group", group)?;
        self.inventory.upsert_group(rec.clone());
        Ok(rec)
    }

    /// Fetch a VM, through the href cache when it is enabled.
    fn fetch_vm(&self, group: &str, name: &str) -> Result<VmRecord> {
        let cache = self.config.orchestrator.vm_href_cache_enabled;
        if cache && let Some(href) = self.inventory.vm_href(group, name) {
            match self.client.fetch_vm_by_href(&href) {
                Ok(vm) if vm.group == group && vm.name == name => {
                    self.inventory.upsert_vm(vm.clone());
                    return Ok(vm);
                }
                Ok(_) | Err(_) => {
                    debug!(group, vm = name, "stale href cache entry");
                    self.inventory.forget_vm_href(group, name);
                }
            }
        }
        let vm = self
            .client
            .fetch_vm(group, name)
            .op("fetch vm", &vm_key(group, name))?;
        if cache {
            self.inventory.cache_vm_href(&vm.group, &vm.name, &vm.href);
        }
        self.inventory.upsert_vm(vm.clone());
        Ok(vm)
    }

    /// Resolve `group/name`, or a bare name, to its `(group, name)` pair.
    ///
    /// A bare name must be unique across the cached groups; otherwise the
    /// caller gets `Ambiguous` and has to qualify it.
    fn locate_vm(&self, name: &str) -> Result<(String, String)> {
        if let Some((group, vm)) = name.split_once('/') {
            return Ok((group.to_string(), vm.to_string()));
        }
        let mut groups: Vec<String> = self
            .inventory
            .vms_named(name)
            .into_iter()
            .map(|v| v.group)
            .collect();
        match groups.len() {
            0 => Err(Error::NotFound {
                kind: ObjectKind::Vm,
                name: name.to_string(),
            }),
            1 => Ok((groups.remove(0), name.to_string())),
            _ => Err(Error::Ambiguous {
                kind: ObjectKind::Vm,
                name: name.to_string(),
                groups,
            }),
        }
    }

    /// Block until the group is resolved; customization is rejected before that.
    fn wait_resolved(&self, ctx: &OpContext, group: &str) -> Result<GroupRecord> {
        poll_until(
            ctx,
            self.config.task_poll_policy(),
            &format!("resolve {}", group),
            || {
                let rec = self.fetch_group(group)?;
                Ok(rec.status.is_resolved().then_some(rec))
            },
        )
    }

    /// Add requested VMs that the group does not have yet; returns their names.
    fn add_missing_vms(
        &self,
        ctx: &OpContext,
        group: &GroupRecord,
        template: &TemplateRecord,
        spec: &VmGroupSpec,
    ) -> Result<Vec<String>> {
        let existing: HashSet<&str> = group.vms.iter().map(String::as_str).collect();
        let missing: Vec<String> = spec
            .vms
            .iter()
            .filter(|vm| !existing.contains(vm.name.as_str()))
            .map(|vm| vm.name.clone())
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }
        info!(group = %group.name, vms = ?missing, "adding VMs to group");
        ok_if_exists(self.run(ctx, "add vms", &group.name, || {
            self.client.add_vms(&group.name, &template.href, &missing)
        }))?;
        self.wait_resolved(ctx, &group.name)?;
        Ok(missing)
    }

    fn master_address(
        &self,
        spec: &VmGroupSpec,
        internal: Option<&InternalNetwork>,
    ) -> Result<Option<Ipv4Addr>> {
        match (spec.master_octet(), internal) {
            (Some(octet), Some(net)) => net.cidr.address_for_octet(octet).map(Some),
            _ => Ok(None),
        }
    }

    /// Networks, compute, metadata, then guest properties for one VM.
    fn customize_vm(
        &self,
        ctx: &OpContext,
        group: &str,
        spec: &VmSpec,
        internal: Option<&InternalNetwork>,
        master_ip: Option<Ipv4Addr>,
    ) -> Result<VmRecord> {
        let vm = self.fetch_vm(group, &spec.name)?;
        if !vm.status.is_resolved() {
            return Err(Error::invalid_state(&vm.name, "resolved", &vm.status));
        }
        let guest_cfg = guest::guest_config(spec, &vm.id, master_ip)?;

        self.topology()
            .connect_vm(ctx, group, &vm, spec, internal)?;

        let boot_unit = vm.disks.first().map(|d| d.unit).unwrap_or_default();
        let update = guest::compute_update(spec, boot_unit, self.config.orchestrator.enable_disk_resize);
        self.run(ctx, "update compute", &vm.name, || {
            self.client.update_vm_compute(group, &vm.name, &update)
        })?;
        self.run(ctx, "set metadata", &vm.name, || {
            self.client
                .set_vm_metadata(group, &vm.name, &guest::vm_metadata(spec))
        })?;
        self.run(ctx, "set guest properties", &vm.name, || {
            self.client.set_vm_guest(group, &vm.name, &guest_cfg)
        })?;
        if self.config.platform.verbose {
            debug!(vm = %vm.name, ?guest_cfg, ?update, "customized VM");
        }
        self.fetch_vm(group, &spec.name)
    }

    /// Power on each listed VM, then the group, then wait for all of them.
    fn power_on(&self, ctx: &OpContext, group: &str, names: &[String]) -> Result<()> {
        for name in names {
            let vm = self.fetch_vm(group, name)?;
            if vm.status.is_powered_on() {
                continue;
            }
            validate_transition(name, LifecycleState::from(&vm.status), LifecycleState::PoweringOn)?;
            if let Err(e) = self.run(ctx, "power on vm", name, || {
                self.client.power_on_vm(group, name, true)
            }) {
                warn!(group, vm = %name, error = %e, "VM power on failed, continuing with group");
            }
        }

        if !self.fetch_group(group)?.status.is_powered_on() {
            self.run(ctx, "power on group", group, || self.client.power_on_group(group))?;
        }
        self.wait_powered_on(ctx, group, names)
    }

    /// Poll until every listed VM reports powered on.
    fn wait_powered_on(&self, ctx: &OpContext, group: &str, names: &[String]) -> Result<()> {
        poll_until(
            ctx,
            self.config.power_on_poll_policy(),
            &format!("power on {}", group),
            || {
                for name in names {
                    if !self.fetch_vm(group, name)?.status.is_powered_on() {
                        return Ok(None);
                    }
                }
                Ok(Some(()))
            },
        )?;
        self.fetch_group(group)?;
        Ok(())
    }

    /// Compose a group from the template and bring every VM up.
    ///
    /// Re-running with the same spec converges: existing objects are reused
    /// and running VMs are not power-cycled.
    #[instrument(skip_all, fields(group = %spec.group_name()))]
    pub fn create_group(&self, ctx: &OpContext, spec: &VmGroupSpec) -> Result<()> {
        spec.validate()?;
        let group = spec.group_name();
        let template = self.resolve_template()?;
        let names: Vec<String> = spec.vms.iter().map(|v| v.name.clone()).collect();

        let request = ComposeRequest {
            group: group.clone(),
            description: format!("{} / {} / {}", spec.cloudlet, spec.cluster, spec.org),
            template_href: template.href.clone(),
            vm_names: names.clone(),
        };
        let composed = self.run(ctx, "compose group", &group, || {
            self.client.compose_group(&request)
        });
        match composed {
            Ok(()) => info!(group = %group, vms = names.len(), "group composed"),
            Err(e) if e.is_already_exists() => info!(group = %group, "group exists, reusing"),
            Err(e) => return Err(e),
        }

        let rec = self.wait_resolved(ctx, &group)?;
        self.add_missing_vms(ctx, &rec, &template, spec)?;

        let internal = if spec.needs_internal_network() {
            Some(self.topology().ensure_internal_network(ctx, &group, &spec.owner())?)
        } else {
            None
        };
        let master_ip = self.master_address(spec, internal.as_ref())?;

        for vm in &spec.vms {
            self.customize_vm(ctx, &group, vm, internal.as_ref(), master_ip)?;
        }

        self.power_on(ctx, &group, &names)?;
        info!(group = %group, vms = names.len(), "group powered on");
        Ok(())
    }

    /// Add requested VMs and reapply compute/metadata to existing ones.
    ///
    /// VMs present in the group but absent from `spec` are left alone; use
    /// [`Orchestrator::remove_vms`] to delete them.
    #[instrument(skip_all, fields(group = %spec.group_name()))]
    pub fn update_group(&self, ctx: &OpContext, spec: &VmGroupSpec) -> Result<()> {
        spec.validate()?;
        let group = spec.group_name();
        let rec = self.fetch_group(&group)?;
        let rec = if rec.status.is_resolved() {
            rec
        } else {
            self.wait_resolved(ctx, &group)?
        };
        let template = self.resolve_template()?;

        let requested: HashSet<&str> = spec.vms.iter().map(|v| v.name.as_str()).collect();
        let untouched: Vec<&String> = rec
            .vms
            .iter()
            .filter(|n| !requested.contains(n.as_str()))
            .collect();
        if !untouched.is_empty() {
            info!(group = %group, vms = ?untouched, "VMs not in request are left in place");
        }

        let added = self.add_missing_vms(ctx, &rec, &template, spec)?;

        let internal = if spec.needs_internal_network() {
            Some(self.topology().ensure_internal_network(ctx, &group, &spec.owner())?)
        } else {
            None
        };
        let master_ip = self.master_address(spec, internal.as_ref())?;

        for vm in &spec.vms {
            self.customize_vm(ctx, &group, vm, internal.as_ref(), master_ip)?;
        }

        if !added.is_empty() {
            self.power_on(ctx, &group, &added)?;
        }
        info!(group = %group, added = added.len(), "group updated");
        Ok(())
    }

    /// Delete individual VMs from a group, powering them down first.
    ///
    /// VMs that are already gone are skipped.
    #[instrument(skip_all, fields(group = %group))]
    pub fn remove_vms(&self, ctx: &OpContext, group: &str, names: &[String]) -> Result<()> {
        for name in names {
            let vm = match self.fetch_vm(group, name) {
                Ok(vm) => vm,
                Err(e) if e.is_not_found() => {
                    warn!(vm = %name, "VM already gone");
                    self.inventory.remove_vm(group, name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if vm.status.is_powered_on() {
                self.run(ctx, "undeploy vm", name, || self.client.undeploy_vm(group, name))?;
            }
            self.run(ctx, "delete vm", name, || self.client.delete_vm(group, name))?;
            self.inventory.remove_vm(group, name);
            info!(vm = %name, "VM removed");
        }
        self.fetch_group(group)?;
        Ok(())
    }

    /// Undeploy (if running) and delete a group, then release what it held.
    ///
    /// A group that no longer exists counts as deleted.
    #[instrument(skip_all, fields(group = %group))]
    pub fn delete_group(&self, ctx: &OpContext, group: &str) -> Result<()> {
        let rec = match self.fetch_group(group) {
            Ok(rec) => rec,
            Err(e) if e.is_not_found() => {
                info!(group, "group not found, nothing to delete");
                self.inventory.release_group(group);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if is_running(&rec.status) {
            self.run(ctx, "undeploy group", group, || self.client.undeploy_group(group))?;
            for name in &rec.vms {
                match self.client.fetch_vm(group, name) {
                    Ok(vm) if vm.status.is_powered_on() => {
                        if let Err(e) =
                            self.run(ctx, "undeploy vm", name, || self.client.undeploy_vm(group, name))
                        {
                            warn!(vm = %name, error = %e, "VM undeploy failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(vm = %name, error = %e, "could not check VM before delete"),
                }
            }
        } else {
            debug!(group, status = %rec.status, "group not running, skipping undeploy");
        }

        if !rec.networks.is_empty()
            && let Err(e) = self.run(ctx, "remove group networks", group, || {
                self.client.remove_all_group_networks(group)
            })
        {
            warn!(group, error = %e, "removing group networks failed");
        }

        self.run(ctx, "delete group", group, || self.client.delete_group(group))?;
        self.inventory.release_group(group);
        info!(group, "group deleted");
        Ok(())
    }

    /// Power on every VM of a group and wait until all of them run.
    ///
    /// Fails with `InvalidState` when the group is already powered on or
    /// not resolved yet.
    #[instrument(skip_all, fields(group = %group))]
    pub fn start_group(&self, ctx: &OpContext, group: &str) -> Result<()> {
        let rec = self.fetch_group(group)?;
        validate_transition(group, LifecycleState::from(&rec.status), LifecycleState::PoweringOn)?;
        self.run(ctx, "power on group", group, || self.client.power_on_group(group))?;
        self.wait_powered_on(ctx, group, &rec.vms)?;
        info!(group, vms = rec.vms.len(), "group started");
        Ok(())
    }

    /// Undeploy a running group; its VMs, networks and addresses are kept.
    #[instrument(skip_all, fields(group = %group))]
    pub fn stop_group(&self, ctx: &OpContext, group: &str) -> Result<()> {
        let rec = self.fetch_group(group)?;
        if !is_running(&rec.status) {
            return Err(Error::invalid_state(group, "powered on", &rec.status));
        }
        self.run(ctx, "undeploy group", group, || self.client.undeploy_group(group))?;
        self.fetch_group(group)?;
        info!(group, "group stopped");
        Ok(())
    }

    /// Stop then start a running group.
    #[instrument(skip_all, fields(group = %group))]
    pub fn restart_group(&self, ctx: &OpContext, group: &str) -> Result<()> {
        self.stop_group(ctx, group)?;
        self.start_group(ctx, group)
    }

    /// Start, stop, or reboot a single VM.
    ///
    /// `vm_name` is either `group/name` or a bare name used by exactly one
    /// group. Start on a running VM and Stop on a stopped one fail with
    /// `InvalidState` before any platform call; Reboot requires a running VM.
    #[instrument(skip_all, fields(vm = %vm_name, %action))]
    pub fn set_power_state(&self, ctx: &OpContext, vm_name: &str, action: PowerAction) -> Result<()> {
        let (group, name) = self.locate_vm(vm_name)?;
        let vm = self.fetch_vm(&group, &name)?;
        let on = vm.status.is_powered_on();
        let power_on = || self.client.power_on_vm(&group, &name, false);
        let power_off = || self.client.power_off_vm(&group, &name);

        match action {
            PowerAction::Start => {
                if on {
                    return Err(Error::invalid_state(vm_name, "powered off", &vm.status));
                }
                self.run(ctx, "power on vm", &name, power_on)?;
            }
            PowerAction::Stop => {
                if !on {
                    return Err(Error::invalid_state(vm_name, "powered on", &vm.status));
                }
                self.run(ctx, "power off vm", &name, power_off)?;
            }
            PowerAction::Reboot => {
                if !on {
                    return Err(Error::invalid_state(vm_name, "powered on", &vm.status));
                }
                self.run(ctx, "power off vm", &name, power_off)?;
                self.run(ctx, "power on vm", &name, power_on)?;
            }
        }
        self.fetch_vm(&group, &name)?;
        info!(group = %group, vm = %name, %action, "power state changed");
        Ok(())
    }

    /// Status and addresses of a logical server, by `group/name` or bare name.
    ///
    /// Fails with `NotFound` when the server or its group no longer exists,
    /// so callers can create instead of retrying.
    pub fn get_server_detail(&self, name: &str) -> Result<ServerDetail> {
        let (group, vm_name) = self.locate_vm(name)?;
        let vm = self.fetch_vm(&group, &vm_name).inspect_err(|e| {
            if e.is_not_found() {
                self.inventory.remove_vm(&group, &vm_name);
            }
        })?;
        Ok(ServerDetail {
            name: vm.name.clone(),
            id: vm.id.clone(),
            status: ServerStatus::from(&vm.status),
            addresses: server_addresses(&vm),
        })
    }

    /// Flavor, role, status and addresses of every VM in a group.
    pub fn get_group_resources(&self, group: &str) -> Result<GroupResources> {
        let rec = self.fetch_group(group)?;
        let mut vms = Vec::with_capacity(rec.vms.len());
        for name in &rec.vms {
            let vm = self.fetch_vm(group, name)?;
            vms.push(VmResource {
                name: vm.name.clone(),
                flavor: vm.metadata.get(guest::META_FLAVOR).cloned(),
                role: vm.metadata.get(guest::META_ROLE).cloned(),
                status: ServerStatus::from(&vm.status),
                addresses: server_addresses(&vm),
            });
        }
        Ok(GroupResources {
            group: rec.name,
            vms,
        })
    }
}

/// Anything but cleanly stopped counts as running and needs an undeploy.
fn is_running(status: &PowerState) -> bool {
    matches!(
        status,
        PowerState::PoweredOn | PowerState::Suspended | PowerState::Unknown(_)
    )
}

fn server_addresses(vm: &VmRecord) -> Vec<ServerAddress> {
    vm.connections
        .iter()
        .filter_map(|c| {
            c.address.map(|address| ServerAddress {
                network: c.network.clone(),
                address,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use vcdcrm_core::spec::{PortSpec, Role};
    use vcdcrm_core::vm::IpAllocationMode;

    use crate::platform::IpRange;
    use crate::platform_mock::{MockPlatform, fast_config, group_spec, vm_spec};

    fn setup(last: u8) -> (Arc<MockPlatform>, Orchestrator) {
        let mock = Arc::new(MockPlatform::new().with_external_network(
            "ext-net",
            Ipv4Addr::new(192, 168, 1, 1),
            24,
            IpRange::new(
                Ipv4Addr::new(192, 168, 1, 10),
                Ipv4Addr::new(192, 168, 1, last),
            ),
        ));
        let client: Arc<dyn PlatformClient> = mock.clone();
        let orch = Orchestrator::new(client, Arc::new(Inventory::new()), fast_config()).unwrap();
        (mock, orch)
    }

    fn cluster(name: &str) -> VmGroupSpec {
        group_spec(
            "cld1",
            name,
            vec![
                vm_spec("lb", Role::Agent, vec![PortSpec::external()]),
                vm_spec("m", Role::Master, vec![PortSpec::internal(Some(10))]),
                vm_spec("w1", Role::K8sNode, vec![PortSpec::internal(None)]),
            ],
        )
    }

    fn addr(mock: &MockPlatform, group: &str, vm: &str, net: &str) -> Option<Ipv4Addr> {
        mock.vm(group, vm)?
            .connections
            .iter()
            .find(|c| c.network == net)
            .and_then(|c| c.address)
    }

    #[test]
    fn test_create_group_wires_networks_and_powers_on() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();

        let g = mock.group("clust1-vapp").unwrap();
        assert_eq!(g.status, PowerState::PoweredOn);
        let internal = "mex-k8s-subnet-cld1-clust1-acme";
        assert!(g.networks.iter().any(|n| n.name == "ext-net"));
        assert!(g.networks.iter().any(|n| n.name == internal));

        assert_eq!(
            addr(&mock, "clust1-vapp", "lb", "ext-net"),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(
            addr(&mock, "clust1-vapp", "m", internal),
            Some(Ipv4Addr::new(10, 101, 1, 10))
        );
        let w1 = addr(&mock, "clust1-vapp", "w1", internal).unwrap();
        assert_ne!(w1, Ipv4Addr::new(10, 101, 1, 10));
        assert_ne!(w1, Ipv4Addr::new(10, 101, 1, 1));

        let w1 = mock.vm("clust1-vapp", "w1").unwrap();
        assert_eq!(w1.guest_properties["k8smaster"], "10.101.1.10");
        assert_eq!(w1.guest_properties["skipk8s"], "no");
        assert_eq!(w1.metadata["vmType"], "cluster-k8s-node");
        assert_eq!(w1.vcpus, 2);
        assert_eq!(w1.computer_name.as_deref(), Some("w1"));
    }

    #[test]
    fn test_create_group_customizes_before_power_on() {
        let (mock, orch) = setup(20);
        orch.create_group(&OpContext::background(), &cluster("clust1"))
            .unwrap();
        let guest = mock.call_index("set_vm_guest clust1-vapp/w1").unwrap();
        let power = mock.call_index("power_on_vm").unwrap();
        assert!(guest < power);
    }

    #[test]
    fn test_create_group_is_idempotent() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        let spec = cluster("clust1");
        orch.create_group(&ctx, &spec).unwrap();
        let lb = addr(&mock, "clust1-vapp", "lb", "ext-net");
        mock.clear_calls();

        orch.create_group(&ctx, &spec).unwrap();
        let calls = mock.calls();
        assert!(!calls.iter().any(|c| c.starts_with("power_on")));
        assert!(!calls.iter().any(|c| c.starts_with("create_group_network")));
        assert!(!calls.iter().any(|c| c.starts_with("add_vms")));
        assert_eq!(addr(&mock, "clust1-vapp", "lb", "ext-net"), lb);
        assert_eq!(mock.group("clust1-vapp").unwrap().vms.len(), 3);
    }

    #[test]
    fn test_create_group_waits_for_resolution() {
        let (mock, orch) = setup(20);
        mock.resolve_after("clust1-vapp", 3);
        orch.create_group(&OpContext::background(), &cluster("clust1"))
            .unwrap();
        assert_eq!(
            mock.group("clust1-vapp").unwrap().status,
            PowerState::PoweredOn
        );
    }

    #[test]
    fn test_create_group_resolve_timeout() {
        let (mock, orch) = setup(20);
        mock.resolve_after("clust1-vapp", 1000);
        let err = orch
            .create_group(&OpContext::background(), &cluster("clust1"))
            .unwrap_err();
        match err {
            Error::Timeout { what, .. } => assert!(what.starts_with("resolve")),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(mock.call_index("set_vm").is_none());
    }

    #[test]
    fn test_create_group_power_on_timeout() {
        let (mock, mut orch) = setup(20);
        orch.config.orchestrator.power_on_max_attempts = 3;
        mock.refuse_power_on("w1");
        let err = orch
            .create_group(&OpContext::background(), &cluster("clust1"))
            .unwrap_err();
        match err {
            Error::Timeout { what, .. } => assert!(what.starts_with("power on")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_create_group_cancelled() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        ctx.cancel();
        let err = orch.create_group(&ctx, &cluster("clust1")).unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(mock.calls().is_empty());
        assert!(mock.group("clust1-vapp").is_none());
    }

    #[test]
    fn test_create_group_rejects_invalid_spec() {
        let (mock, orch) = setup(20);
        let spec = group_spec("cld1", "bad_name", vec![vm_spec("a", Role::DockerNode, vec![])]);
        let err = orch
            .create_group(&OpContext::background(), &spec)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_external_pool_exhaustion() {
        let (mock, orch) = setup(11);
        let ctx = OpContext::background();
        let gw = |c: &str| group_spec("cld1", c, vec![vm_spec("lb", Role::Agent, vec![PortSpec::external()])]);
        orch.create_group(&ctx, &gw("a")).unwrap();
        orch.create_group(&ctx, &gw("b")).unwrap();
        let err = orch.create_group(&ctx, &gw("c")).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert_ne!(
            addr(&mock, "a-vapp", "lb", "ext-net"),
            addr(&mock, "b-vapp", "lb", "ext-net")
        );
    }

    #[test]
    fn test_update_group_adds_vm_without_cycling_existing() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        let mut spec = group_spec(
            "cld1",
            "app1",
            vec![vm_spec("lb", Role::Agent, vec![PortSpec::external()])],
        );
        orch.create_group(&ctx, &spec).unwrap();
        mock.clear_calls();

        spec.vms
            .push(vm_spec("d1", Role::DockerNode, vec![PortSpec::external()]));
        orch.update_group(&ctx, &spec).unwrap();

        let calls = mock.calls();
        assert!(calls.iter().any(|c| c == "add_vms app1-vapp d1"));
        assert!(calls.iter().any(|c| c == "power_on_vm app1-vapp/d1"));
        assert!(!calls.iter().any(|c| c == "power_on_vm app1-vapp/lb"));
        let d1 = mock.vm("app1-vapp", "d1").unwrap();
        assert_eq!(d1.status, PowerState::PoweredOn);
        assert_eq!(d1.connections[0].mode, IpAllocationMode::Dhcp);
    }

    #[test]
    fn test_update_group_leaves_unlisted_vms() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        let spec = cluster("clust1");
        orch.create_group(&ctx, &spec).unwrap();

        let mut smaller = spec.clone();
        smaller.vms.retain(|v| v.name != "w1");
        orch.update_group(&ctx, &smaller).unwrap();
        assert!(mock.vm("clust1-vapp", "w1").is_some());
    }

    #[test]
    fn test_update_group_missing_is_not_found() {
        let (_mock, orch) = setup(20);
        let err = orch
            .update_group(&OpContext::background(), &cluster("nope"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_vms() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        mock.clear_calls();

        orch.remove_vms(&ctx, "clust1-vapp", &["w1".to_string(), "ghost".to_string()])
            .unwrap();
        let undeploy = mock.call_index("undeploy_vm clust1-vapp/w1").unwrap();
        let delete = mock.call_index("delete_vm clust1-vapp/w1").unwrap();
        assert!(undeploy < delete);
        assert!(mock.vm("clust1-vapp", "w1").is_none());
        assert!(orch.inventory().vm("clust1-vapp", "w1").is_none());
    }

    #[test]
    fn test_delete_group_order_and_release() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        mock.clear_calls();

        orch.delete_group(&ctx, "clust1-vapp").unwrap();
        let undeploy = mock.call_index("undeploy_group").unwrap();
        let nets = mock.call_index("remove_all_group_networks").unwrap();
        let delete = mock.call_index("delete_group").unwrap();
        assert!(undeploy < nets && nets < delete);
        assert!(mock.group("clust1-vapp").is_none());
        assert!(orch.inventory().group("clust1-vapp").is_none());
        assert!(orch.inventory().snapshot().external_reservations.is_empty());
        assert!(orch.inventory().snapshot().cidr_reservations.is_empty());
    }

    #[test]
    fn test_delete_group_frees_addresses_for_reuse() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        orch.delete_group(&ctx, "clust1-vapp").unwrap();
        orch.create_group(&ctx, &cluster("clust2")).unwrap();
        assert_eq!(
            addr(&mock, "clust2-vapp", "lb", "ext-net"),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(
            addr(&mock, "clust2-vapp", "m", "mex-k8s-subnet-cld1-clust2-acme"),
            Some(Ipv4Addr::new(10, 101, 1, 10))
        );
    }

    #[test]
    fn test_delete_missing_group_is_ok() {
        let (mock, orch) = setup(20);
        orch.delete_group(&OpContext::background(), "ghost-vapp")
            .unwrap();
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_start_on_running_vm_is_invalid_state() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        mock.clear_calls();

        let err = orch
            .set_power_state(&ctx, "w1", PowerAction::Start)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_stop_start_and_reboot() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();

        orch.set_power_state(&ctx, "w1", PowerAction::Stop).unwrap();
        assert_eq!(
            mock.vm("clust1-vapp", "w1").unwrap().status,
            PowerState::PoweredOff
        );
        let err = orch
            .set_power_state(&ctx, "w1", PowerAction::Reboot)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        orch.set_power_state(&ctx, "w1", PowerAction::Start).unwrap();
        mock.clear_calls();
        orch.set_power_state(&ctx, "w1", PowerAction::Reboot)
            .unwrap();
        assert_eq!(
            mock.calls(),
            vec![
                "power_off_vm clust1-vapp/w1".to_string(),
                "power_on_vm clust1-vapp/w1".to_string(),
            ]
        );
        assert_eq!(
            mock.vm("clust1-vapp", "w1").unwrap().status,
            PowerState::PoweredOn
        );
    }

    #[test]
    fn test_set_power_state_unknown_vm() {
        let (_mock, orch) = setup(20);
        let err = orch
            .set_power_state(&OpContext::background(), "ghost", PowerAction::Stop)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_get_server_detail() {
        let (_mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();

        let lb = orch.get_server_detail("lb").unwrap();
        assert_eq!(lb.status, ServerStatus::Active);
        assert_eq!(lb.addresses.len(), 1);
        assert_eq!(lb.addresses[0].network, "ext-net");
        assert_eq!(lb.addresses[0].address, Ipv4Addr::new(192, 168, 1, 10));

        orch.delete_group(&ctx, "clust1-vapp").unwrap();
        assert!(orch.get_server_detail("lb").unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_server_detail_after_platform_removal() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        mock.delete_vm("clust1-vapp", "lb").unwrap_err();
        mock.undeploy_vm("clust1-vapp", "lb").unwrap();
        mock.delete_vm("clust1-vapp", "lb").unwrap();

        assert!(orch.get_server_detail("lb").unwrap_err().is_not_found());
        assert!(orch.inventory().vm("clust1-vapp", "lb").is_none());
    }

    #[test]
    fn test_update_group_reapplies_compute_without_power_cycle() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        let mut spec = cluster("clust1");
        orch.create_group(&ctx, &spec).unwrap();
        mock.clear_calls();

        spec.vms
            .iter_mut()
            .find(|v| v.name == "w1")
            .unwrap()
            .shape
            .vcpus = 4;
        orch.update_group(&ctx, &spec).unwrap();

        let calls = mock.calls();
        assert!(calls.iter().any(|c| c == "update_vm_compute clust1-vapp/w1"));
        assert!(!calls.iter().any(|c| c.starts_with("power_on")
            || c.starts_with("power_off")
            || c.starts_with("undeploy")));
        let w1 = mock.vm("clust1-vapp", "w1").unwrap();
        assert_eq!(w1.vcpus, 4);
        assert_eq!(w1.status, PowerState::PoweredOn);
    }

    fn gateway(cluster: &str) -> VmGroupSpec {
        group_spec(
            "cld1",
            cluster,
            vec![vm_spec("lb", Role::Agent, vec![PortSpec::external()])],
        )
    }

    #[test]
    fn test_delete_group_keeps_same_named_vm_of_other_group() {
        let (_mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &gateway("a")).unwrap();
        orch.create_group(&ctx, &gateway("b")).unwrap();

        orch.delete_group(&ctx, "b-vapp").unwrap();
        assert!(orch.inventory().vm("a-vapp", "lb").is_some());
        let lb = orch.get_server_detail("lb").unwrap();
        assert_eq!(lb.addresses[0].address, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(
            orch.inventory().snapshot().external_reservations.len(),
            1
        );
    }

    #[test]
    fn test_bare_name_in_two_groups_is_ambiguous() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &gateway("a")).unwrap();
        orch.create_group(&ctx, &gateway("b")).unwrap();
        mock.clear_calls();

        match orch.get_server_detail("lb").unwrap_err() {
            Error::Ambiguous { groups, .. } => {
                assert_eq!(groups, vec!["a-vapp".to_string(), "b-vapp".to_string()])
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
        let err = orch
            .set_power_state(&ctx, "lb", PowerAction::Stop)
            .unwrap_err();
        assert!(matches!(err, Error::Ambiguous { .. }));
        assert!(mock.calls().is_empty());

        let b = orch.get_server_detail("b-vapp/lb").unwrap();
        assert_eq!(b.addresses[0].address, Ipv4Addr::new(192, 168, 1, 11));
        orch.set_power_state(&ctx, "a-vapp/lb", PowerAction::Stop)
            .unwrap();
        assert_eq!(
            mock.vm("a-vapp", "lb").unwrap().status,
            PowerState::PoweredOff
        );
        assert_eq!(
            mock.vm("b-vapp", "lb").unwrap().status,
            PowerState::PoweredOn
        );
    }

    #[test]
    fn test_stop_and_start_group() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        let lb = addr(&mock, "clust1-vapp", "lb", "ext-net");

        orch.stop_group(&ctx, "clust1-vapp").unwrap();
        let g = mock.group("clust1-vapp").unwrap();
        assert_eq!(g.status, PowerState::PoweredOff);
        assert_eq!(g.vms.len(), 3);
        let err = orch.stop_group(&ctx, "clust1-vapp").unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        orch.start_group(&ctx, "clust1-vapp").unwrap();
        for vm in ["lb", "m", "w1"] {
            assert_eq!(
                mock.vm("clust1-vapp", vm).unwrap().status,
                PowerState::PoweredOn
            );
        }
        assert_eq!(addr(&mock, "clust1-vapp", "lb", "ext-net"), lb);
        let err = orch.start_group(&ctx, "clust1-vapp").unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_restart_group() {
        let (mock, orch) = setup(20);
        let ctx = OpContext::background();
        orch.create_group(&ctx, &cluster("clust1")).unwrap();
        mock.clear_calls();

        orch.restart_group(&ctx, "clust1-vapp").unwrap();
        let undeploy = mock.call_index("undeploy_group clust1-vapp").unwrap();
        let power = mock.call_index("power_on_group clust1-vapp").unwrap();
        assert!(undeploy < power);
        assert_eq!(
            mock.group("clust1-vapp").unwrap().status,
            PowerState::PoweredOn
        );
    }

    #[test]
    fn test_start_missing_group_is_not_found() {
        let (_mock, orch) = setup(20);
        let err = orch
            .start_group(&OpContext::background(), "ghost-vapp")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_get_group_resources() {
        let (_mock, orch) = setup(20);
        orch.create_group(&OpContext::background(), &cluster("clust1"))
            .unwrap();

        let res = orch.get_group_resources("clust1-vapp").unwrap();
        assert_eq!(res.group, "clust1-vapp");
        assert_eq!(res.vms.len(), 3);
        let lb = res.vms.iter().find(|v| v.name == "lb").unwrap();
        assert_eq!(lb.flavor.as_deref(), Some("m4.small"));
        assert_eq!(lb.role, Some(Role::Agent.to_string()));
        assert_eq!(lb.status, ServerStatus::Active);
        assert_eq!(lb.addresses[0].address, Ipv4Addr::new(192, 168, 1, 10));
    }
}
