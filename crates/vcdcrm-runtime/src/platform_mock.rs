//! In-memory platform used by tests.
//!
//! Tasks complete as soon as they are submitted (optionally after a few
//! `Running` polls). Mutating calls are recorded in a call log so tests can
//! assert ordering, and failures can be scripted per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use uuid::Uuid;

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::error::{ObjectKind, PlatformError};
use vcdcrm_core::spec::{ComputeShape, PortSpec, Role, VmGroupSpec, VmSpec};
use vcdcrm_core::vm::{IpAllocationMode, NetworkConnection, PowerState};

use crate::platform::*;

pub const MOCK_ORG: &str = "mex";
pub const MOCK_VDC: &str = "mex-vdc";
pub const MOCK_CATALOG: &str = "mex-catalog";
pub const MOCK_TEMPLATE: &str = "mex-base";

const BOOT_DISK_UNIT: u32 = 2000;
const BOOT_DISK_MB: u64 = 10 * 1024;

struct MockState {
    networks: BTreeMap<String, NetworkRecord>,
    catalogs: BTreeMap<String, CatalogRecord>,
    templates: BTreeMap<(String, String), TemplateRecord>,
    media: BTreeMap<String, MediaRecord>,
    groups: BTreeMap<String, GroupRecord>,
    vms: BTreeMap<(String, String), VmRecord>,
    foreign_addresses: HashSet<(String, Ipv4Addr)>,
    capacity: VdcCapacity,
    admin_cpu_speed: Option<u64>,
    tasks: HashMap<String, (u32, TaskStatus)>,
    task_running_polls: u32,
    calls: Vec<String>,
    failures: Vec<(String, PlatformError)>,
    broken_vms: HashSet<String>,
    unresolved_fetches: HashMap<String, u32>,
    refuse_power_on: HashSet<String>,
}

/// In-memory [`PlatformClient`].
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id(kind: &str) -> (String, String) {
    let id = Uuid::new_v4();
    (
        format!("urn:vcloud:{}:{}", kind, id),
        format!("https://vcd.mock/api/{}/{}-{}", kind, kind, id),
    )
}

impl MockPlatform {
    /// Platform with one org, one VDC, and the default catalog/template.
    pub fn new() -> Self {
        let (tid, thref) = new_id("vAppTemplate");
        let mut templates = BTreeMap::new();
        templates.insert(
            (MOCK_CATALOG.to_string(), MOCK_TEMPLATE.to_string()),
            TemplateRecord {
                name: MOCK_TEMPLATE.to_string(),
                id: tid,
                href: thref,
                catalog: MOCK_CATALOG.to_string(),
            },
        );
        let mut catalogs = BTreeMap::new();
        catalogs.insert(
            MOCK_CATALOG.to_string(),
            CatalogRecord {
                name: MOCK_CATALOG.to_string(),
                id: new_id("catalog").0,
                items: vec![MOCK_TEMPLATE.to_string()],
            },
        );
        Self {
            state: Mutex::new(MockState {
                networks: BTreeMap::new(),
                catalogs,
                templates,
                media: BTreeMap::new(),
                groups: BTreeMap::new(),
                vms: BTreeMap::new(),
                foreign_addresses: HashSet::new(),
                capacity: VdcCapacity {
                    cpu_used_mhz: 8000,
                    cpu_limit_mhz: 40000,
                    mem_used_mb: 16384,
                    mem_limit_mb: 131072,
                    storage_used_mb: 200 * 1024,
                    storage_limit_mb: 2048 * 1024,
                    vm_quota: 50,
                },
                admin_cpu_speed: Some(2000),
                tasks: HashMap::new(),
                task_running_polls: 0,
                calls: Vec::new(),
                failures: Vec::new(),
                broken_vms: HashSet::new(),
                unresolved_fetches: HashMap::new(),
                refuse_power_on: HashSet::new(),
            }),
        }
    }

    /// Add an org network with one static range.
    pub fn with_external_network(
        self,
        name: &str,
        gateway: Ipv4Addr,
        prefix: u8,
        range: IpRange,
    ) -> Self {
        let (id, href) = new_id("network");
        self.lock().networks.insert(
            name.to_string(),
            NetworkRecord {
                id,
                href,
                config: NetworkConfig {
                    name: name.to_string(),
                    gateway,
                    prefix,
                    ranges: vec![range],
                    dns: vec![],
                    isolated: false,
                },
            },
        );
        self
    }

    pub fn with_media(self, name: &str) -> Self {
        self.lock().media.insert(
            name.to_string(),
            MediaRecord {
                name: name.to_string(),
                id: new_id("media").0,
            },
        );
        self
    }

    /// Seed an existing VM (and its group, if new) with the given connections.
    pub fn with_vm(
        self,
        group: &str,
        vm: &str,
        status: PowerState,
        connections: Vec<NetworkConnection>,
    ) -> Self {
        {
            let mut st = self.lock();
            let nets: Vec<NetworkConfig> = connections
                .iter()
                .filter_map(|c| st.networks.get(&c.network).map(|n| n.config.clone()))
                .collect();
            let g = st
                .groups
                .entry(group.to_string())
                .or_insert_with(|| new_group(group, status.clone()));
            g.vms.push(vm.to_string());
            for net in nets {
                if !g.networks.iter().any(|n| n.name == net.name) {
                    g.networks.push(net);
                }
            }
            let mut rec = new_vm(group, vm);
            rec.status = status;
            rec.connections = connections;
            st.vms.insert((group.to_string(), vm.to_string()), rec);
            st.refresh_group_status(group);
        }
        self
    }

    /// Mark an address as held by something outside the VDC's inventory.
    pub fn with_foreign_address(self, network: &str, addr: Ipv4Addr) -> Self {
        self.lock()
            .foreign_addresses
            .insert((network.to_string(), addr));
        self
    }

    pub fn with_admin_cpu_speed(self, mhz: Option<u64>) -> Self {
        self.lock().admin_cpu_speed = mhz;
        self
    }

    pub fn with_capacity(self, capacity: VdcCapacity) -> Self {
        self.lock().capacity = capacity;
        self
    }

    /// Every task reports `Running` this many times before finishing.
    pub fn with_task_running_polls(self, polls: u32) -> Self {
        self.lock().task_running_polls = polls;
        self
    }

    /// Fail the next call of `op` (method name, e.g. `"compose_group"`).
    /// Applies to mutating calls and to `fetch_org` / `fetch_vdc`.
    pub fn fail_next(&self, op: &str, err: PlatformError) {
        self.lock().failures.push((op.to_string(), err));
    }

    /// Make every fetch of VM `name` fail.
    pub fn fail_vm_fetch(&self, name: &str) {
        self.lock().broken_vms.insert(name.to_string());
    }

    /// Report `group` and its VMs as unresolved for the next `fetches` reads.
    pub fn resolve_after(&self, group: &str, fetches: u32) {
        self.lock()
            .unresolved_fetches
            .insert(group.to_string(), fetches);
    }

    /// Power-on requests for `vm` succeed but leave it powered off.
    pub fn refuse_power_on(&self, vm: &str) {
        self.lock().refuse_power_on.insert(vm.to_string());
    }

    /// Mutating calls in the order they were issued.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Position of the first call starting with `prefix`.
    pub fn call_index(&self, prefix: &str) -> Option<usize> {
        self.lock().calls.iter().position(|c| c.starts_with(prefix))
    }

    pub fn vm(&self, group: &str, vm: &str) -> Option<VmRecord> {
        self.lock()
            .vms
            .get(&(group.to_string(), vm.to_string()))
            .cloned()
    }

    pub fn group(&self, group: &str) -> Option<GroupRecord> {
        self.lock().groups.get(group).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Apply a scripted failure to a read call without logging it.
    fn scripted(&self, op: &str) -> PlatformResult<()> {
        let mut st = self.lock();
        match st.failures.iter().position(|(o, _)| o == op) {
            Some(pos) => Err(st.failures.remove(pos).1),
            None => Ok(()),
        }
    }

    /// Log the call, apply scripted failures, and hand out a task.
    fn begin(&self, op: &str, object: &str) -> PlatformResult<std::sync::MutexGuard<'_, MockState>> {
        let mut st = self.lock();
        st.calls.push(format!("{} {}", op, object));
        if let Some(pos) = st.failures.iter().position(|(o, _)| o == op) {
            let (_, err) = st.failures.remove(pos);
            return Err(err);
        }
        Ok(st)
    }
}

impl MockState {
    fn task(&mut self) -> TaskHandle {
        let id = Uuid::new_v4().to_string();
        self.tasks
            .insert(id.clone(), (self.task_running_polls, TaskStatus::Success));
        TaskHandle(id)
    }

    fn vm_mut(&mut self, group: &str, vm: &str) -> PlatformResult<&mut VmRecord> {
        self.vms
            .get_mut(&(group.to_string(), vm.to_string()))
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Vm, vm))
    }

    fn group_mut(&mut self, group: &str) -> PlatformResult<&mut GroupRecord> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Group, group))
    }

    fn is_unresolved(&self, group: &str) -> bool {
        self.unresolved_fetches.get(group).is_some_and(|n| *n > 0)
    }

    fn refresh_group_status(&mut self, group: &str) {
        let statuses: Vec<PowerState> = self
            .vms
            .iter()
            .filter(|((g, _), _)| g == group)
            .map(|(_, v)| v.status.clone())
            .collect();
        if let Some(g) = self.groups.get_mut(group) {
            g.status = if statuses.is_empty() {
                PowerState::Resolved
            } else if statuses.iter().all(|s| *s == PowerState::Resolved) {
                PowerState::Resolved
            } else if statuses.iter().all(|s| *s == PowerState::PoweredOn) {
                PowerState::PoweredOn
            } else if statuses.iter().any(|s| *s == PowerState::PoweredOn) {
                PowerState::Unknown("MIXED".to_string())
            } else {
                PowerState::PoweredOff
            };
        }
    }

    fn address_in_use(
        &self,
        group: &str,
        vm: &str,
        net: &NetworkConfig,
        addr: Ipv4Addr,
    ) -> bool {
        if self.foreign_addresses.contains(&(net.name.clone(), addr)) {
            return true;
        }
        self.vms.iter().any(|((g, v), rec)| {
            (g != group || v != vm)
                && (!net.isolated || g == group)
                && rec
                    .connections
                    .iter()
                    .any(|c| c.network == net.name && c.address == Some(addr))
        })
    }
}

fn new_group(name: &str, status: PowerState) -> GroupRecord {
    let (id, href) = new_id("vApp");
    GroupRecord {
        name: name.to_string(),
        id,
        href,
        status,
        networks: vec![],
        vms: vec![],
    }
}

fn new_vm(group: &str, name: &str) -> VmRecord {
    let (id, href) = new_id("vm");
    VmRecord {
        name: name.to_string(),
        id,
        href,
        group: group.to_string(),
        status: PowerState::Resolved,
        connections: vec![],
        vcpus: 1,
        ram_mb: 1024,
        disks: vec![DiskRecord {
            unit: BOOT_DISK_UNIT,
            size_mb: BOOT_DISK_MB,
        }],
        metadata: BTreeMap::new(),
        guest_properties: BTreeMap::new(),
        computer_name: None,
    }
}

impl PlatformClient for MockPlatform {
    fn fetch_org(&self, org: &str) -> PlatformResult<OrgRecord> {
        self.scripted("fetch_org")?;
        if org != MOCK_ORG {
            return Err(PlatformError::not_found(ObjectKind::Org, org));
        }
        Ok(OrgRecord {
            name: org.to_string(),
            id: format!("urn:vcloud:org:{}", org),
        })
    }

    fn fetch_vdc(&self, org: &str, vdc: &str) -> PlatformResult<VdcRecord> {
        self.scripted("fetch_vdc")?;
        if org != MOCK_ORG {
            return Err(PlatformError::not_found(ObjectKind::Org, org));
        }
        if vdc != MOCK_VDC {
            return Err(PlatformError::not_found(ObjectKind::Vdc, vdc));
        }
        let st = self.lock();
        let mut entities = Vec::new();
        for (name, n) in &st.networks {
            entities.push(ResourceEntity {
                name: name.clone(),
                type_tag: "application/vnd.vmware.vcloud.orgVdcNetwork+xml".to_string(),
                href: n.href.clone(),
            });
        }
        for (name, c) in &st.catalogs {
            entities.push(ResourceEntity {
                name: name.clone(),
                type_tag: "application/vnd.vmware.vcloud.catalog+xml".to_string(),
                href: c.id.clone(),
            });
        }
        for t in st.templates.values() {
            entities.push(ResourceEntity {
                name: t.name.clone(),
                type_tag: "application/vnd.vmware.vcloud.vAppTemplate+xml".to_string(),
                href: t.href.clone(),
            });
        }
        for (name, m) in &st.media {
            entities.push(ResourceEntity {
                name: name.clone(),
                type_tag: "application/vnd.vmware.vcloud.media+xml".to_string(),
                href: m.id.clone(),
            });
        }
        for (name, g) in &st.groups {
            entities.push(ResourceEntity {
                name: name.clone(),
                type_tag: "application/vnd.vmware.vcloud.vApp+xml".to_string(),
                href: g.href.clone(),
            });
        }
        Ok(VdcRecord {
            name: vdc.to_string(),
            id: format!("urn:vcloud:vdc:{}", vdc),
            entities,
            capacity: st.capacity.clone(),
        })
    }

    fn admin_cpu_speed_mhz(&self, _vdc: &str) -> PlatformResult<Option<u64>> {
        Ok(self.lock().admin_cpu_speed)
    }

    fn fetch_network(&self, name: &str) -> PlatformResult<NetworkRecord> {
        self.lock()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Network, name))
    }

    fn fetch_catalog(&self, name: &str) -> PlatformResult<CatalogRecord> {
        self.lock()
            .catalogs
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Catalog, name))
    }

    fn fetch_template(&self, catalog: &str, name: &str) -> PlatformResult<TemplateRecord> {
        self.lock()
            .templates
            .get(&(catalog.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Template, name))
    }

    fn fetch_media(&self, name: &str) -> PlatformResult<MediaRecord> {
        self.lock()
            .media
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Media, name))
    }

    fn fetch_group(&self, name: &str) -> PlatformResult<GroupRecord> {
        let mut st = self.lock();
        let mut g = st
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Group, name))?;
        if let Some(n) = st.unresolved_fetches.get_mut(name)
            && *n > 0
        {
            *n = n.saturating_sub(1);
            g.status = PowerState::Unresolved;
        }
        Ok(g)
    }

    fn fetch_vm(&self, group: &str, name: &str) -> PlatformResult<VmRecord> {
        let st = self.lock();
        if st.broken_vms.contains(name) {
            return Err(PlatformError::api(format!("malformed VM record {}", name)));
        }
        let mut vm = st
            .vms
            .get(&(group.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Vm, name))?;
        if st.is_unresolved(group) {
            vm.status = PowerState::Unresolved;
        }
        Ok(vm)
    }

    fn fetch_vm_by_href(&self, href: &str) -> PlatformResult<VmRecord> {
        let st = self.lock();
        let vm = st
            .vms
            .values()
            .find(|v| v.href == href)
            .cloned()
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Vm, href))?;
        if st.broken_vms.contains(&vm.name) {
            return Err(PlatformError::api(format!("malformed VM record {}", vm.name)));
        }
        Ok(vm)
    }

    fn query_vm_records(&self) -> PlatformResult<Vec<VmQueryRecord>> {
        Ok(self
            .lock()
            .vms
            .values()
            .map(|v| VmQueryRecord {
                name: v.name.clone(),
                group: v.group.clone(),
                deployed: v.status == PowerState::PoweredOn,
                network_name: v
                    .connections
                    .iter()
                    .find(|c| c.primary)
                    .or_else(|| v.connections.first())
                    .map(|c| c.network.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    fn compose_group(&self, req: &ComposeRequest) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("compose_group", &req.group)?;
        if st.groups.contains_key(&req.group) {
            return Err(PlatformError::already_exists(ObjectKind::Group, &req.group));
        }
        if !st.templates.values().any(|t| t.href == req.template_href) {
            return Err(PlatformError::not_found(
                ObjectKind::Template,
                &req.template_href,
            ));
        }
        let mut g = new_group(&req.group, PowerState::Resolved);
        for name in &req.vm_names {
            g.vms.push(name.clone());
            st.vms
                .insert((req.group.clone(), name.clone()), new_vm(&req.group, name));
        }
        st.groups.insert(req.group.clone(), g);
        Ok(st.task())
    }

    fn add_vms(
        &self,
        group: &str,
        template_href: &str,
        names: &[String],
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("add_vms", &format!("{} {}", group, names.join(",")))?;
        if !st.templates.values().any(|t| t.href == template_href) {
            return Err(PlatformError::not_found(ObjectKind::Template, template_href));
        }
        st.group_mut(group)?;
        for name in names {
            if st.vms.contains_key(&(group.to_string(), name.clone())) {
                return Err(PlatformError::already_exists(ObjectKind::Vm, name));
            }
        }
        for name in names {
            st.vms
                .insert((group.to_string(), name.clone()), new_vm(group, name));
            st.group_mut(group)?.vms.push(name.clone());
        }
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn delete_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("delete_vm", &format!("{}/{}", group, vm))?;
        if st.vm_mut(group, vm)?.status == PowerState::PoweredOn {
            return Err(PlatformError::api(format!("VM {} is powered on", vm)));
        }
        st.vms.remove(&(group.to_string(), vm.to_string()));
        st.group_mut(group)?.vms.retain(|n| n != vm);
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn create_group_network(
        &self,
        group: &str,
        net: &NetworkConfig,
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("create_group_network", &format!("{} {}", group, net.name))?;
        let g = st.group_mut(group)?;
        if g.networks.iter().any(|n| n.name == net.name) {
            return Err(PlatformError::already_exists(ObjectKind::Network, &net.name));
        }
        g.networks.push(net.clone());
        Ok(st.task())
    }

    fn attach_org_network(&self, group: &str, network: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("attach_org_network", &format!("{} {}", group, network))?;
        let config = st
            .networks
            .get(network)
            .map(|n| n.config.clone())
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Network, network))?;
        let g = st.group_mut(group)?;
        if !g.networks.iter().any(|n| n.name == network) {
            g.networks.push(config);
        }
        Ok(st.task())
    }

    fn remove_group_network(&self, group: &str, network: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("remove_group_network", &format!("{} {}", group, network))?;
        let in_use = st.vms.iter().find(|((g, _), rec)| {
            g == group && rec.connections.iter().any(|c| c.network == network)
        });
        if let Some(((_, vm), _)) = in_use {
            return Err(PlatformError::api(format!(
                "network {} is in use by VM {}",
                network, vm
            )));
        }
        let g = st.group_mut(group)?;
        let before = g.networks.len();
        g.networks.retain(|n| n.name != network);
        if g.networks.len() == before {
            return Err(PlatformError::not_found(ObjectKind::Network, network));
        }
        Ok(st.task())
    }

    fn remove_all_group_networks(&self, group: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("remove_all_group_networks", group)?;
        st.group_mut(group)?.networks.clear();
        Ok(st.task())
    }

    fn update_vm_compute(
        &self,
        group: &str,
        vm: &str,
        update: &ComputeUpdate,
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("update_vm_compute", &format!("{}/{}", group, vm))?;
        let rec = st.vm_mut(group, vm)?;
        rec.vcpus = update.vcpus;
        rec.ram_mb = update.ram_mb;
        if let Some(size) = update.boot_disk_mb
            && let Some(boot) = rec.disks.first_mut()
        {
            boot.size_mb = size;
        }
        for disk in &update.extra_disks {
            if !rec.disks.iter().any(|d| d.unit == disk.unit) {
                rec.disks.push(*disk);
            }
        }
        Ok(st.task())
    }

    fn set_vm_network_connections(
        &self,
        group: &str,
        vm: &str,
        connections: &[NetworkConnection],
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("set_vm_network_connections", &format!("{}/{}", group, vm))?;
        if st.is_unresolved(group) {
            return Err(PlatformError::api("cannot customize an unresolved VM"));
        }
        let nets = st.group_mut(group)?.networks.clone();
        let mut assigned = Vec::with_capacity(connections.len());
        for conn in connections {
            let net = nets
                .iter()
                .find(|n| n.name == conn.network)
                .ok_or_else(|| PlatformError::not_found(ObjectKind::Network, &conn.network))?;
            let mut conn = conn.clone();
            match conn.mode {
                IpAllocationMode::Manual => {
                    let addr = conn
                        .address
                        .ok_or_else(|| PlatformError::api("manual mode requires an address"))?;
                    if addr == net.gateway || st.address_in_use(group, vm, net, addr) {
                        return Err(PlatformError::AddressConflict {
                            address: addr.to_string(),
                        });
                    }
                }
                IpAllocationMode::Pool => {
                    let free = net
                        .ranges
                        .iter()
                        .flat_map(|r| r.iter())
                        .find(|a| !st.address_in_use(group, vm, net, *a))
                        .ok_or_else(|| PlatformError::api("static range exhausted"))?;
                    conn.address = Some(free);
                }
                IpAllocationMode::Dhcp => conn.address = None,
            }
            assigned.push(conn);
        }
        st.vm_mut(group, vm)?.connections = assigned;
        Ok(st.task())
    }

    fn set_vm_guest(
        &self,
        group: &str,
        vm: &str,
        guest: &GuestConfig,
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("set_vm_guest", &format!("{}/{}", group, vm))?;
        if st.is_unresolved(group) {
            return Err(PlatformError::api("cannot customize an unresolved VM"));
        }
        let rec = st.vm_mut(group, vm)?;
        rec.computer_name = Some(guest.computer_name.clone());
        if let Some(props) = &guest.properties {
            rec.guest_properties = props.clone();
        }
        Ok(st.task())
    }

    fn set_vm_metadata(
        &self,
        group: &str,
        vm: &str,
        metadata: &BTreeMap<String, String>,
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("set_vm_metadata", &format!("{}/{}", group, vm))?;
        st.vm_mut(group, vm)?.metadata.extend(metadata.clone());
        Ok(st.task())
    }

    fn power_on_vm(
        &self,
        group: &str,
        vm: &str,
        _force_customization: bool,
    ) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("power_on_vm", &format!("{}/{}", group, vm))?;
        let refused = st.refuse_power_on.contains(vm);
        let rec = st.vm_mut(group, vm)?;
        if rec.status == PowerState::PoweredOn {
            return Err(PlatformError::api(format!("VM {} is already powered on", vm)));
        }
        if !refused {
            rec.status = PowerState::PoweredOn;
        }
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn power_off_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("power_off_vm", &format!("{}/{}", group, vm))?;
        st.vm_mut(group, vm)?.status = PowerState::PoweredOff;
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn undeploy_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("undeploy_vm", &format!("{}/{}", group, vm))?;
        st.vm_mut(group, vm)?.status = PowerState::PoweredOff;
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn power_on_group(&self, group: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("power_on_group", group)?;
        if st.is_unresolved(group) {
            return Err(PlatformError::api(format!("group {} is not resolved", group)));
        }
        st.group_mut(group)?;
        let refused = st.refuse_power_on.clone();
        for ((g, name), rec) in st.vms.iter_mut() {
            if g == group && !refused.contains(name) {
                rec.status = PowerState::PoweredOn;
            }
        }
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn undeploy_group(&self, group: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("undeploy_group", group)?;
        st.group_mut(group)?;
        for ((g, _), rec) in st.vms.iter_mut() {
            if g == group {
                rec.status = PowerState::PoweredOff;
            }
        }
        st.refresh_group_status(group);
        Ok(st.task())
    }

    fn delete_group(&self, group: &str) -> PlatformResult<TaskHandle> {
        let mut st = self.begin("delete_group", group)?;
        if st.group_mut(group)?.status == PowerState::PoweredOn {
            return Err(PlatformError::api(format!(
                "group {} must be undeployed before delete",
                group
            )));
        }
        st.groups.remove(group);
        st.vms.retain(|(g, _), _| g != group);
        st.unresolved_fetches.remove(group);
        Ok(st.task())
    }

    fn task_status(&self, task: &TaskHandle) -> PlatformResult<TaskStatus> {
        let mut st = self.lock();
        let (remaining, status) = st
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Task, &task.0))?;
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(TaskStatus::Running);
        }
        Ok(status.clone())
    }
}

/// Config with 1 ms task polling so scenario tests run quickly.
pub fn fast_config() -> OrchestratorConfig {
    let mut c = OrchestratorConfig::default();
    c.orchestrator.task_poll_interval_ms = 1;
    c
}

/// Small VM request with the given role and ports.
pub fn vm_spec(name: &str, role: Role, ports: Vec<PortSpec>) -> VmSpec {
    VmSpec {
        name: name.to_string(),
        role,
        image: MOCK_TEMPLATE.to_string(),
        shape: ComputeShape {
            flavor_name: "m4.small".to_string(),
            vcpus: 2,
            ram_mb: 4096,
            disk_gb: 20,
        },
        volumes: vec![],
        ports,
        hostname: None,
        user_data: None,
        metadata: None,
    }
}

pub fn group_spec(cloudlet: &str, cluster: &str, vms: Vec<VmSpec>) -> VmGroupSpec {
    VmGroupSpec {
        cloudlet: cloudlet.to_string(),
        cluster: cluster.to_string(),
        org: "acme".to_string(),
        vms,
    }
}
