//! Name-keyed cache of discovered platform objects.
//!
//! VM names are only unique within their group, so VMs (and their cached
//! hrefs) are keyed by [`vm_key`]. All access goes through one mutex, so an
//! allocator scan and the reservation it produces happen as a single
//! critical section.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use vcdcrm_core::error::Result;

use crate::allocator::{self, ExternalPool, InternalCidr, InternalCidrParams};
use crate::platform::{
    CatalogRecord, GroupRecord, MediaRecord, NetworkConfig, NetworkRecord, TemplateRecord,
    VmRecord,
};

/// Owner label for addresses found taken outside the inventory.
pub const FOREIGN_OWNER: &str = "<foreign>";

/// Inventory key of a VM: `group/name`.
pub fn vm_key(group: &str, name: &str) -> String {
    format!("{}/{}", group, name)
}

/// Cached state plus allocation reservations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InventoryState {
    pub networks: BTreeMap<String, NetworkRecord>,
    pub catalogs: BTreeMap<String, CatalogRecord>,
    pub templates: BTreeMap<String, TemplateRecord>,
    pub groups: BTreeMap<String, GroupRecord>,
    /// Keyed by [`vm_key`].
    pub vms: BTreeMap<String, VmRecord>,
    pub media: BTreeMap<String, MediaRecord>,
    /// External address -> owning group.
    pub external_reservations: BTreeMap<Ipv4Addr, String>,
    /// Internal /24 network address -> owning group.
    pub cidr_reservations: BTreeMap<Ipv4Addr, String>,
    /// [`vm_key`] -> platform href.
    pub vm_hrefs: BTreeMap<String, String>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

/// Objects found by one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Discovered {
    pub networks: BTreeMap<String, NetworkRecord>,
    pub catalogs: BTreeMap<String, CatalogRecord>,
    pub templates: BTreeMap<String, TemplateRecord>,
    pub groups: BTreeMap<String, GroupRecord>,
    /// Keyed by [`vm_key`].
    pub vms: BTreeMap<String, VmRecord>,
    pub media: BTreeMap<String, MediaRecord>,
}

impl Discovered {
    pub fn add_vm(&mut self, vm: VmRecord) {
        self.vms.insert(vm_key(&vm.group, &vm.name), vm);
    }
}

#[derive(Debug, Default)]
pub struct Inventory {
    state: Mutex<InventoryState>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InventoryState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&InventoryState) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> InventoryState {
        self.lock().clone()
    }

    /// Replace discovered objects with a fresh reconciliation result.
    ///
    /// Reservations survive so groups that are mid-creation keep their
    /// addresses; href entries for VMs that disappeared are dropped.
    pub fn install(&self, found: Discovered) {
        let mut st = self.lock();
        st.networks = found.networks;
        st.catalogs = found.catalogs;
        st.templates = found.templates;
        st.groups = found.groups;
        st.media = found.media;
        let vms = found.vms;
        st.vm_hrefs.retain(|key, _| vms.contains_key(key));
        st.vms = vms;
        st.reconciled_at = Some(Utc::now());
    }

    pub fn group(&self, name: &str) -> Option<GroupRecord> {
        self.lock().groups.get(name).cloned()
    }

    pub fn vm(&self, group: &str, name: &str) -> Option<VmRecord> {
        self.lock().vms.get(&vm_key(group, name)).cloned()
    }

    /// Every cached VM called `name`, across all groups.
    pub fn vms_named(&self, name: &str) -> Vec<VmRecord> {
        self.lock()
            .vms
            .values()
            .filter(|v| v.name == name)
            .cloned()
            .collect()
    }

    pub fn network(&self, name: &str) -> Option<NetworkRecord> {
        self.lock().networks.get(name).cloned()
    }

    pub fn template(&self, name: &str) -> Option<TemplateRecord> {
        self.lock().templates.get(name).cloned()
    }

    pub fn upsert_group(&self, group: GroupRecord) {
        self.lock().groups.insert(group.name.clone(), group);
    }

    pub fn upsert_vm(&self, vm: VmRecord) {
        self.lock().vms.insert(vm_key(&vm.group, &vm.name), vm);
    }

    pub fn upsert_network(&self, network: NetworkRecord) {
        self.lock()
            .networks
            .insert(network.config.name.clone(), network);
    }

    pub fn upsert_template(&self, template: TemplateRecord) {
        self.lock()
            .templates
            .insert(template.name.clone(), template);
    }

    /// Record a group-scoped network on a cached group.
    pub fn add_group_network(&self, group: &str, net: NetworkConfig) {
        let mut st = self.lock();
        if let Some(g) = st.groups.get_mut(group)
            && !g.networks.iter().any(|n| n.name == net.name)
        {
            g.networks.push(net);
        }
    }

    /// Record a group-scoped network removed from a cached group.
    pub fn remove_group_network(&self, group: &str, network: &str) {
        if let Some(g) = self.lock().groups.get_mut(group) {
            g.networks.retain(|n| n.name != network);
        }
    }

    pub fn remove_vm(&self, group: &str, name: &str) {
        let key = vm_key(group, name);
        let mut st = self.lock();
        st.vms.remove(&key);
        if let Some(g) = st.groups.get_mut(group) {
            g.vms.retain(|n| n != name);
        }
        st.vm_hrefs.remove(&key);
    }

    /// Forget a deleted group: its record, its VMs, and everything it reserved.
    pub fn release_group(&self, name: &str) {
        let mut st = self.lock();
        st.groups.remove(name);
        let gone: Vec<String> = st
            .vms
            .iter()
            .filter(|(_, v)| v.group == name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &gone {
            st.vms.remove(key);
            st.vm_hrefs.remove(key);
        }
        st.external_reservations.retain(|_, owner| owner.as_str() != name);
        st.cidr_reservations.retain(|_, owner| owner.as_str() != name);
        info!(group = %name, vms = gone.len(), "released group from inventory");
    }

    /// Allocate the lowest free external address and reserve it for `owner`.
    pub fn allocate_external(&self, owner: &str, pool: &ExternalPool) -> Result<Ipv4Addr> {
        let mut st = self.lock();
        let addr = allocator::next_external_address(&st, pool)?;
        st.external_reservations.insert(addr, owner.to_string());
        debug!(owner, %addr, network = %pool.network, "reserved external address");
        Ok(addr)
    }

    /// Mark an address as held elsewhere and drop `owner`'s claim on it.
    pub fn mark_external_foreign(&self, addr: Ipv4Addr) {
        self.lock()
            .external_reservations
            .insert(addr, FOREIGN_OWNER.to_string());
    }

    /// The internal /24 reserved by `owner`, or the lowest free one, now reserved.
    pub fn allocate_internal_cidr(
        &self,
        owner: &str,
        params: &InternalCidrParams,
    ) -> Result<InternalCidr> {
        let mut st = self.lock();
        if let Some((net, _)) = st
            .cidr_reservations
            .iter()
            .find(|(_, o)| o.as_str() == owner)
        {
            return InternalCidr::from_network_addr(*net)
                .map(|c| c.with_range_size(params.static_range_size));
        }
        let cidr = allocator::next_internal_cidr(&st, params)?;
        st.cidr_reservations
            .insert(cidr.network.network(), owner.to_string());
        debug!(owner, cidr = %cidr.network, "reserved internal cidr");
        Ok(cidr)
    }

    pub fn cache_vm_href(&self, group: &str, name: &str, href: &str) {
        self.lock()
            .vm_hrefs
            .insert(vm_key(group, name), href.to_string());
    }

    pub fn vm_href(&self, group: &str, name: &str) -> Option<String> {
        self.lock().vm_hrefs.get(&vm_key(group, name)).cloned()
    }

    pub fn forget_vm_href(&self, group: &str, name: &str) {
        self.lock().vm_hrefs.remove(&vm_key(group, name));
    }

    pub fn dump_vm_hrefs(&self) -> BTreeMap<String, String> {
        self.lock().vm_hrefs.clone()
    }

    pub fn clear_vm_hrefs(&self) {
        self.lock().vm_hrefs.clear();
    }

    /// Drop everything, reservations included.
    pub fn clear(&self) {
        *self.lock() = InventoryState::default();
        info!("inventory cleared");
    }
}
