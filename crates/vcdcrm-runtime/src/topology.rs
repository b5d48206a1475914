use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::context::OpContext;
use vcdcrm_core::error::{Error, ObjectKind, PlatformError, PlatformResultExt, Result, ok_if_exists};
use vcdcrm_core::naming::{self, NetworkOwner};
use vcdcrm_core::spec::{Role, VmSpec};
use vcdcrm_core::vm::{IpAllocationMode, NetworkConnection};

use crate::allocator::{ExternalPool, INTERNAL_PREFIX, InternalCidr, InternalCidrParams};
use crate::inventory::{Inventory, vm_key};
use crate::platform::{
    NetworkConfig, PlatformClient, PlatformResult, TaskHandle, VmRecord, await_task,
};

/// A cluster's isolated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNetwork {
    pub name: String,
    pub cidr: InternalCidr,
}

/// Result of attaching a VM to the external network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAttachment {
    pub connection: NetworkConnection,
    /// Static address for gateway roles; `None` when DHCP.
    pub address: Option<Ipv4Addr>,
}

/// Creates cluster networks and wires VMs to them.
pub struct TopologyManager<'a> {
    pub(crate) client: &'a dyn PlatformClient,
    pub(crate) inventory: &'a Inventory,
    pub(crate) config: &'a OrchestratorConfig,
    pub(crate) params: &'a InternalCidrParams,
}

impl TopologyManager<'_> {
    fn run(
        &self,
        ctx: &OpContext,
        op: &'static str,
        object: &str,
        submit: impl FnOnce() -> PlatformResult<TaskHandle>,
    ) -> Result<()> {
        await_task(
            self.client,
            ctx,
            self.config.task_poll_policy(),
            op,
            object,
            submit,
        )
    }

    /// The shared external pool, from the inventory or the platform.
    pub fn external_pool(&self) -> Result<ExternalPool> {
        let name = &self.config.platform.external_network;
        if let Some(net) = self.inventory.network(name) {
            return Ok(ExternalPool::from_network(&net.config));
        }
        let net = self
            .client
            .fetch_network(name)
            .op("fetch external network", name)?;
        let pool = ExternalPool::from_network(&net.config);
        self.inventory.upsert_network(net);
        Ok(pool)
    }

    fn attach_external_network(&self, ctx: &OpContext, group: &str) -> Result<ExternalPool> {
        let pool = self.external_pool()?;
        let attached = self
            .inventory
            .group(group)
            .is_some_and(|g| g.networks.iter().any(|n| n.name == pool.network));
        if !attached {
            ok_if_exists(self.run(ctx, "attach external network", group, || {
                self.client.attach_org_network(group, &pool.network)
            }))?;
            if let Some(net) = self.inventory.network(&pool.network) {
                self.inventory.add_group_network(group, net.config);
            }
        }
        Ok(pool)
    }

    /// Attach `group` to the external network and pick the VM's addressing.
    ///
    /// Gateway roles get a static address: `existing` if the VM already holds
    /// one, otherwise the lowest free pool address, reserved for `group`.
    /// Other roles use DHCP and get no address.
    pub fn ensure_external_attachment(
        &self,
        ctx: &OpContext,
        group: &str,
        role: Role,
        existing: Option<Ipv4Addr>,
    ) -> Result<ExternalAttachment> {
        let pool = self.attach_external_network(ctx, group)?;
        if !role.needs_static_external() {
            return Ok(ExternalAttachment {
                connection: NetworkConnection {
                    network: pool.network,
                    index: 0,
                    mode: IpAllocationMode::Dhcp,
                    address: None,
                    primary: true,
                },
                address: None,
            });
        }
        let address = match existing {
            Some(addr) => addr,
            None => self.inventory.allocate_external(group, &pool)?,
        };
        Ok(ExternalAttachment {
            connection: NetworkConnection {
                network: pool.network,
                index: 0,
                mode: IpAllocationMode::Manual,
                address: Some(address),
                primary: true,
            },
            address: Some(address),
        })
    }

    /// Create the cluster's isolated network on `group`.
    ///
    /// Gateway is `.1`, the static range `.2` through the configured size.
    /// An existing network with the same name counts as success.
    pub fn create_internal_network(
        &self,
        ctx: &OpContext,
        group: &str,
        owner: &NetworkOwner,
        cidr: InternalCidr,
    ) -> Result<String> {
        let name = naming::internal_network_name(&self.config.network.internal_net_prefix, owner)
            .map_err(|e| Error::InvalidSpec(e.to_string()))?;
        if self.config.network.dns_servers.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "internal network {} needs at least one DNS server",
                name
            )));
        }
        let net = NetworkConfig {
            name: name.clone(),
            gateway: cidr.gateway(),
            prefix: INTERNAL_PREFIX,
            ranges: vec![cidr.static_range()],
            dns: self.config.network.dns_servers.clone(),
            isolated: true,
        };
        ok_if_exists(self.run(ctx, "create internal network", &name, || {
            self.client.create_group_network(group, &net)
        }))?;
        info!(
            group,
            network = %name,
            cidr = %cidr.network,
            gateway = %cidr.gateway(),
            "internal network ready"
        );
        self.inventory.add_group_network(group, net);
        Ok(name)
    }

    /// Reuse the cluster's internal network if the group has it, else
    /// allocate a /24 and create it.
    pub fn ensure_internal_network(
        &self,
        ctx: &OpContext,
        group: &str,
        owner: &NetworkOwner,
    ) -> Result<InternalNetwork> {
        let name = naming::internal_network_name(&self.config.network.internal_net_prefix, owner)
            .map_err(|e| Error::InvalidSpec(e.to_string()))?;
        let cached = self
            .inventory
            .group(group)
            .and_then(|g| g.networks.into_iter().find(|n| n.name == name))
            .and_then(|n| n.cidr());
        if let Some(net) = cached {
            let cidr = InternalCidr::from_network_addr(net.network())?
                .with_range_size(self.params.static_range_size);
            return Ok(InternalNetwork { name, cidr });
        }
        let cidr = self.inventory.allocate_internal_cidr(group, self.params)?;
        let name = self.create_internal_network(ctx, group, owner, cidr)?;
        Ok(InternalNetwork { name, cidr })
    }

    /// Apply a VM's network connections.
    ///
    /// A platform address conflict on a static external address marks that
    /// address as taken, allocates the next one, and retries a bounded number
    /// of times.
    pub fn connect_vm(
        &self,
        ctx: &OpContext,
        group: &str,
        vm: &VmRecord,
        spec: &VmSpec,
        internal: Option<&InternalNetwork>,
    ) -> Result<Vec<NetworkConnection>> {
        let ext_name = &self.config.platform.external_network;
        let mut conns = Vec::new();

        if spec.wants_external() || spec.role.needs_static_external() {
            let existing = vm
                .connections
                .iter()
                .find(|c| &c.network == ext_name && c.mode == IpAllocationMode::Manual)
                .and_then(|c| c.address);
            let att = self.ensure_external_attachment(ctx, group, spec.role, existing)?;
            conns.push(att.connection);
        }

        if let Some(port) = spec.internal_port() {
            let net = internal.ok_or_else(|| {
                Error::InvalidSpec(format!("VM {} needs an internal network", spec.name))
            })?;
            let (mode, address) = match port.fixed_last_octet {
                Some(octet) => (IpAllocationMode::Manual, Some(net.cidr.address_for_octet(octet)?)),
                None => (IpAllocationMode::Pool, None),
            };
            conns.push(NetworkConnection {
                network: net.name.clone(),
                index: conns.len() as u32,
                mode,
                address,
                primary: conns.is_empty(),
            });
        }

        if conns.is_empty() {
            return Ok(conns);
        }

        let max_attempts = self.config.orchestrator.conflict_retry_attempts + 1;
        let mut attempt = 1;
        loop {
            let res = self.run(ctx, "set network connections", &vm.name, || {
                self.client
                    .set_vm_network_connections(group, &vm.name, &conns)
            });
            let conflicted = match &res {
                Err(Error::Platform {
                    source: PlatformError::AddressConflict { address },
                    ..
                }) if attempt < max_attempts => address.parse::<Ipv4Addr>().ok(),
                _ => None,
            };
            let ext = conflicted.and_then(|addr| {
                conns.iter_mut().find(|c| {
                    &c.network == ext_name
                        && c.mode == IpAllocationMode::Manual
                        && c.address == Some(addr)
                })
            });
            let Some(ext) = ext else {
                return res.map(|()| conns);
            };
            if let Some(addr) = conflicted {
                warn!(vm = %vm.name, %addr, attempt, "external address taken on platform, reallocating");
                self.inventory.mark_external_foreign(addr);
            }
            let pool = self.external_pool()?;
            ext.address = Some(self.inventory.allocate_external(group, &pool)?);
            attempt += 1;
        }
    }

    /// Connect a VM to an additional org network.
    ///
    /// The network is attached to the group first if it is missing there.
    /// The VM gets a new connection at the next free index: static when
    /// `address` is given, pool-assigned otherwise. If the VM is already on
    /// the network, its existing connection is returned. When wiring the VM
    /// fails, a network attached by this call is removed from the group again.
    pub fn attach_network(
        &self,
        ctx: &OpContext,
        group: &str,
        vm_name: &str,
        network: &str,
        address: Option<Ipv4Addr>,
    ) -> Result<NetworkConnection> {
        let rec = self.client.fetch_group(group).op("fetch group", group)?;
        let vm = self
            .client
            .fetch_vm(group, vm_name)
            .op("fetch vm", &vm_key(group, vm_name))?;
        if let Some(conn) = vm.connections.iter().find(|c| c.network == network) {
            debug!(group, vm = vm_name, network, "VM already on network");
            return Ok(conn.clone());
        }

        let added = !rec.networks.iter().any(|n| n.name == network);
        if added {
            ok_if_exists(self.run(ctx, "attach network", group, || {
                self.client.attach_org_network(group, network)
            }))?;
        }

        let mut conns = vm.connections.clone();
        conns.push(NetworkConnection {
            network: network.to_string(),
            index: conns.iter().map(|c| c.index + 1).max().unwrap_or(0),
            mode: if address.is_some() {
                IpAllocationMode::Manual
            } else {
                IpAllocationMode::Pool
            },
            address,
            primary: conns.is_empty(),
        });
        let wired = self.run(ctx, "attach network to vm", vm_name, || {
            self.client.set_vm_network_connections(group, vm_name, &conns)
        });
        if let Err(e) = wired {
            if added
                && let Err(cleanup) = self.run(ctx, "remove group network", group, || {
                    self.client.remove_group_network(group, network)
                })
            {
                warn!(group, network, error = %cleanup, "could not remove network after failed attach");
            }
            return Err(e);
        }

        self.inventory
            .upsert_group(self.client.fetch_group(group).op("fetch group", group)?);
        let vm = self
            .client
            .fetch_vm(group, vm_name)
            .op("fetch vm", &vm_key(group, vm_name))?;
        self.inventory.upsert_vm(vm.clone());
        let conn = vm
            .connections
            .into_iter()
            .find(|c| c.network == network)
            .ok_or_else(|| Error::NotFound {
                kind: ObjectKind::Network,
                name: network.to_string(),
            })?;
        info!(group, vm = vm_name, network, address = ?conn.address, "network attached");
        Ok(conn)
    }

    /// Disconnect every VM of `group` from `network`, then drop the network
    /// from the group.
    ///
    /// Failure to remove the network itself is logged and not returned; the
    /// VMs are already off it by then.
    pub fn detach_network(&self, ctx: &OpContext, group: &str, network: &str) -> Result<()> {
        let rec = self.client.fetch_group(group).op("fetch group", group)?;
        let mut detached = 0;
        for name in &rec.vms {
            let vm = self
                .client
                .fetch_vm(group, name)
                .op("fetch vm", &vm_key(group, name))?;
            if !vm.connections.iter().any(|c| c.network == network) {
                continue;
            }
            let mut conns: Vec<NetworkConnection> = vm
                .connections
                .iter()
                .filter(|c| c.network != network)
                .cloned()
                .collect();
            if !conns.iter().any(|c| c.primary)
                && let Some(first) = conns.first_mut()
            {
                first.primary = true;
            }
            self.run(ctx, "detach network from vm", name, || {
                self.client.set_vm_network_connections(group, name, &conns)
            })?;
            self.inventory.upsert_vm(
                self.client
                    .fetch_vm(group, name)
                    .op("fetch vm", &vm_key(group, name))?,
            );
            detached += 1;
        }

        if rec.networks.iter().any(|n| n.name == network) {
            match self.run(ctx, "remove group network", group, || {
                self.client.remove_group_network(group, network)
            }) {
                Ok(()) => self.inventory.remove_group_network(group, network),
                Err(e) => warn!(group, network, error = %e, "removing network from group failed"),
            }
        }
        info!(group, network, vms = detached, "network detached");
        Ok(())
    }
}
