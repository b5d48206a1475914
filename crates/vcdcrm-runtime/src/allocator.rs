//! Lowest-free scans for external addresses and internal /24 blocks.
//!
//! The scans are pure over an [`InventoryState`]; [`Inventory`] pairs them
//! with a reservation under its lock.
//!
//! [`Inventory`]: crate::inventory::Inventory

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use vcdcrm_core::config::OrchestratorConfig;
use vcdcrm_core::error::{Error, Result};
use vcdcrm_core::naming::{self, DEFAULT_INTERNAL_NET_PREFIX};

use crate::inventory::InventoryState;
use crate::platform::{IpRange, NetworkConfig};

/// Prefix length of every internal network.
pub const INTERNAL_PREFIX: u8 = 24;

const DEFAULT_STATIC_RANGE_SIZE: u8 = 100;

/// The shared external network's assignable addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPool {
    pub network: String,
    pub gateway: Ipv4Addr,
    pub ranges: Vec<IpRange>,
}

impl ExternalPool {
    pub fn from_network(net: &NetworkConfig) -> Self {
        Self {
            network: net.name.clone(),
            gateway: net.gateway,
            ranges: net.ranges.clone(),
        }
    }

    /// Number of addresses across all configured ranges.
    pub fn capacity(&self) -> u32 {
        self.ranges.iter().map(IpRange::len).sum()
    }
}

/// Addresses on `network` claimed by cached VMs or by reservations.
pub fn external_addresses_in_use(state: &InventoryState, network: &str) -> BTreeSet<Ipv4Addr> {
    let mut used: BTreeSet<Ipv4Addr> = state
        .vms
        .values()
        .flat_map(|vm| vm.connections.iter())
        .filter(|c| c.network == network)
        .filter_map(|c| c.address)
        .collect();
    used.extend(state.external_reservations.keys().copied());
    used
}

/// Lowest address in the pool not claimed anywhere in the cache.
pub fn next_external_address(state: &InventoryState, pool: &ExternalPool) -> Result<Ipv4Addr> {
    let used = external_addresses_in_use(state, &pool.network);
    pool.ranges
        .iter()
        .flat_map(IpRange::iter)
        .find(|a| *a != pool.gateway && !used.contains(a))
        .ok_or_else(|| Error::PoolExhausted {
            pool: format!("external network {}", pool.network),
        })
}

/// Bounds of the internal /24 scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalCidrParams {
    pub base: (u8, u8),
    pub start_octet: u8,
    pub max_octet: u8,
    pub static_range_size: u8,
    /// Name prefix of cluster-owned networks; other isolated networks are ignored.
    pub net_prefix: String,
}

impl Default for InternalCidrParams {
    fn default() -> Self {
        Self {
            base: (10, 101),
            start_octet: 1,
            max_octet: 255,
            static_range_size: DEFAULT_STATIC_RANGE_SIZE,
            net_prefix: DEFAULT_INTERNAL_NET_PREFIX.to_string(),
        }
    }
}

impl InternalCidrParams {
    pub fn from_config(cfg: &OrchestratorConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base: cfg.internal_base_octets()?,
            start_octet: cfg.network.internal_start_octet,
            max_octet: cfg.network.internal_max_octet,
            static_range_size: cfg.network.static_range_size,
            net_prefix: cfg.network.internal_net_prefix.clone(),
        })
    }

    fn candidate(&self, octet: u8) -> Result<InternalCidr> {
        let addr = Ipv4Addr::new(self.base.0, self.base.1, octet, 0);
        InternalCidr::from_network_addr(addr).map(|c| c.with_range_size(self.static_range_size))
    }
}

/// A cluster's internal /24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalCidr {
    pub network: Ipv4Network,
    static_range_size: u8,
}

impl InternalCidr {
    pub fn from_network_addr(addr: Ipv4Addr) -> Result<Self> {
        let network = Ipv4Network::new(addr, INTERNAL_PREFIX)
            .map_err(|e| Error::InvalidSpec(format!("bad internal network {}: {}", addr, e)))?;
        Ok(Self {
            network,
            static_range_size: DEFAULT_STATIC_RANGE_SIZE,
        })
    }

    pub fn with_range_size(mut self, size: u8) -> Self {
        self.static_range_size = size;
        self
    }

    fn host(&self, octet: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()) + u32::from(octet))
    }

    /// Network address + 1; never handed to a VM.
    pub fn gateway(&self) -> Ipv4Addr {
        self.host(1)
    }

    /// `.2 ..= .static_range_size`, the range the platform assigns from.
    pub fn static_range(&self) -> IpRange {
        IpRange::new(self.host(2), self.host(self.static_range_size))
    }

    /// Fixed VM address for a requested last octet.
    pub fn address_for_octet(&self, octet: u8) -> Result<Ipv4Addr> {
        if matches!(octet, 0 | 1 | 255) {
            return Err(Error::InvalidSpec(format!(
                "octet .{} is reserved in {}",
                octet, self.network
            )));
        }
        Ok(self.host(octet))
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }
}

/// Network addresses of /24s held by cached clusters or reservations.
///
/// A group network counts when it is isolated and its name parses back to
/// a cloudlet/cluster/org triple under `prefix`.
pub fn internal_cidrs_in_use(state: &InventoryState, prefix: &str) -> BTreeSet<Ipv4Addr> {
    let mut used: BTreeSet<Ipv4Addr> = state
        .groups
        .values()
        .flat_map(|g| g.networks.iter())
        .filter(|n| n.isolated && naming::parse_internal_network_name(prefix, &n.name).is_some())
        .filter_map(NetworkConfig::cidr)
        .map(|c| c.network())
        .collect();
    used.extend(state.cidr_reservations.keys().copied());
    used
}

/// Lowest free /24 between the start and max third octet.
pub fn next_internal_cidr(
    state: &InventoryState,
    params: &InternalCidrParams,
) -> Result<InternalCidr> {
    let used = internal_cidrs_in_use(state, &params.net_prefix);
    for octet in params.start_octet..=params.max_octet {
        let candidate = params.candidate(octet)?;
        if !used.contains(&candidate.network.network()) {
            return Ok(candidate);
        }
    }
    Err(Error::PoolExhausted {
        pool: format!(
            "internal networks {}.{}.{}-{}.0/24",
            params.base.0, params.base.1, params.start_octet, params.max_octet
        ),
    })
}
