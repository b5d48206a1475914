//! Consumed interface to the virtualization platform's object API.
//!
//! Every mutating call returns a [`TaskHandle`] that has to be awaited with
//! [`await_task`]; reads return records directly. Implementations block the
//! calling thread.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vcdcrm_core::context::OpContext;
use vcdcrm_core::error::{Error, PlatformError, PlatformResultExt, Result};
use vcdcrm_core::retry::{PollPolicy, poll_until};
use vcdcrm_core::vm::{NetworkConnection, PowerState};

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Opaque handle to an asynchronous platform task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed(PlatformError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRecord {
    pub name: String,
    pub id: String,
}

/// One row of a resource pool's entity listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntity {
    pub name: String,
    /// Media type tag, e.g. `application/vnd.vmware.vcloud.vApp+xml`.
    pub type_tag: String,
    pub href: String,
}

/// Capacity counters of a resource pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdcCapacity {
    pub cpu_used_mhz: u64,
    pub cpu_limit_mhz: u64,
    pub mem_used_mb: u64,
    pub mem_limit_mb: u64,
    pub storage_used_mb: u64,
    pub storage_limit_mb: u64,
    pub vm_quota: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdcRecord {
    pub name: String,
    pub id: String,
    pub entities: Vec<ResourceEntity>,
    pub capacity: VdcCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// Addresses in the range, inclusive; zero when `end < start`.
    pub fn len(&self) -> u32 {
        let (s, e) = (u32::from(self.start), u32::from(self.end));
        if e < s { 0 } else { e - s + 1 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

/// Network definition, used both for org networks and group-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub gateway: Ipv4Addr,
    pub prefix: u8,
    pub ranges: Vec<IpRange>,
    pub dns: Vec<Ipv4Addr>,
    /// True for isolated group-scoped networks.
    pub isolated: bool,
}

impl NetworkConfig {
    pub fn cidr(&self) -> Option<Ipv4Network> {
        let net = Ipv4Network::new(self.gateway, self.prefix).ok()?;
        Ipv4Network::new(net.network(), self.prefix).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub href: String,
    pub config: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub name: String,
    pub id: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub name: String,
    pub id: String,
    pub href: String,
    pub catalog: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub id: String,
    pub href: String,
    pub status: PowerState,
    pub networks: Vec<NetworkConfig>,
    /// Child VM names in platform order.
    pub vms: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub unit: u32,
    pub size_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub id: String,
    pub href: String,
    pub group: String,
    pub status: PowerState,
    pub connections: Vec<NetworkConnection>,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disks: Vec<DiskRecord>,
    pub metadata: BTreeMap<String, String>,
    pub guest_properties: BTreeMap<String, String>,
    pub computer_name: Option<String>,
}

/// Row of the platform-wide VM query used for accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmQueryRecord {
    pub name: String,
    pub group: String,
    pub deployed: bool,
    pub network_name: String,
}

/// Compose a group from a template, one VM per name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    pub group: String,
    pub description: String,
    pub template_href: String,
    pub vm_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeUpdate {
    pub vcpus: u32,
    pub ram_mb: u64,
    /// New boot disk size, when resizing is enabled.
    pub boot_disk_mb: Option<u64>,
    pub extra_disks: Vec<DiskRecord>,
}

/// Guest customization section plus, optionally, product properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    pub computer_name: String,
    pub properties: Option<BTreeMap<String, String>>,
}

/// Authenticated handle to the platform. All calls block.
pub trait PlatformClient: Send + Sync {
    fn fetch_org(&self, org: &str) -> PlatformResult<OrgRecord>;
    fn fetch_vdc(&self, org: &str, vdc: &str) -> PlatformResult<VdcRecord>;
    /// vCPU speed from admin-level VDC metadata, if the platform exposes one.
    fn admin_cpu_speed_mhz(&self, vdc: &str) -> PlatformResult<Option<u64>>;
    fn fetch_network(&self, name: &str) -> PlatformResult<NetworkRecord>;
    fn fetch_catalog(&self, name: &str) -> PlatformResult<CatalogRecord>;
    fn fetch_template(&self, catalog: &str, name: &str) -> PlatformResult<TemplateRecord>;
    fn fetch_media(&self, name: &str) -> PlatformResult<MediaRecord>;
    fn fetch_group(&self, name: &str) -> PlatformResult<GroupRecord>;
    fn fetch_vm(&self, group: &str, name: &str) -> PlatformResult<VmRecord>;
    fn fetch_vm_by_href(&self, href: &str) -> PlatformResult<VmRecord>;
    fn query_vm_records(&self) -> PlatformResult<Vec<VmQueryRecord>>;

    fn compose_group(&self, req: &ComposeRequest) -> PlatformResult<TaskHandle>;
    fn add_vms(&self, group: &str, template_href: &str, names: &[String])
    -> PlatformResult<TaskHandle>;
    fn delete_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle>;
    fn create_group_network(&self, group: &str, net: &NetworkConfig)
    -> PlatformResult<TaskHandle>;
    fn attach_org_network(&self, group: &str, network: &str) -> PlatformResult<TaskHandle>;
    fn remove_group_network(&self, group: &str, network: &str) -> PlatformResult<TaskHandle>;
    fn remove_all_group_networks(&self, group: &str) -> PlatformResult<TaskHandle>;

    fn update_vm_compute(
        &self,
        group: &str,
        vm: &str,
        update: &ComputeUpdate,
    ) -> PlatformResult<TaskHandle>;
    fn set_vm_network_connections(
        &self,
        group: &str,
        vm: &str,
        connections: &[NetworkConnection],
    ) -> PlatformResult<TaskHandle>;
    fn set_vm_guest(&self, group: &str, vm: &str, guest: &GuestConfig)
    -> PlatformResult<TaskHandle>;
    fn set_vm_metadata(
        &self,
        group: &str,
        vm: &str,
        metadata: &BTreeMap<String, String>,
    ) -> PlatformResult<TaskHandle>;

    fn power_on_vm(&self, group: &str, vm: &str, force_customization: bool)
    -> PlatformResult<TaskHandle>;
    fn power_off_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle>;
    fn undeploy_vm(&self, group: &str, vm: &str) -> PlatformResult<TaskHandle>;
    fn power_on_group(&self, group: &str) -> PlatformResult<TaskHandle>;
    fn undeploy_group(&self, group: &str) -> PlatformResult<TaskHandle>;
    fn delete_group(&self, group: &str) -> PlatformResult<TaskHandle>;

    fn task_status(&self, task: &TaskHandle) -> PlatformResult<TaskStatus>;
}

/// Issue a mutating call and block until its task finishes.
///
/// `submit` is only invoked when the context is still live, so a cancelled
/// or expired context never reaches the platform. Failures from either the
/// submission or the task itself are annotated with `op` and `object`.
pub fn await_task(
    client: &dyn PlatformClient,
    ctx: &OpContext,
    policy: PollPolicy,
    op: &'static str,
    object: &str,
    submit: impl FnOnce() -> PlatformResult<TaskHandle>,
) -> Result<()> {
    let what = format!("{} {}", op, object);
    if ctx.is_cancelled() {
        return Err(Error::Cancelled { what });
    }
    if ctx.is_expired() {
        return Err(Error::Timeout { what, attempts: 0 });
    }
    let task = submit().op(op, object)?;
    poll_until(ctx, policy, &what, || {
        match client.task_status(&task).op(op, object)? {
            TaskStatus::Success => Ok(Some(())),
            TaskStatus::Failed(e) => Err(Error::platform(op, object, e)),
            status => {
                debug!(task = %task.0, ?status, "task still running");
                Ok(None)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    use crate::platform_mock::MockPlatform;

    fn policy() -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(1), 5)
    }

    fn submitted(calls: &Cell<u32>) -> PlatformResult<TaskHandle> {
        calls.set(calls.get() + 1);
        Ok(TaskHandle("t1".to_string()))
    }

    #[test]
    fn test_await_task_cancelled_context_never_submits() {
        let mock = MockPlatform::new();
        let ctx = OpContext::background();
        ctx.cancel();
        let calls = Cell::new(0);
        let err = await_task(&mock, &ctx, policy(), "compose group", "g-vapp", || {
            submitted(&calls)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_await_task_expired_context_never_submits() {
        let mock = MockPlatform::new();
        let ctx = OpContext::with_timeout(Duration::ZERO);
        let calls = Cell::new(0);
        let err = await_task(&mock, &ctx, policy(), "delete group", "g-vapp", || {
            submitted(&calls)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 0, .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_await_task_annotates_submit_failure() {
        let mock = MockPlatform::new();
        let err = await_task(
            &mock,
            &OpContext::background(),
            policy(),
            "power on group",
            "g-vapp",
            || Err(PlatformError::api("busy")),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "power on group failed for g-vapp: busy");
    }

    #[test]
    fn test_ip_range_len_and_contains() {
        let r = IpRange::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 20));
        assert_eq!(r.len(), 11);
        assert!(r.contains(Ipv4Addr::new(10, 0, 0, 15)));
        assert!(!r.contains(Ipv4Addr::new(10, 0, 0, 21)));
        assert_eq!(r.iter().count(), 11);
    }

    #[test]
    fn test_ip_range_inverted_is_empty() {
        let r = IpRange::new(Ipv4Addr::new(10, 0, 0, 20), Ipv4Addr::new(10, 0, 0, 10));
        assert!(r.is_empty());
    }

    #[test]
    fn test_network_config_cidr() {
        let net = NetworkConfig {
            name: "n".to_string(),
            gateway: Ipv4Addr::new(10, 101, 3, 1),
            prefix: 24,
            ranges: vec![],
            dns: vec![],
            isolated: true,
        };
        assert_eq!(net.cidr().unwrap().to_string(), "10.101.3.0/24");
    }
}
