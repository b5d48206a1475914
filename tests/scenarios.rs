use std::net::Ipv4Addr;
use std::sync::Arc;

use vcdcrm::core::context::OpContext;
use vcdcrm::core::error::Error;
use vcdcrm::core::spec::{PortSpec, Role};
use vcdcrm::core::vm::{IpAllocationMode, NetworkConnection, PowerAction, PowerState};
use vcdcrm::runtime::allocator::{ExternalPool, next_external_address};
use vcdcrm::runtime::inventory::Inventory;
use vcdcrm::runtime::orchestrator::Orchestrator;
use vcdcrm::runtime::platform::{IpRange, PlatformClient};
use vcdcrm::runtime::platform_mock::{MockPlatform, fast_config, group_spec, vm_spec};
use vcdcrm::runtime::reconcile::reconcile;

const EXT: &str = "ext-net";

fn ext_range() -> IpRange {
    IpRange::new(
        Ipv4Addr::new(192, 168, 1, 10),
        Ipv4Addr::new(192, 168, 1, 20),
    )
}

fn platform() -> MockPlatform {
    MockPlatform::new().with_external_network(EXT, Ipv4Addr::new(192, 168, 1, 1), 24, ext_range())
}

fn orchestrator(mock: &Arc<MockPlatform>) -> Orchestrator {
    let client: Arc<dyn PlatformClient> = mock.clone();
    let orch = Orchestrator::new(client, Arc::new(Inventory::new()), fast_config()).unwrap();
    orch.reconcile().unwrap();
    orch
}

fn static_ext(addr: Ipv4Addr) -> NetworkConnection {
    NetworkConnection {
        network: EXT.to_string(),
        index: 0,
        mode: IpAllocationMode::Manual,
        address: Some(addr),
        primary: true,
    }
}

fn two_vm_cluster() -> vcdcrm::core::spec::VmGroupSpec {
    group_spec(
        "cld1",
        "clust1",
        vec![
            vm_spec(
                "clust1-lb",
                Role::Agent,
                vec![PortSpec::external(), PortSpec::internal(None)],
            ),
            vm_spec(
                "clust1-node1",
                Role::DockerNode,
                vec![PortSpec::external(), PortSpec::internal(None)],
            ),
        ],
    )
}

#[test]
fn test_new_cluster_on_empty_cloudlet() {
    let mock = Arc::new(platform().with_vm(
        "shared-vapp",
        "other-lb",
        PowerState::PoweredOn,
        vec![static_ext(Ipv4Addr::new(192, 168, 1, 10))],
    ));
    let orch = orchestrator(&mock);
    orch.create_group(&OpContext::background(), &two_vm_cluster())
        .unwrap();

    let group = mock.group("clust1-vapp").unwrap();
    assert_eq!(group.status, PowerState::PoweredOn);
    let internal = group
        .networks
        .iter()
        .find(|n| n.name == "mex-k8s-subnet-cld1-clust1-acme")
        .unwrap();
    assert_eq!(internal.gateway, Ipv4Addr::new(10, 101, 1, 1));
    assert_eq!(internal.prefix, 24);

    let lb = mock.vm("clust1-vapp", "clust1-lb").unwrap();
    let lb_ext = lb.connections.iter().find(|c| c.network == EXT).unwrap();
    assert_eq!(lb_ext.mode, IpAllocationMode::Manual);
    assert_eq!(lb_ext.address, Some(Ipv4Addr::new(192, 168, 1, 11)));
    assert_eq!(lb.status, PowerState::PoweredOn);

    let node = mock.vm("clust1-vapp", "clust1-node1").unwrap();
    let node_ext = node.connections.iter().find(|c| c.network == EXT).unwrap();
    assert_eq!(node_ext.mode, IpAllocationMode::Dhcp);
    assert_eq!(node.status, PowerState::PoweredOn);

    for vm in [&lb, &node] {
        let addr = vm
            .connections
            .iter()
            .find(|c| c.network == internal.name)
            .and_then(|c| c.address)
            .unwrap();
        assert_ne!(addr, internal.gateway);
    }
}

#[test]
fn test_create_twice_converges() {
    let mock = Arc::new(platform());
    let orch = orchestrator(&mock);
    let ctx = OpContext::background();
    orch.create_group(&ctx, &two_vm_cluster()).unwrap();
    orch.create_group(&ctx, &two_vm_cluster()).unwrap();
    assert_eq!(mock.group("clust1-vapp").unwrap().vms.len(), 2);
}

#[test]
fn test_delete_powered_on_group_undeploys_first() {
    let mock = Arc::new(platform());
    let orch = orchestrator(&mock);
    let ctx = OpContext::background();
    orch.create_group(&ctx, &two_vm_cluster()).unwrap();
    mock.clear_calls();

    orch.delete_group(&ctx, "clust1-vapp").unwrap();
    let undeploy = mock.call_index("undeploy_group clust1-vapp").unwrap();
    let delete = mock.call_index("delete_group clust1-vapp").unwrap();
    assert!(undeploy < delete);
}

#[test]
fn test_delete_powered_off_group_skips_undeploy() {
    let mock = Arc::new(platform().with_vm("old-vapp", "vm1", PowerState::PoweredOff, vec![]));
    let orch = orchestrator(&mock);
    orch.delete_group(&OpContext::background(), "old-vapp")
        .unwrap();
    assert!(mock.call_index("undeploy").is_none());
    assert_eq!(mock.calls(), vec!["delete_group old-vapp".to_string()]);
}

#[test]
fn test_start_running_vm_makes_no_platform_call() {
    let mock = Arc::new(platform().with_vm("app-vapp", "vm1", PowerState::PoweredOn, vec![]));
    let orch = orchestrator(&mock);
    let err = orch
        .set_power_state(&OpContext::background(), "vm1", PowerAction::Start)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(mock.calls().is_empty());
}

#[test]
fn test_external_pool_fully_consumed() {
    let mut m = platform();
    for (i, last) in (10u8..=20).enumerate() {
        m = m.with_vm(
            &format!("g{}-vapp", i),
            &format!("g{}-lb", i),
            PowerState::PoweredOn,
            vec![static_ext(Ipv4Addr::new(192, 168, 1, last))],
        );
    }
    let inv = Inventory::new();
    let report = reconcile(&m, &inv, &fast_config()).unwrap();
    assert!(report.skipped.is_empty());

    let net = inv.network(EXT).unwrap();
    let pool = ExternalPool::from_network(&net.config);
    let err = next_external_address(&inv.snapshot(), &pool).unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
}

#[test]
fn test_reconcile_survives_one_bad_vm() {
    let mut m = platform();
    for i in 0..10 {
        m = m.with_vm("big-vapp", &format!("vm{}", i), PowerState::PoweredOn, vec![]);
    }
    m.fail_vm_fetch("vm3");
    let inv = Inventory::new();
    let report = reconcile(&m, &inv, &fast_config()).unwrap();
    assert_eq!(report.vms, 9);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(inv.snapshot().vms.len(), 9);
}

#[test]
fn test_same_vm_name_in_two_groups_survives_restart_and_delete() {
    let mock = Arc::new(
        platform()
            .with_vm(
                "a-vapp",
                "lb",
                PowerState::PoweredOn,
                vec![static_ext(Ipv4Addr::new(192, 168, 1, 10))],
            )
            .with_vm(
                "b-vapp",
                "lb",
                PowerState::PoweredOn,
                vec![static_ext(Ipv4Addr::new(192, 168, 1, 11))],
            ),
    );
    let orch = orchestrator(&mock);
    assert_eq!(orch.inventory().snapshot().vms.len(), 2);

    orch.delete_group(&OpContext::background(), "b-vapp")
        .unwrap();
    let lb = orch.get_server_detail("lb").unwrap();
    assert_eq!(lb.addresses[0].address, Ipv4Addr::new(192, 168, 1, 10));

    let inv = orch.inventory();
    assert_eq!(inv.snapshot().vms.len(), 1);
    let pool = ExternalPool::from_network(&inv.network(EXT).unwrap().config);
    assert_eq!(
        next_external_address(&inv.snapshot(), &pool).unwrap(),
        Ipv4Addr::new(192, 168, 1, 11)
    );
}
