use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;

use vcdcrm::Engine;
use vcdcrm::core::credentials::{Credentials, StaticCredentialProvider};
use vcdcrm::core::vm::PowerState;
use vcdcrm::runtime::debug;
use vcdcrm::runtime::platform::{IpRange, PlatformClient};
use vcdcrm::runtime::platform_mock::MockPlatform;

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(body.as_bytes()).unwrap();
    f
}

fn mock() -> Arc<MockPlatform> {
    Arc::new(
        MockPlatform::new()
            .with_external_network(
                "public",
                Ipv4Addr::new(203, 0, 113, 1),
                24,
                IpRange::new(Ipv4Addr::new(203, 0, 113, 10), Ipv4Addr::new(203, 0, 113, 19)),
            )
            .with_vm("app-vapp", "vm1", PowerState::PoweredOn, vec![]),
    )
}

#[test]
fn test_engine_starts_from_config_file() {
    let cfg = write_config(
        r#"
[platform]
external_network = "public"

[orchestrator]
task_poll_interval_ms = 1
cpu_speed_override_mhz = 1000
"#,
    );
    let m = mock();
    let client: Arc<dyn PlatformClient> = m.clone();
    let engine = Engine::from_config_file(cfg.path(), client).unwrap();

    let inv = engine.orchestrator().inventory();
    assert!(inv.group("app-vapp").is_some());
    assert!(inv.network("public").is_some());

    let usage = engine.resource_usage().unwrap();
    assert_eq!(usage.vcpu_max, 40);
    assert_eq!(usage.external_ips_max, 10);

    let dump = debug::dump_inventory(inv).unwrap();
    assert!(dump.contains("app-vapp"));
    assert!(m.calls().is_empty());
}

#[test]
fn test_engine_refuses_to_start_without_vdc() {
    let cfg = write_config(
        r#"
[platform]
vdc = "missing"
"#,
    );
    let client: Arc<dyn PlatformClient> = mock();
    let err = Engine::from_config_file(cfg.path(), client)
        .err()
        .unwrap();
    assert!(format!("{:#}", err).contains("reconciliation"));
}

#[test]
fn test_engine_rejects_bad_config() {
    let cfg = write_config("[network]\ninternal_base = \"10.300\"\n");
    let client: Arc<dyn PlatformClient> = mock();
    assert!(Engine::from_config_file(cfg.path(), client).is_err());
}

#[test]
fn test_load_credentials() {
    let provider = StaticCredentialProvider::new(Credentials {
        endpoint: "https://vcd.example.net/api".to_string(),
        username: "svc".to_string(),
        password: "hunter2".to_string().into(),
        org: "mex".to_string(),
        vdc: "mex-vdc".to_string(),
    });
    let config = vcdcrm::core::config::OrchestratorConfig::default();
    let creds = vcdcrm::engine::load_credentials(&provider, &config, "cld1-phys").unwrap();
    assert_eq!(creds.username, "svc");
    assert!(!format!("{:?}", creds).contains("hunter2"));
}
