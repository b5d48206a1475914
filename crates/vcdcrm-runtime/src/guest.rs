//! Guest customization payloads: product properties, user data, and VM metadata.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use vcdcrm_core::error::{Error, Result};
use vcdcrm_core::spec::{Role, VmSpec};

use crate::platform::{ComputeUpdate, DiskRecord, GuestConfig};

/// VM metadata key holding the flavor name.
pub const META_FLAVOR: &str = "FlavorName";
/// VM metadata key holding the guest-visible role.
pub const META_ROLE: &str = "vmRole";

/// Parse free-form `key: value` lines; lines without a colon are ignored.
pub fn parse_metadata_lines(input: &str) -> BTreeMap<String, String> {
    input
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Base64 user data, with virtio disk names rewritten for SCSI guests.
pub fn encode_user_data(user_data: &str) -> String {
    STANDARD.encode(user_data.replace("/dev/vd", "/dev/sd"))
}

/// Role, skip flags, and control-plane address read by guest bootstrap.
pub fn guest_metadata(role: Role, master_ip: Option<Ipv4Addr>) -> BTreeMap<String, String> {
    let mut md = BTreeMap::new();
    md.insert("role".to_string(), role.to_string());
    md.insert(
        "skipk8s".to_string(),
        if role.skips_k8s() { "yes" } else { "no" }.to_string(),
    );
    if let Some(ip) = master_ip {
        md.insert("k8smaster".to_string(), ip.to_string());
    }
    md
}

/// Customization section and product properties for one VM.
///
/// App VMs only get the customization section. Control-plane roles fail
/// without a master address.
pub fn guest_config(
    spec: &VmSpec,
    vm_id: &str,
    master_ip: Option<Ipv4Addr>,
) -> Result<GuestConfig> {
    if spec.role.needs_master_address() && master_ip.is_none() {
        return Err(Error::InvalidSpec(format!(
            "VM {} has role {} but no master address is available",
            spec.name, spec.role
        )));
    }
    let properties = (spec.role != Role::VmApplication).then(|| {
        let mut props = BTreeMap::new();
        props.insert("instance-id".to_string(), vm_id.to_string());
        if let Some(ud) = spec.user_data.as_deref().filter(|u| !u.is_empty()) {
            props.insert("user-data".to_string(), encode_user_data(ud));
        }
        props.extend(guest_metadata(spec.role, master_ip));
        if let Some(extra) = &spec.metadata {
            props.extend(parse_metadata_lines(extra));
        }
        props
    });
    Ok(GuestConfig {
        computer_name: spec.hostname().to_string(),
        properties,
    })
}

/// Platform metadata tags describing the VM.
pub fn vm_metadata(spec: &VmSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("vmType".to_string(), spec.role.vm_type().to_string()),
        (META_FLAVOR.to_string(), spec.shape.flavor_name.clone()),
        (META_ROLE.to_string(), spec.role.to_string()),
    ])
}

/// Compute change for a VM whose boot disk sits at `boot_unit`.
///
/// Volumes become extra disks on the units right after the boot disk.
pub fn compute_update(spec: &VmSpec, boot_unit: u32, resize_boot_disk: bool) -> ComputeUpdate {
    ComputeUpdate {
        vcpus: spec.shape.vcpus,
        ram_mb: spec.shape.ram_mb,
        boot_disk_mb: resize_boot_disk.then_some(spec.shape.disk_gb * 1024),
        extra_disks: spec
            .volumes
            .iter()
            .zip(1u32..)
            .map(|(v, i)| DiskRecord {
                unit: boot_unit + i,
                size_mb: v.size_gb * 1024,
            })
            .collect(),
    }
}
