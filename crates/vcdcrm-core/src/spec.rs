use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::naming::{self, NetworkOwner};

/// What a VM does inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Gateway / load balancer with a static external address.
    Agent,
    /// Cloudlet anchor VM, also externally addressed.
    Platform,
    Master,
    K8sNode,
    DockerNode,
    VmApplication,
}

impl Role {
    /// Roles that own a static, manually allocated external address.
    pub fn needs_static_external(self) -> bool {
        matches!(self, Self::Agent | Self::Platform)
    }

    /// Roles that join a Kubernetes control plane and need its address.
    pub fn needs_master_address(self) -> bool {
        matches!(self, Self::Master | Self::K8sNode)
    }

    /// VM type recorded in platform metadata.
    pub fn vm_type(self) -> &'static str {
        match self {
            Self::Agent => "rootlb",
            Self::Platform => "platform",
            Self::Master => "cluster-master",
            Self::K8sNode => "cluster-k8s-node",
            Self::DockerNode => "cluster-docker-node",
            Self::VmApplication => "appvm",
        }
    }

    /// Whether guest bootstrap should skip Kubernetes setup.
    pub fn skips_k8s(self) -> bool {
        !self.needs_master_address()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agent => "mex-agent-node",
            Self::Platform => "platform",
            Self::Master => "k8s-master",
            Self::K8sNode => "k8s-node",
            Self::DockerNode => "docker-node",
            Self::VmApplication => "vmapp",
        };
        f.write_str(s)
    }
}

/// Compute size for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeShape {
    pub flavor_name: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

/// Additional data disk attached after the boot disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortNetwork {
    External,
    Internal,
}

/// One network attachment requested for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub network: PortNetwork,
    /// Last octet of a fixed internal address. Ignored for external ports,
    /// whose address comes from the external pool.
    #[serde(default)]
    pub fixed_last_octet: Option<u8>,
}

impl PortSpec {
    pub fn external() -> Self {
        Self {
            network: PortNetwork::External,
            fixed_last_octet: None,
        }
    }

    pub fn internal(fixed_last_octet: Option<u8>) -> Self {
        Self {
            network: PortNetwork::Internal,
            fixed_last_octet,
        }
    }
}

/// Orchestration input for a single VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub role: Role,
    pub image: String,
    pub shape: ComputeShape,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    /// Free-form `key: value` lines passed through to guest properties.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl VmSpec {
    pub fn wants_external(&self) -> bool {
        self.ports.iter().any(|p| p.network == PortNetwork::External)
    }

    pub fn internal_port(&self) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.network == PortNetwork::Internal)
    }

    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }
}

/// Orchestration input for a whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmGroupSpec {
    pub cloudlet: String,
    pub cluster: String,
    pub org: String,
    pub vms: Vec<VmSpec>,
}

impl VmGroupSpec {
    pub fn group_name(&self) -> String {
        naming::group_name(&self.cluster)
    }

    pub fn owner(&self) -> NetworkOwner {
        NetworkOwner::new(&self.cloudlet, &self.cluster, &self.org)
    }

    pub fn needs_internal_network(&self) -> bool {
        self.vms.iter().any(|vm| vm.internal_port().is_some())
    }

    /// Fixed internal last octet of the master VM, if the group has one.
    pub fn master_octet(&self) -> Option<u8> {
        self.vms
            .iter()
            .find(|vm| vm.role == Role::Master)
            .and_then(|vm| vm.internal_port())
            .and_then(|p| p.fixed_last_octet)
    }

    /// Reject requests that can never be realized.
    pub fn validate(&self) -> Result<()> {
        self.owner()
            .validate()
            .map_err(|e| Error::InvalidSpec(e.to_string()))?;
        if self.vms.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "group {} has no VMs",
                self.group_name()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for vm in &self.vms {
            if vm.name.is_empty() {
                return Err(Error::InvalidSpec("VM name must not be empty".to_string()));
            }
            if vm.name.contains('/') {
                return Err(Error::InvalidSpec(format!(
                    "VM name {} must not contain '/'",
                    vm.name
                )));
            }
            if !seen.insert(vm.name.as_str()) {
                return Err(Error::InvalidSpec(format!("duplicate VM name {}", vm.name)));
            }
            if let Some(octet) = vm.internal_port().and_then(|p| p.fixed_last_octet)
                && matches!(octet, 0 | 1 | 255)
            {
                return Err(Error::InvalidSpec(format!(
                    "VM {} requests reserved internal octet .{}",
                    vm.name, octet
                )));
            }
        }
        Ok(())
    }
}
