use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::naming::DEFAULT_INTERNAL_NET_PREFIX;
use crate::retry::PollPolicy;

/// Top-level orchestrator configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

/// Where the cloudlet lives on the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_org")]
    pub org: String,
    #[serde(default = "default_vdc")]
    pub vdc: String,
    /// Shared external network the cloudlet routes through.
    #[serde(default = "default_external_network")]
    pub external_network: String,
    #[serde(default = "default_catalog")]
    pub catalog: String,
    /// Template composed into every new group.
    #[serde(default = "default_template")]
    pub template: String,
    /// Log platform payloads at debug level.
    #[serde(default)]
    pub verbose: bool,
}

/// Internal network addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_internal_net_prefix")]
    pub internal_net_prefix: String,
    /// First two octets of every internal /24, e.g. "10.101".
    #[serde(default = "default_internal_base")]
    pub internal_base: String,
    #[serde(default = "default_internal_start_octet")]
    pub internal_start_octet: u8,
    #[serde(default = "default_internal_max_octet")]
    pub internal_max_octet: u8,
    /// Static range is `.2 ..= .static_range_size`.
    #[serde(default = "default_static_range_size")]
    pub static_range_size: u8,
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,
}

/// Lifecycle behavior and wait budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default)]
    pub enable_disk_resize: bool,
    #[serde(default = "default_true")]
    pub vm_href_cache_enabled: bool,
    /// vCPU speed in MHz used for accounting; 0 means ask the platform.
    #[serde(default)]
    pub cpu_speed_override_mhz: u64,
    #[serde(default = "default_task_poll_interval")]
    pub task_poll_interval_ms: u64,
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,
    #[serde(default = "default_power_on_max_attempts")]
    pub power_on_max_attempts: u32,
    #[serde(default = "default_conflict_retry_attempts")]
    pub conflict_retry_attempts: u32,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_region() -> String {
    "local".to_string()
}
fn default_org() -> String {
    "mex".to_string()
}
fn default_vdc() -> String {
    "mex-vdc".to_string()
}
fn default_external_network() -> String {
    "ext-net".to_string()
}
fn default_catalog() -> String {
    "mex-catalog".to_string()
}
fn default_template() -> String {
    "mex-base".to_string()
}
fn default_internal_net_prefix() -> String {
    DEFAULT_INTERNAL_NET_PREFIX.to_string()
}
fn default_internal_base() -> String {
    "10.101".to_string()
}
fn default_internal_start_octet() -> u8 {
    1
}
fn default_internal_max_octet() -> u8 {
    255
}
fn default_static_range_size() -> u8 {
    100
}
fn default_dns_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
}
fn default_true() -> bool {
    true
}
fn default_task_poll_interval() -> u64 {
    3000
}
fn default_task_max_attempts() -> u32 {
    80
}
fn default_power_on_max_attempts() -> u32 {
    40
}
fn default_conflict_retry_attempts() -> u32 {
    3
}
fn default_batch_concurrency() -> usize {
    4
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            region: default_region(),
            org: default_org(),
            vdc: default_vdc(),
            external_network: default_external_network(),
            catalog: default_catalog(),
            template: default_template(),
            verbose: false,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            internal_net_prefix: default_internal_net_prefix(),
            internal_base: default_internal_base(),
            internal_start_octet: default_internal_start_octet(),
            internal_max_octet: default_internal_max_octet(),
            static_range_size: default_static_range_size(),
            dns_servers: default_dns_servers(),
        }
    }
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            enable_disk_resize: false,
            vm_href_cache_enabled: true,
            cpu_speed_override_mhz: 0,
            task_poll_interval_ms: default_task_poll_interval(),
            task_max_attempts: default_task_max_attempts(),
            power_on_max_attempts: default_power_on_max_attempts(),
            conflict_retry_attempts: default_conflict_retry_attempts(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl OrchestratorConfig {
    /// Load config from a TOML file, apply environment overrides, and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read orchestrator config: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).with_context(|| "Failed to parse orchestrator config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the operator-facing environment properties on top of the file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("VCD_OVERRIDE_VCPU_SPEED") {
            self.orchestrator.cpu_speed_override_mhz = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid VCD_OVERRIDE_VCPU_SPEED: {:?}", v))?;
        }
        if let Ok(v) = std::env::var("MEX_ENABLE_VCD_DISK_RESIZE") {
            self.orchestrator.enable_disk_resize = parse_bool(&v)
                .with_context(|| format!("Invalid MEX_ENABLE_VCD_DISK_RESIZE: {:?}", v))?;
        }
        if let Ok(v) = std::env::var("VCD_VM_HREF_CACHE_ENABLED") {
            self.orchestrator.vm_href_cache_enabled = parse_bool(&v)
                .with_context(|| format!("Invalid VCD_VM_HREF_CACHE_ENABLED: {:?}", v))?;
        }
        if let Ok(v) = std::env::var("MEX_CATALOG")
            && !v.is_empty()
        {
            self.platform.catalog = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.platform.external_network.is_empty() {
            anyhow::bail!("platform.external_network must not be empty");
        }
        if self.platform.catalog.is_empty() || self.platform.template.is_empty() {
            anyhow::bail!("platform.catalog and platform.template must not be empty");
        }
        self.internal_base_octets()?;
        let net = &self.network;
        if net.internal_start_octet == 0 || net.internal_start_octet > net.internal_max_octet {
            anyhow::bail!(
                "network.internal_start_octet must be in 1..={}, got {}",
                net.internal_max_octet,
                net.internal_start_octet
            );
        }
        if !(2..=253).contains(&net.static_range_size) {
            anyhow::bail!(
                "network.static_range_size must be in 2..=253, got {}",
                net.static_range_size
            );
        }
        if self.orchestrator.task_max_attempts == 0 || self.orchestrator.power_on_max_attempts == 0
        {
            anyhow::bail!("orchestrator poll attempt budgets must be at least 1");
        }
        if self.orchestrator.batch_concurrency == 0 {
            anyhow::bail!("orchestrator.batch_concurrency must be at least 1");
        }
        Ok(())
    }

    /// First two octets of the internal address space.
    pub fn internal_base_octets(&self) -> Result<(u8, u8)> {
        let base = &self.network.internal_base;
        let parts: Vec<&str> = base.split('.').collect();
        if parts.len() != 2 {
            anyhow::bail!("network.internal_base must be two octets like 10.101, got {:?}", base);
        }
        let a = parts[0]
            .parse()
            .with_context(|| format!("Invalid octet in network.internal_base: {:?}", base))?;
        let b = parts[1]
            .parse()
            .with_context(|| format!("Invalid octet in network.internal_base: {:?}", base))?;
        Ok((a, b))
    }

    pub fn cpu_speed_override(&self) -> Option<u64> {
        Some(self.orchestrator.cpu_speed_override_mhz).filter(|s| *s > 0)
    }

    /// Budget for a platform task or a resolve wait.
    pub fn task_poll_policy(&self) -> PollPolicy {
        PollPolicy::fixed(
            Duration::from_millis(self.orchestrator.task_poll_interval_ms),
            self.orchestrator.task_max_attempts,
        )
    }

    /// Budget for waiting on a group to report every VM powered on.
    pub fn power_on_poll_policy(&self) -> PollPolicy {
        PollPolicy::exponential(
            Duration::from_millis(self.orchestrator.task_poll_interval_ms),
            self.orchestrator.power_on_max_attempts,
        )
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => anyhow::bail!("not a boolean: {:?}", other),
    }
}
