use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Power/resolution state as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unresolved,
    /// Composed and powered off; customization is accepted from here on.
    Resolved,
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown(String),
}

impl PowerState {
    /// Parse a platform status string such as `POWERED_ON`.
    pub fn from_status(status: &str) -> Self {
        match status {
            "UNRESOLVED" => Self::Unresolved,
            "RESOLVED" => Self::Resolved,
            "POWERED_ON" => Self::PoweredOn,
            "POWERED_OFF" => Self::PoweredOff,
            "SUSPENDED" => Self::Suspended,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_status(&self) -> &str {
        match self {
            Self::Unresolved => "UNRESOLVED",
            Self::Resolved => "RESOLVED",
            Self::PoweredOn => "POWERED_ON",
            Self::PoweredOff => "POWERED_OFF",
            Self::Suspended => "SUSPENDED",
            Self::Unknown(s) => s,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }

    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status())
    }
}

/// Orchestration lifecycle of a VM or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotComposed,
    Composing,
    Resolved,
    PoweringOn,
    PoweredOn,
    Undeploying,
    PoweredOff,
    Deleted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotComposed => "not_composed",
            Self::Composing => "composing",
            Self::Resolved => "resolved",
            Self::PoweringOn => "powering_on",
            Self::PoweredOn => "powered_on",
            Self::Undeploying => "undeploying",
            Self::PoweredOff => "powered_off",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl From<&PowerState> for LifecycleState {
    fn from(p: &PowerState) -> Self {
        match p {
            PowerState::Unresolved => Self::Composing,
            PowerState::Resolved => Self::Resolved,
            PowerState::PoweredOn => Self::PoweredOn,
            PowerState::PoweredOff | PowerState::Suspended | PowerState::Unknown(_) => {
                Self::PoweredOff
            }
        }
    }
}

/// Validate that a lifecycle transition is allowed.
pub fn validate_transition(object: &str, from: LifecycleState, to: LifecycleState) -> Result<()> {
    use LifecycleState::*;

    let valid = matches!(
        (from, to),
        (NotComposed, Composing)
        | (Composing, Resolved)
        | (Resolved, PoweringOn)
        | (PoweringOn, PoweredOn)
        | (PoweredOn, Undeploying)
        | (Undeploying, PoweredOff)
        | (PoweredOff, Deleted)
        // Restart after stop
        | (PoweredOff, PoweringOn)
        // Delete a group that was never powered on
        | (Resolved, Deleted)
    );

    if valid {
        Ok(())
    } else {
        Err(Error::invalid_state(
            object,
            format!("a state that can move to {}", to),
            from,
        ))
    }
}

/// Requested power change for a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Stop,
    Reboot,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
        };
        f.write_str(s)
    }
}

/// How the platform assigns a NIC's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpAllocationMode {
    Dhcp,
    /// Caller-chosen address.
    Manual,
    /// Platform picks from the network's static range.
    Pool,
}

impl fmt::Display for IpAllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dhcp => "DHCP",
            Self::Manual => "MANUAL",
            Self::Pool => "POOL",
        };
        f.write_str(s)
    }
}

/// One NIC of a realized VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConnection {
    pub network: String,
    pub index: u32,
    pub mode: IpAllocationMode,
    pub address: Option<Ipv4Addr>,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Active,
    Shutoff,
    Other(String),
}

impl From<&PowerState> for ServerStatus {
    fn from(p: &PowerState) -> Self {
        match p {
            PowerState::PoweredOn => Self::Active,
            PowerState::PoweredOff => Self::Shutoff,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub network: String,
    pub address: Ipv4Addr,
}

/// Current status and addresses of a logical server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetail {
    pub name: String,
    pub id: String,
    pub status: ServerStatus,
    pub addresses: Vec<ServerAddress>,
}

/// One VM's slice of a group's infrastructure, from its platform metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResource {
    pub name: String,
    pub flavor: Option<String>,
    pub role: Option<String>,
    pub status: ServerStatus,
    pub addresses: Vec<ServerAddress>,
}

/// Everything a group holds on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResources {
    pub group: String,
    pub vms: Vec<VmResource>,
}
