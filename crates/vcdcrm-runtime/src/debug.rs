//! Operator hooks for inspecting and resetting the cached inventory.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::inventory::Inventory;

/// Whole inventory as pretty JSON.
pub fn dump_inventory(inv: &Inventory) -> Result<String> {
    serde_json::to_string_pretty(&inv.snapshot()).context("Failed to serialize inventory")
}

/// Group records whose name matches `pattern`, one JSON document each.
///
/// `all` selects every group.
pub fn dump_groups(inv: &Inventory, pattern: &str) -> Result<Vec<String>> {
    let pattern = if pattern == "all" { ".*" } else { pattern };
    let re = Regex::new(&format!("^(?:{})$", pattern))
        .with_context(|| format!("Invalid group pattern: {}", pattern))?;
    inv.read(|st| {
        st.groups
            .iter()
            .filter(|(name, _)| re.is_match(name))
            .map(|(name, g)| {
                serde_json::to_string_pretty(g)
                    .with_context(|| format!("Failed to serialize group {}", name))
            })
            .collect()
    })
}

/// Drop every cached object, reservation, and href entry.
pub fn clear_inventory(inv: &Inventory) {
    inv.clear();
    info!("inventory cleared");
}

/// Cached `group/vm` to href entries as pretty JSON.
pub fn dump_vm_hrefs(inv: &Inventory) -> Result<String> {
    serde_json::to_string_pretty(&inv.dump_vm_hrefs()).context("Failed to serialize VM href cache")
}

/// Forget cached VM hrefs; the next lookups go by name.
pub fn clear_vm_hrefs(inv: &Inventory) {
    let dropped = inv.dump_vm_hrefs().len();
    inv.clear_vm_hrefs();
    info!(dropped, "VM href cache cleared");
}
