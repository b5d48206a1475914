//! # vcdcrm: Cloudlet resource orchestration engine
//!
//! Facade crate that re-exports the vcdcrm workspace crates so a host
//! process can depend on a single `vcdcrm` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | vcdcrm-core | Errors, naming, group specs, config, retry, credentials |
//! | [`runtime`] | vcdcrm-runtime | Platform client seam, inventory, allocator, orchestrator, accounting |

pub use vcdcrm_core as core;
pub use vcdcrm_runtime as runtime;

pub mod engine;
pub mod observability;

pub use engine::Engine;
