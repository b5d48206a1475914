// vcdcrm-runtime: Platform client seam, inventory, allocation, orchestration
// Depends on vcdcrm-core

pub mod platform;
pub mod platform_mock;

pub mod accounting;
pub mod allocator;
pub mod debug;
pub mod guest;
pub mod inventory;
pub mod orchestrator;
pub mod parallel;
pub mod reconcile;
pub mod topology;
