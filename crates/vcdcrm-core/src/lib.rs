// vcdcrm-core: Pure types, naming, config, utilities
// No platform I/O; everything else builds on this crate.

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod naming;
pub mod retry;
pub mod spec;
pub mod vm;

pub use error::{Error, ObjectKind, PlatformError, Result};
