//! Test registry and configuration space for tcforge runs.

pub mod config;
pub mod registry;

pub use config::*;
pub use registry::*;
