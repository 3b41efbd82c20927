//! Compose file handling
//!
//! Typed compose models, variable interpolation, parsing and validation,
//! and the orchestrator that runs a composition on a container runtime.

pub mod config;
pub mod interpolate;
pub mod mounts;
pub mod orchestrator;
pub mod parser;
pub mod ports;

pub use config::{ComposeConfig, ServiceConfig};
pub use orchestrator::{ComposeOrchestrator, ServiceStatus, UpReport};
pub use parser::ComposeParser;
