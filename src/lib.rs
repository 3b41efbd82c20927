//! Berth - composition and orchestration for the contacts API stack
//!
//! Berth ships the contacts API's container stack (compose file, build
//! recipe, env template) and drives it:
//!
//! - Compose parsing with variable interpolation and env files
//! - Stack contract validation (names, dependencies, ports, volumes)
//! - Dependency-ordered, optionally health-gated startup
//! - Restart supervision with optional backoff
//! - Docker CLI and in-process runtimes

pub mod build;
pub mod compose;
pub mod docs;
pub mod env;
pub mod error;
pub mod runtime;
pub mod settings;
pub mod stack;
pub mod storage;
pub mod supervisor;
pub mod topology;

pub use error::{BerthError, Result};
