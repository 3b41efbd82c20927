//! Storage management module
//!
//! Durable storage for services, independent of container lifecycle.

pub mod volume;

pub use volume::{Volume, VolumeManager};
