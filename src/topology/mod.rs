//! Service topology
//!
//! Start ordering derived from declared dependencies, and the contract the
//! contacts stack's composition has to satisfy.

pub mod contract;
pub mod plan;

pub use contract::{ContractReport, Finding, StackContract, Violation};
pub use plan::StartPlan;
