//! Environment configuration surface
//!
//! Shared secrets and settings reach the stack through env files rather
//! than through the compose file itself.

pub mod contract;
pub mod file;

pub use contract::{ContractCheck, EnvContract, Setting, SettingKind, APP_SETTINGS};
pub use file::{resolve_environment, EnvFile};
