//! Configuration for SlotLock.
//!
//! This crate handles:
//! - System configuration (slotlock.kdl)
//! - Interpolation of predefined CI variables into resource group keys

pub mod error;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, DeduplicationConfig, RetryConfig, SystemConfig, WorkerConfig,
    load_system_config, parse_system_config,
};
pub use variables::{VariableContext, VariableContextBuilder, expand_resource_group_key};
