//! Core types for the restraint subsystem.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (InstanceId, ConstraintId, ResourceUnit)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for coordinator, sweeper, and retention

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ConstraintDefinition, CoordinatorConfig, ObservabilityConfig, RetentionConfig,
    RetryConfig, ShardConfig, SweeperConfig, ENV_SWEEP_INTERVAL, ENV_SWEEP_SHARD,
};
pub use errors::{Error, Result};
pub use ids::{ConstraintId, InstanceId, ResourceUnit};
