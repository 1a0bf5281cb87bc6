//! Shared types, error model, clock, and configuration for cartograph.
//!
//! This crate is the foundation depended on by all other cartograph crates.
//! It provides:
//! - [`CartographError`] and [`AgentError`]: the error model
//! - Domain types ([`Job`], [`FactDelta`], [`FactRecord`], [`ChangeRecord`], ...)
//! - [`Clock`]: the time source used by everything schedule-related
//! - Configuration ([`AppConfig`], config loading)

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgentConfig, AgentsConfig, AppConfig, BreakerConfig, Cadence, ChangeDetectionConfig,
    PipelineConfig, ProviderEntry, ProviderKind, RetryConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, resolve_db_path, validate_credentials,
};
pub use error::{AgentError, CartographError, Result};
pub use types::{
    AgentType, AttemptRecord, CURRENT_SCHEMA_VERSION, ChangeRecord, CircuitState, Entity,
    EntityId, EntityKind, FactDelta, FactGroup, FactRecord, FailureNote, FieldDelta,
    IdempotencyKey, Job, JobId, JobStatus, PassKind, ProviderState, TRAFFIC_FIELD, TimeRange,
    groups,
};
