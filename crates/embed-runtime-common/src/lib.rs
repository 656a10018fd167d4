//! Common errors and configuration for embed-runtime.
//!
//! This crate provides shared functionality used across the embed-runtime workspace:
//! - Error types using `thiserror`, one per stage of the embedding lifecycle
//! - Configuration structures for the engine and gas metering

pub mod config;
pub mod error;

pub use config::{EngineConfig, MeteringConfig, OpcodeCostOverride, RuntimeConfig};
pub use error::{
    ConfigError, ExportError, HostError, InstanceError, MemoryError, MeteringError,
    RegistrationError, UNKNOWN_DETAILS, ValueError,
};
