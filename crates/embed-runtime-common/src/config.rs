//! Configuration structures for the embed-runtime.
//!
//! This module defines configuration options for:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, optimization, stack)
//! - [`MeteringConfig`]: Gas limit and opcode cost table for metered instances
//!
//! A [`RuntimeConfig`] can be loaded from a TOML file:
//!
//! ```toml
//! [engine]
//! optimize = true
//! max_wasm_stack_kb = 512
//!
//! [metering]
//! enabled = true
//! gas_limit = 1_000_000
//! default_cost = 1
//!
//! [[metering.overrides]]
//! opcode = 0x10   # call
//! cost = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Gas metering configuration.
    #[serde(default)]
    pub metering: MeteringConfig,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect every module compiled and instantiated through
/// the same engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for fast instance creation.
    ///
    /// Useful when instances are created and closed at a high rate.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Compile with Cranelift speed optimizations.
    #[serde(default = "defaults::optimize")]
    pub optimize: bool,

    /// Maximum WebAssembly stack size in kilobytes.
    #[serde(default = "defaults::max_wasm_stack_kb")]
    pub max_wasm_stack_kb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            optimize: defaults::optimize(),
            max_wasm_stack_kb: defaults::max_wasm_stack_kb(),
        }
    }
}

/// Gas metering configuration.
///
/// The opcode cost table starts with `default_cost` for every opcode and
/// then applies `overrides` in order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeteringConfig {
    /// Instantiate modules with gas metering.
    #[serde(default)]
    pub enabled: bool,

    /// Maximum points an instance may consume.
    #[serde(default = "defaults::gas_limit")]
    pub gas_limit: u64,

    /// Cost charged for every opcode without an override.
    #[serde(default = "defaults::default_cost")]
    pub default_cost: u32,

    /// Per-opcode cost overrides.
    #[serde(default)]
    pub overrides: Vec<OpcodeCostOverride>,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gas_limit: defaults::gas_limit(),
            default_cost: defaults::default_cost(),
            overrides: Vec::new(),
        }
    }
}

/// Cost override for a single opcode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct OpcodeCostOverride {
    /// Opcode index in the cost table.
    pub opcode: u16,

    /// Points charged each time the opcode executes.
    pub cost: u32,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn optimize() -> bool {
        true
    }

    pub const fn max_wasm_stack_kb() -> u32 {
        512
    }

    pub const fn gas_limit() -> u64 {
        10_000_000
    }

    pub const fn default_cost() -> u32 {
        1
    }
}
