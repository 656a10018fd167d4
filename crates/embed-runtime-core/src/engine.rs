//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] compiles every module and owns no per-instance state.
//! All instances and import objects that interact must come from the same
//! engine.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, OptLevel, PoolingAllocationConfig};

use embed_runtime_common::{ConfigError, EngineConfig};

/// Thread-safe WebAssembly engine wrapper.
///
/// Cloning is cheap; clones share the underlying Wasmtime [`Engine`].
///
/// # Example
///
/// ```ignore
/// use embed_runtime_common::EngineConfig;
/// use embed_runtime_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Wasmtime rejects the configuration, e.g. when the
    /// pooling allocator cannot reserve its slots.
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.cranelift_opt_level(if config.optimize {
            OptLevel::Speed
        } else {
            OptLevel::None
        });

        wasmtime_config.max_wasm_stack(config.max_wasm_stack_kb as usize * 1024);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            ConfigError::invalid(format!("Failed to create Wasmtime engine: {e:#}"))
        })?;

        info!(optimize = config.optimize, "Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Returns `true` if both handles refer to the same engine.
    pub fn same(&self, other: &Self) -> bool {
        Engine::same(&self.engine, &other.engine)
    }
}

impl Default for WasmEngine {
    /// Wasmtime's default engine, which matches [`EngineConfig::default`].
    fn default() -> Self {
        Self {
            engine: Arc::new(Engine::default()),
            config: EngineConfig::default(),
        }
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("optimize", &self.config.optimize)
            .field("max_wasm_stack_kb", &self.config.max_wasm_stack_kb)
            .finish_non_exhaustive()
    }
}
