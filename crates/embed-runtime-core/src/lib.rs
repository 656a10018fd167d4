//! Embedding layer for WebAssembly modules on top of Wasmtime.
//!
//! This crate provides:
//! - [`WasmEngine`]: Configured Wasmtime engine shared by all instances
//! - [`Imports`] and [`ImportObject`]: Host functions exposed to modules
//! - [`Instance`]: Instance lifecycle and calls into exported functions
//! - [`Value`] and [`FunctionSignature`]: Values crossing the host boundary
//! - [`MemoryView`] and [`MemoryViewMut`]: Access to exported linear memory
//! - [`OpcodeCosts`]: Per-opcode costs for gas-metered instances
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared, thread-safe)                                  │
//! │  - Compilation settings                                 │
//! │  - Optional pooling allocator                           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │             Imports<T> / ImportObject<T>                │
//! │  (Registered once, materialized into a Linker)          │
//! │  - namespace → name → host function                     │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Store<StoreState<T>> + Instance                │
//! │  (Per instance, isolated)                               │
//! │  - Exported functions and memory                        │
//! │  - Context data for host functions                      │
//! │  - Injected gas counter when metered                    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use embed_runtime_core::{Imports, Instance, InstanceContext, Value, WasmEngine};
//!
//! let engine = WasmEngine::default();
//! let mut imports = Imports::<()>::new();
//! imports.append("env", "sum", |_: &mut InstanceContext<'_, ()>, a: i32, b: i32| a + b)?;
//!
//! let mut instance = Instance::with_imports(&engine, &bytes, imports)?;
//! let result = instance.call("add_via_import", &[Value::I32(3), Value::I32(4)])?;
//! assert_eq!(result, Value::I32(7));
//! ```

pub mod context;
pub mod engine;
pub mod exports;
pub mod imports;
pub mod instance;
pub mod memory;
pub mod metering;
pub mod value;

pub use context::InstanceContext;
pub use engine::WasmEngine;
pub use exports::ExportedFunction;
pub use imports::{
    HostCallback, HostFunction, HostReturn, ImportFunction, ImportObject, ImportRecord, Imports,
    MaterializedImports,
};
pub use instance::Instance;
pub use memory::{MemoryView, MemoryViewMut, PAGE_SIZE};
pub use metering::{OPCODE_COUNT, OpcodeCosts, POINTS_USED_EXPORT, inject_gas_metering};
pub use value::{FunctionSignature, Value, ValueKind, WasmType};
