//! WebAssembly instance lifecycle management.
//!
//! An [`Instance`] owns the store its module runs in. Its lifecycle is:
//!
//! 1. Materialize imports (or borrow them from an [`ImportObject`])
//! 2. Optionally inject gas metering into the module bytes
//! 3. Compile and instantiate with a fresh store
//! 4. Walk the exports into a call table
//! 5. Serve calls until [`Instance::close`] or drop

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use wasmtime::{AsContext, AsContextMut, Linker, Module, Store, Val};

use embed_runtime_common::{ExportError, InstanceError};

use crate::context::{StoreState, read_points};
use crate::exports::{ExportTable, ExportedFunction};
use crate::imports::{ImportObject, Imports};
use crate::memory::{MemoryView, MemoryViewMut};
use crate::metering::{OpcodeCosts, inject_gas_metering};
use crate::value::Value;
use crate::WasmEngine;

/// Gas settings for a metered instantiation.
#[derive(Debug, Clone, Copy)]
struct Metering<'a> {
    gas_limit: u64,
    costs: &'a OpcodeCosts,
}

/// An instantiated WebAssembly module.
///
/// `T` is the type of the context data host functions can reach through
/// [`InstanceContext`](crate::InstanceContext).
///
/// # Thread Safety
///
/// Every operation that runs guest code takes `&mut self`, so calls on one
/// instance are serialized. Distinct instances are independent.
pub struct Instance<T: 'static = ()> {
    store: Option<Store<StoreState<T>>>,
    /// Imports this instance materialized itself and must release.
    imports: Option<Imports<T>>,
    exports: ExportTable,
    gas_limit: Option<u64>,
}

impl<T: 'static> Instance<T> {
    /// Instantiate a module without imports.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Instantiation`] if the engine rejects the
    /// module, e.g. because it is malformed or needs imports.
    pub fn new(engine: &WasmEngine, bytes: &[u8]) -> Result<Self, InstanceError> {
        Self::with_imports(engine, bytes, Imports::new())
    }

    /// Instantiate a module against `imports`.
    ///
    /// The instance takes ownership of the imports and releases them on close.
    pub fn with_imports(
        engine: &WasmEngine,
        bytes: &[u8],
        imports: Imports<T>,
    ) -> Result<Self, InstanceError> {
        Self::from_owned_imports(engine, bytes, imports, None)
    }

    /// Instantiate a module against shared imports.
    pub fn with_import_object(
        engine: &WasmEngine,
        bytes: &[u8],
        import_object: &ImportObject<T>,
    ) -> Result<Self, InstanceError> {
        let linker = import_object.linker(engine)?;
        Self::instantiate(engine, bytes, linker, None, None)
    }

    /// Instantiate a metered module against `imports`.
    ///
    /// Every executed instruction is charged according to `costs`; a call
    /// that would exceed `gas_limit` traps.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`Instance::with_imports`], fails if the module
    /// uses instructions that cannot be metered.
    pub fn metered_with_imports(
        engine: &WasmEngine,
        bytes: &[u8],
        imports: Imports<T>,
        gas_limit: u64,
        costs: &OpcodeCosts,
    ) -> Result<Self, InstanceError> {
        let metering = Metering { gas_limit, costs };
        Self::from_owned_imports(engine, bytes, imports, Some(metering))
    }

    /// Instantiate a metered module against shared imports.
    ///
    /// The import object stays owned by the caller and is never released
    /// by the instance.
    pub fn metered_with_import_object(
        engine: &WasmEngine,
        bytes: &[u8],
        import_object: &ImportObject<T>,
        gas_limit: u64,
        costs: &OpcodeCosts,
    ) -> Result<Self, InstanceError> {
        let linker = import_object.linker(engine)?;
        let metering = Metering { gas_limit, costs };
        Self::instantiate(engine, bytes, linker, Some(metering), None)
    }

    fn from_owned_imports(
        engine: &WasmEngine,
        bytes: &[u8],
        mut imports: Imports<T>,
        metering: Option<Metering<'_>>,
    ) -> Result<Self, InstanceError> {
        let linker = Arc::clone(imports.materialize(engine)?.linker());
        Self::instantiate(engine, bytes, &linker, metering, Some(imports))
    }

    #[instrument(
        skip_all,
        fields(bytes_len = bytes.len(), metered = metering.is_some())
    )]
    fn instantiate(
        engine: &WasmEngine,
        bytes: &[u8],
        linker: &Linker<StoreState<T>>,
        metering: Option<Metering<'_>>,
        imports: Option<Imports<T>>,
    ) -> Result<Self, InstanceError> {
        let bytes = match metering {
            Some(Metering { gas_limit, costs }) => {
                let binary = wat::parse_bytes(bytes)
                    .map_err(|e| InstanceError::instantiation(e.to_string()))?;
                let injected = inject_gas_metering(&binary, gas_limit, costs)
                    .map_err(|e| InstanceError::instantiation(e.to_string()))?;
                Cow::Owned(injected)
            }
            None => Cow::Borrowed(bytes),
        };

        let module = Module::new(engine.inner(), &bytes)
            .map_err(|e| InstanceError::instantiation(format!("{e:#}")))?;

        let mut store = Store::new(engine.inner(), StoreState::new());
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| InstanceError::instantiation(format!("{e:#}")))?;

        let exports = ExportTable::collect(&instance, &mut store, metering.is_some());
        store.data_mut().memory = exports.memory;
        store.data_mut().points = exports.points;

        info!(
            exports = exports.functions().len(),
            has_memory = exports.memory.is_some(),
            gas_limit = metering.map(|m| m.gas_limit),
            "Module instantiated"
        );

        Ok(Self {
            store: Some(store),
            imports,
            exports,
            gas_limit: metering.map(|m| m.gas_limit),
        })
    }

    /// Call the exported function `name`.
    ///
    /// Returns [`Value::Void`] for functions without results.
    ///
    /// # Errors
    ///
    /// - [`ExportError::NotFound`] for an unknown or skipped export
    /// - [`ExportError::MissingArguments`] / [`ExportError::ExtraArguments`]
    ///   for an arity mismatch, and [`ExportError::ArgumentType`] for a
    ///   kind mismatch; the engine is not invoked in either case
    /// - [`ExportError::CallFailed`] if the function trapped, a host
    ///   function failed, or gas ran out
    #[instrument(skip(self, args), fields(args = args.len()))]
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ExportError> {
        let store = self.store.as_mut().ok_or(ExportError::Closed)?;
        let function = self
            .exports
            .get(name)
            .ok_or_else(|| ExportError::NotFound {
                function: name.to_string(),
            })?;

        let result = function.invoke(store, args);

        if let (Err(ExportError::CallFailed { .. }), Some(gas_limit)) = (&result, self.gas_limit) {
            let points_used = self.points_used();
            if points_used > gas_limit {
                warn!(
                    function = name,
                    points_used, gas_limit, "Execution terminated: gas exhausted"
                );
            }
        }

        result
    }

    /// Descriptor of the exported function `name`.
    pub fn export(&self, name: &str) -> Option<&ExportedFunction> {
        self.exports.get(name)
    }

    /// Callable exports in engine order.
    pub fn exports(&self) -> &[ExportedFunction] {
        self.exports.functions()
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.export(name).is_some()
    }

    /// Returns `true` if the module exports a linear memory.
    pub fn has_memory(&self) -> bool {
        self.store.is_some() && self.exports.memory.is_some()
    }

    pub fn memory(&self) -> Option<MemoryView<'_, T>> {
        let store = self.store.as_ref()?;
        let memory = self.exports.memory?;
        Some(MemoryView::new(memory, store.as_context()))
    }

    pub fn memory_mut(&mut self) -> Option<MemoryViewMut<'_, T>> {
        let store = self.store.as_mut()?;
        let memory = self.exports.memory?;
        Some(MemoryViewMut::new(memory, store.as_context_mut()))
    }

    /// Attach data that imported functions can reach through their context.
    ///
    /// Replaces any previously attached data.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Closed`] on a closed instance.
    pub fn set_context_data(&mut self, data: T) -> Result<(), InstanceError> {
        let store = self.store.as_mut().ok_or(InstanceError::Closed)?;
        store.data_mut().context_data = Some(data);
        Ok(())
    }

    pub fn context_data(&self) -> Option<&T> {
        self.store.as_ref()?.data().context_data.as_ref()
    }

    pub fn context_data_mut(&mut self) -> Option<&mut T> {
        self.store.as_mut()?.data_mut().context_data.as_mut()
    }

    pub fn is_metered(&self) -> bool {
        self.gas_limit.is_some()
    }

    pub fn gas_limit(&self) -> Option<u64> {
        self.gas_limit
    }

    /// Points consumed so far; 0 for a non-metered or closed instance.
    pub fn points_used(&mut self) -> u64 {
        match (self.store.as_mut(), self.exports.points) {
            (Some(store), Some(global)) => read_points(&global, store),
            _ => 0,
        }
    }

    /// Overwrite the consumed points, e.g. to reset the budget between
    /// calls. Does nothing on a non-metered or closed instance.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_points_used(&mut self, points: u64) {
        if let (Some(store), Some(global)) = (self.store.as_mut(), self.exports.points) {
            if let Err(e) = global.set(store, Val::I64(points as i64)) {
                warn!(error = %e, "Failed to set points used");
            }
        }
    }

    /// Destroy the instance and hand back the imports it owned, ready to
    /// instantiate another module.
    ///
    /// The imports stay materialized, so a later instantiation on the same
    /// engine reuses their linker. Returns `None` for instances created from
    /// an [`ImportObject`].
    pub fn into_imports(mut self) -> Option<Imports<T>> {
        let imports = self.imports.take();
        self.close();
        imports
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// Release the instance: owned imports first, then the store.
    ///
    /// Imports that came from an [`ImportObject`] are left alone. Calling
    /// this more than once has no effect.
    pub fn close(&mut self) {
        if self.store.is_none() && self.imports.is_none() {
            return;
        }

        if let Some(mut imports) = self.imports.take() {
            imports.close();
        }
        self.exports = ExportTable::default();
        self.store = None;

        info!("Instance closed");
    }
}

impl<T: 'static> Drop for Instance<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: 'static> std::fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("exports", &self.exports.functions().len())
            .field("has_memory", &self.has_memory())
            .field("gas_limit", &self.gas_limit)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
