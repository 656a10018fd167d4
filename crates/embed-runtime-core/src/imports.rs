//! Host functions exposed to WebAssembly modules.
//!
//! This module provides:
//! - [`Imports`]: Registry of host functions keyed by namespace and name
//! - [`HostFunction`]: Typed closures usable as imported functions
//! - [`ImportRecord`] and [`MaterializedImports`]: The engine-facing form of a registry
//! - [`ImportObject`]: Materialized imports shared by several instances
//!
//! Every imported function receives an [`InstanceContext`] as its first
//! argument, followed by its WebAssembly parameters:
//!
//! ```ignore
//! let mut imports = Imports::<()>::new();
//! imports.append("env", "sum", |_ctx: &mut InstanceContext<'_, ()>, a: i32, b: i32| a + b)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};
use wasmtime::{Caller, Engine, Linker, Val};

use embed_runtime_common::{HostError, InstanceError, RegistrationError};

use crate::context::{InstanceContext, StoreState};
use crate::value::{FunctionSignature, Value, ValueKind, WasmType};
use crate::WasmEngine;

/// Type-erased host callback.
pub type HostCallback<T> =
    Arc<dyn Fn(&mut InstanceContext<'_, T>, &[Value]) -> Result<Value, HostError> + Send + Sync>;

fn erase<T, F>(callback: F) -> HostCallback<T>
where
    T: 'static,
    F: Fn(&mut InstanceContext<'_, T>, &[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Return types accepted from typed host functions.
pub trait HostReturn {
    /// Declared output kinds; empty or a single kind.
    fn outputs() -> Vec<ValueKind>;

    fn into_result(self) -> Result<Value, HostError>;
}

impl HostReturn for () {
    fn outputs() -> Vec<ValueKind> {
        Vec::new()
    }

    fn into_result(self) -> Result<Value, HostError> {
        Ok(Value::Void)
    }
}

impl<X: WasmType> HostReturn for X {
    fn outputs() -> Vec<ValueKind> {
        vec![X::KIND]
    }

    fn into_result(self) -> Result<Value, HostError> {
        Ok(self.into_value())
    }
}

impl HostReturn for Result<(), HostError> {
    fn outputs() -> Vec<ValueKind> {
        Vec::new()
    }

    fn into_result(self) -> Result<Value, HostError> {
        self.map(|()| Value::Void)
    }
}

impl<X: WasmType> HostReturn for Result<X, HostError> {
    fn outputs() -> Vec<ValueKind> {
        vec![X::KIND]
    }

    fn into_result(self) -> Result<Value, HostError> {
        self.map(WasmType::into_value)
    }
}

/// A closure usable as an imported function.
///
/// Implemented for `Fn(&mut InstanceContext<'_, T>, A1, .., An) -> R` with
/// up to eight [`WasmType`] parameters and a [`HostReturn`] result. `Params`
/// is the parameter tuple and only serves to tell the impls apart.
pub trait HostFunction<T, Params>: Send + Sync + 'static {
    /// Signature inferred from the closure's parameter and return types.
    fn signature() -> FunctionSignature;

    fn into_callback(self) -> HostCallback<T>;
}

macro_rules! impl_host_function {
    ($($param:ident => $arg:ident),*) => {
        impl<T, F, R, $($param,)*> HostFunction<T, ($($param,)*)> for F
        where
            T: 'static,
            F: Fn(&mut InstanceContext<'_, T>, $($param),*) -> R + Send + Sync + 'static,
            R: HostReturn,
            $($param: WasmType,)*
        {
            fn signature() -> FunctionSignature {
                FunctionSignature::new(vec![$($param::KIND),*], R::outputs())
            }

            #[allow(unused_mut, unused_variables)]
            fn into_callback(self) -> HostCallback<T> {
                erase(move |ctx: &mut InstanceContext<'_, T>, inputs: &[Value]| {
                    let mut inputs = inputs.iter().copied();
                    $(
                        let $arg = inputs
                            .next()
                            .and_then($param::from_value)
                            .ok_or_else(|| {
                                HostError::invalid_argument(format!(
                                    "expected a value of type `{}`",
                                    $param::KIND
                                ))
                            })?;
                    )*
                    (self)(ctx, $($arg),*).into_result()
                })
            }
        }
    };
}

impl_host_function!();
impl_host_function!(A1 => a1);
impl_host_function!(A1 => a1, A2 => a2);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3, A4 => a4);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3, A4 => a4, A5 => a5);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3, A4 => a4, A5 => a5, A6 => a6);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3, A4 => a4, A5 => a5, A6 => a6, A7 => a7);
impl_host_function!(A1 => a1, A2 => a2, A3 => a3, A4 => a4, A5 => a5, A6 => a6, A7 => a7, A8 => a8);

/// A registered host function.
pub struct ImportFunction<T: 'static> {
    namespace: String,
    name: String,
    signature: FunctionSignature,
    callback: HostCallback<T>,
}

impl<T: 'static> ImportFunction<T> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }
}

impl<T: 'static> fmt::Debug for ImportFunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Flat description of one materialized import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub namespace: String,
    pub name: String,
    pub input_arity: usize,
    pub output_arity: usize,
}

/// Imports in the form the engine consumes.
///
/// Records are ordered by namespace, then by name.
pub struct MaterializedImports<T: 'static> {
    records: Vec<ImportRecord>,
    linker: Arc<Linker<StoreState<T>>>,
}

impl<T: 'static> MaterializedImports<T> {
    pub fn records(&self) -> &[ImportRecord] {
        &self.records
    }

    pub(crate) fn linker(&self) -> &Arc<Linker<StoreState<T>>> {
        &self.linker
    }

    fn engine(&self) -> &Engine {
        self.linker.engine()
    }
}

/// Registry of host functions, grouped by namespace.
///
/// Once materialized the registry is sealed: further registrations fail
/// until [`Imports::close`] drops the materialization.
pub struct Imports<T: 'static = ()> {
    functions: BTreeMap<String, BTreeMap<String, ImportFunction<T>>>,
    materialized: Option<MaterializedImports<T>>,
}

impl<T: 'static> Imports<T> {
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
            materialized: None,
        }
    }

    /// Register a typed host function.
    ///
    /// The signature is taken from the closure's parameter and return types.
    ///
    /// # Errors
    ///
    /// Fails if `namespace.name` is already registered or the registry is
    /// materialized. Existing registrations are left untouched.
    pub fn append<P, F>(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        callback: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: HostFunction<T, P>,
    {
        self.insert(ImportFunction {
            namespace: namespace.into(),
            name: name.into(),
            signature: F::signature(),
            callback: callback.into_callback(),
        })
    }

    /// Register a host function with an explicit signature.
    ///
    /// The callback receives arguments already checked against
    /// `signature.inputs()` and must return a value of the declared output
    /// kind, or [`Value::Void`] when there is none.
    ///
    /// # Errors
    ///
    /// Same as [`Imports::append`], and fails if the signature declares more
    /// than one output.
    pub fn append_dynamic<F>(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        signature: FunctionSignature,
        callback: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(&mut InstanceContext<'_, T>, &[Value]) -> Result<Value, HostError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if signature.output_arity() > 1 {
            return Err(RegistrationError::TooManyOutputs {
                name,
                outputs: signature.output_arity(),
            });
        }

        self.insert(ImportFunction {
            namespace: namespace.into(),
            name,
            signature,
            callback: erase(callback),
        })
    }

    fn insert(&mut self, function: ImportFunction<T>) -> Result<&mut Self, RegistrationError> {
        if self.materialized.is_some() {
            return Err(RegistrationError::Sealed {
                name: function.name,
            });
        }
        if self.contains(&function.namespace, &function.name) {
            return Err(RegistrationError::Duplicate {
                namespace: function.namespace,
                name: function.name,
            });
        }

        debug!(
            namespace = %function.namespace,
            name = %function.name,
            signature = %function.signature,
            "Imported function registered"
        );

        self.functions
            .entry(function.namespace.clone())
            .or_default()
            .insert(function.name.clone(), function);
        Ok(self)
    }

    /// Total number of registered functions across all namespaces.
    pub fn count(&self) -> usize {
        self.functions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered namespaces in order.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.get(namespace, name).is_some()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&ImportFunction<T>> {
        self.functions.get(namespace)?.get(name)
    }

    /// All functions, ordered by namespace then name.
    pub fn iter(&self) -> impl Iterator<Item = &ImportFunction<T>> {
        self.functions.values().flat_map(BTreeMap::values)
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.is_some()
    }

    /// Produce the engine-facing form of the registry.
    ///
    /// The result is cached: later calls with the same engine return it
    /// without registering anything again.
    ///
    /// # Errors
    ///
    /// Fails if the engine refuses one of the function handles.
    #[instrument(skip_all, fields(count = self.count()))]
    pub fn materialize(
        &mut self,
        engine: &WasmEngine,
    ) -> Result<&MaterializedImports<T>, RegistrationError> {
        let materialized = match self.materialized.take() {
            Some(cached) if Engine::same(cached.engine(), engine.inner()) => cached,
            _ => {
                let built = self.build(engine)?;
                debug!(records = built.records.len(), "Imports materialized");
                built
            }
        };

        Ok(self.materialized.insert(materialized))
    }

    fn build(&self, engine: &WasmEngine) -> Result<MaterializedImports<T>, RegistrationError> {
        let mut linker = Linker::new(engine.inner());
        let mut records = Vec::with_capacity(self.count());

        for function in self.iter() {
            let ty = function.signature.to_func_type(engine.inner());
            linker
                .func_new(
                    &function.namespace,
                    &function.name,
                    ty,
                    trampoline(
                        format!("{}.{}", function.namespace, function.name),
                        function.signature.outputs().first().copied(),
                        Arc::clone(&function.callback),
                    ),
                )
                .map_err(|e| RegistrationError::Materialization {
                    namespace: function.namespace.clone(),
                    name: function.name.clone(),
                    reason: format!("{e:#}"),
                })?;

            records.push(ImportRecord {
                namespace: function.namespace.clone(),
                name: function.name.clone(),
                input_arity: function.signature.input_arity(),
                output_arity: function.signature.output_arity(),
            });
        }

        Ok(MaterializedImports {
            records,
            linker: Arc::new(linker),
        })
    }

    /// Release the materialization. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.materialized.take().is_some() {
            debug!(count = self.count(), "Imports released");
        }
    }
}

/// Engine-level entry point of an imported function.
fn trampoline<T: 'static>(
    qualified: String,
    output: Option<ValueKind>,
    callback: HostCallback<T>,
) -> impl Fn(Caller<'_, StoreState<T>>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static
{
    move |caller: Caller<'_, StoreState<T>>, params: &[Val], results: &mut [Val]| {
        let inputs = params
            .iter()
            .map(Value::from_val)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                wasmtime::Error::new(HostError::invalid_argument(format!(
                    "`{qualified}` received a non-numeric argument"
                )))
            })?;

        let mut ctx = InstanceContext::new(caller);
        let value = (*callback)(&mut ctx, &inputs).map_err(wasmtime::Error::new)?;

        match (output, value.to_val()) {
            (None, None) => Ok(()),
            (Some(kind), Some(val)) if value.kind() == Some(kind) => {
                if let Some(slot) = results.first_mut() {
                    *slot = val;
                }
                Ok(())
            }
            _ => Err(wasmtime::Error::new(HostError::OutputMismatch {
                function: qualified.clone(),
                expected: output.map_or("void", ValueKind::name).to_string(),
                given: value.type_name().to_string(),
            })),
        }
    }
}

impl<T: 'static> Default for Imports<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for Imports<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Imports")
            .field("count", &self.count())
            .field("namespaces", &self.functions.keys().collect::<Vec<_>>())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// Imports materialized once and shared by any number of instances.
///
/// Cloning is cheap. Instances created from an import object never release
/// its resources; they are freed when the last handle is closed or dropped.
pub struct ImportObject<T: 'static = ()> {
    imports: Option<Arc<Imports<T>>>,
}

impl<T: 'static> ImportObject<T> {
    /// Materialize `imports` against `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::ImportObject`] if materialization fails.
    pub fn new(engine: &WasmEngine, mut imports: Imports<T>) -> Result<Self, InstanceError> {
        imports
            .materialize(engine)
            .map_err(|e| InstanceError::import_object(e.to_string()))?;

        Ok(Self {
            imports: Some(Arc::new(imports)),
        })
    }

    /// The materialized records, or an empty slice once closed.
    pub fn records(&self) -> &[ImportRecord] {
        self.materialized()
            .map(MaterializedImports::records)
            .unwrap_or_default()
    }

    pub fn imports(&self) -> Option<&Imports<T>> {
        self.imports.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.imports.is_none()
    }

    /// Drop this handle's share of the imports. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(imports) = self.imports.take() {
            debug!(
                shared_handles = Arc::strong_count(&imports) - 1,
                "Import object closed"
            );
        }
    }

    fn materialized(&self) -> Option<&MaterializedImports<T>> {
        self.imports.as_ref()?.materialized.as_ref()
    }

    /// The shared linker, provided it was built for `engine`.
    pub(crate) fn linker(
        &self,
        engine: &WasmEngine,
    ) -> Result<&Linker<StoreState<T>>, InstanceError> {
        let materialized = self
            .materialized()
            .ok_or_else(|| InstanceError::import_object("the import object is closed"))?;
        if !Engine::same(materialized.engine(), engine.inner()) {
            return Err(InstanceError::import_object(
                "the import object was created with a different engine",
            ));
        }
        Ok(materialized.linker().as_ref())
    }
}

impl<T: 'static> Clone for ImportObject<T> {
    fn clone(&self) -> Self {
        Self {
            imports: self.imports.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ImportObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportObject")
            .field("records", &self.records().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
