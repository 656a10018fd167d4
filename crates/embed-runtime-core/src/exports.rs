//! Exported functions and the call bridge.
//!
//! After instantiation the instance's exports are walked once. Functions
//! with numeric signatures and at most one result become callable
//! [`ExportedFunction`]s; the last exported memory and the injected points
//! global (for metered modules) are remembered; everything else is ignored.

use std::collections::HashMap;

use tracing::{debug, warn};
use wasmtime::{Extern, Func, Global, Memory, Store, Val};

use embed_runtime_common::ExportError;

use crate::context::StoreState;
use crate::metering::POINTS_USED_EXPORT;
use crate::value::{FunctionSignature, Value};

/// A function exported by an instance.
#[derive(Debug, Clone)]
pub struct ExportedFunction {
    name: String,
    signature: FunctionSignature,
    func: Func,
}

impl ExportedFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn input_arity(&self) -> usize {
        self.signature.input_arity()
    }

    pub fn output_arity(&self) -> usize {
        self.signature.output_arity()
    }

    /// Check `args` against the signature, run the function and convert
    /// its result.
    pub(crate) fn invoke<T: 'static>(
        &self,
        store: &mut Store<StoreState<T>>,
        args: &[Value],
    ) -> Result<Value, ExportError> {
        if let Some(err) = ExportError::arity(&self.name, self.input_arity(), args.len()) {
            return Err(err);
        }

        let mut params = Vec::with_capacity(args.len());
        for (position, (arg, expected)) in args.iter().zip(self.signature.inputs()).enumerate() {
            match arg.to_val() {
                Some(val) if arg.kind() == Some(*expected) => params.push(val),
                _ => {
                    return Err(ExportError::ArgumentType {
                        function: self.name.clone(),
                        position: position + 1,
                        expected: expected.name().to_string(),
                        given: arg.type_name().to_string(),
                    });
                }
            }
        }

        let mut results: Vec<Val> = self
            .signature
            .outputs()
            .iter()
            .map(|kind| Value::zero_val(*kind))
            .collect();

        self.func
            .call(&mut *store, &params, &mut results)
            .map_err(|e| ExportError::CallFailed {
                function: self.name.clone(),
                source: e.into(),
            })?;

        match results.first() {
            None => Ok(Value::Void),
            Some(val) => Value::from_val(val).ok_or_else(|| ExportError::UnsupportedResult {
                function: self.name.clone(),
            }),
        }
    }
}

/// Everything the bridge keeps from an instance's exports.
#[derive(Debug, Default)]
pub(crate) struct ExportTable {
    functions: Vec<ExportedFunction>,
    index: HashMap<String, usize>,
    pub(crate) memory: Option<Memory>,
    pub(crate) points: Option<Global>,
}

impl ExportTable {
    /// Walk the exports of `instance` in engine order.
    ///
    /// The points global is only picked up for metered modules; otherwise a
    /// guest export of the same name is an ordinary global.
    pub(crate) fn collect<T: 'static>(
        instance: &wasmtime::Instance,
        store: &mut Store<StoreState<T>>,
        metered: bool,
    ) -> Self {
        let externs: Vec<(String, Extern)> = instance
            .exports(&mut *store)
            .map(|export| (export.name().to_string(), export.into_extern()))
            .collect();

        let mut table = Self::default();

        for (name, item) in externs {
            match item {
                Extern::Func(func) => {
                    let ty = func.ty(&*store);
                    match FunctionSignature::from_func_type(&ty) {
                        Some(signature) if signature.output_arity() <= 1 => {
                            table.index.insert(name.clone(), table.functions.len());
                            table.functions.push(ExportedFunction {
                                name,
                                signature,
                                func,
                            });
                        }
                        _ => {
                            warn!(function = %name, "Skipping export with an unsupported signature");
                        }
                    }
                }
                Extern::Memory(memory) => table.memory = Some(memory),
                Extern::Global(global) if metered && name == POINTS_USED_EXPORT => {
                    table.points = Some(global);
                }
                _ => {}
            }
        }

        debug!(
            functions = table.functions.len(),
            has_memory = table.memory.is_some(),
            metered = table.points.is_some(),
            "Exports collected"
        );

        table
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ExportedFunction> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    pub(crate) fn functions(&self) -> &[ExportedFunction] {
        &self.functions
    }
}
