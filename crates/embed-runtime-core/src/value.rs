//! WebAssembly values exchanged across the host boundary.
//!
//! - [`Value`]: A single runtime value (or the `Void` sentinel)
//! - [`ValueKind`]: The four numeric WebAssembly value types
//! - [`FunctionSignature`]: Ordered input and output kinds of a function
//! - [`WasmType`]: Host types usable in typed import signatures
//!
//! Construction from host numbers infers the kind from the host type:
//! narrow integers widen to `i32`, 64-bit and pointer-sized integers map to
//! `i64`, and the two float types map to `f32`/`f64`. Unsigned values are
//! stored bit-for-bit. No conversion ever crosses kinds.

use std::fmt;

use wasmtime::{Engine, FuncType, Val, ValType};

use embed_runtime_common::ValueError;

/// The four numeric WebAssembly value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ValueKind {
    /// Name of the kind as written in WebAssembly text.
    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
        }
    }

    /// Map an engine value type, if it is one of the four numeric kinds.
    pub fn from_val_type(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(ValueKind::I32),
            ValType::I64 => Some(ValueKind::I64),
            ValType::F32 => Some(ValueKind::F32),
            ValType::F64 => Some(ValueKind::F64),
            _ => None,
        }
    }

    /// The engine value type for this kind.
    pub fn to_val_type(self) -> ValType {
        match self {
            ValueKind::I32 => ValType::I32,
            ValueKind::I64 => ValType::I64,
            ValueKind::F32 => ValType::F32,
            ValueKind::F64 => ValType::F64,
        }
    }

    /// Parse text into a value of this kind.
    ///
    /// Integers accept both signed and unsigned spellings of the full
    /// bit range (`-1` and `4294967295` are the same `i32`).
    pub fn parse(self, input: &str) -> Result<Value, ValueError> {
        let input = input.trim();
        let parsed = match self {
            ValueKind::I32 => input
                .parse::<i32>()
                .ok()
                .or_else(|| input.parse::<u32>().ok().map(i32::from_unsigned))
                .map(Value::I32),
            ValueKind::I64 => input
                .parse::<i64>()
                .ok()
                .or_else(|| input.parse::<u64>().ok().map(i64::from_unsigned))
                .map(Value::I64),
            ValueKind::F32 => input.parse::<f32>().ok().map(Value::F32),
            ValueKind::F64 => input.parse::<f64>().ok().map(Value::F64),
        };

        parsed.ok_or_else(|| ValueError::Parse {
            kind: self.name().to_string(),
            input: input.to_string(),
        })
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit-preserving reinterpretation of unsigned integers.
trait FromUnsigned<U> {
    fn from_unsigned(value: U) -> Self;
}

impl FromUnsigned<u32> for i32 {
    fn from_unsigned(value: u32) -> Self {
        i32::from_ne_bytes(value.to_ne_bytes())
    }
}

impl FromUnsigned<u64> for i64 {
    fn from_unsigned(value: u64) -> Self {
        i64::from_ne_bytes(value.to_ne_bytes())
    }
}

/// A single WebAssembly runtime value.
///
/// `Void` is the result of calling an exported function that returns
/// nothing; it has no [`ValueKind`] and is never accepted as an argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// No value.
    Void,
}

impl Value {
    /// The kind of this value, or `None` for `Void`.
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::I32(_) => Some(ValueKind::I32),
            Value::I64(_) => Some(ValueKind::I64),
            Value::F32(_) => Some(ValueKind::F32),
            Value::F64(_) => Some(ValueKind::F64),
            Value::Void => None,
        }
    }

    /// Name of the held type, used in error messages.
    pub const fn type_name(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.name(),
            None => "void",
        }
    }

    /// Returns `true` for the `Void` sentinel.
    pub const fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub const fn to_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The `i32` payload reinterpreted as unsigned.
    pub fn to_u32(&self) -> Option<u32> {
        self.to_i32().map(|v| u32::from_ne_bytes(v.to_ne_bytes()))
    }

    pub const fn to_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// The `i64` payload reinterpreted as unsigned.
    pub fn to_u64(&self) -> Option<u64> {
        self.to_i64().map(|v| u64::from_ne_bytes(v.to_ne_bytes()))
    }

    pub const fn to_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn to_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert to an engine value. `Void` has no engine representation.
    pub(crate) fn to_val(self) -> Option<Val> {
        match self {
            Value::I32(v) => Some(Val::I32(v)),
            Value::I64(v) => Some(Val::I64(v)),
            Value::F32(v) => Some(Val::F32(v.to_bits())),
            Value::F64(v) => Some(Val::F64(v.to_bits())),
            Value::Void => None,
        }
    }

    /// Convert from an engine value, if it is numeric.
    pub(crate) fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(Value::I32(*v)),
            Val::I64(v) => Some(Value::I64(*v)),
            Val::F32(bits) => Some(Value::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Some(Value::F64(f64::from_bits(*bits))),
            _ => None,
        }
    }

    /// A zeroed engine value of the given kind, used as a result slot.
    pub(crate) fn zero_val(kind: ValueKind) -> Val {
        match kind {
            ValueKind::I32 => Val::I32(0),
            ValueKind::I64 => Val::I64(0),
            ValueKind::F32 => Val::F32(0),
            ValueKind::F64 => Val::F64(0),
        }
    }

    fn mismatch(&self, expected: ValueKind) -> ValueError {
        ValueError::KindMismatch {
            expected: expected.name().to_string(),
            actual: self.type_name().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Void => f.write_str("void"),
        }
    }
}

macro_rules! value_from {
    ($variant:ident: $($host:ty => $convert:expr),* $(,)?) => {
        $(
            impl From<$host> for Value {
                fn from(value: $host) -> Self {
                    Value::$variant($convert(value))
                }
            }
        )*
    };
}

value_from!(I32:
    i8 => i32::from,
    u8 => i32::from,
    i16 => i32::from,
    u16 => i32::from,
    i32 => std::convert::identity,
    u32 => i32::from_unsigned,
);

value_from!(I64:
    i64 => std::convert::identity,
    u64 => i64::from_unsigned,
);

// Pointer-sized integers are at most 64 bits wide on supported targets.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
impl From<isize> for Value {
    fn from(value: isize) -> Self {
        Value::I64(value as i64)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::I64(i64::from_unsigned(value as u64))
    }
}

value_from!(F32: f32 => std::convert::identity);
value_from!(F64: f64 => std::convert::identity);

macro_rules! value_try_into {
    ($($host:ty => $kind:ident, $accessor:ident);* $(;)?) => {
        $(
            impl TryFrom<Value> for $host {
                type Error = ValueError;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    value
                        .$accessor()
                        .ok_or_else(|| value.mismatch(ValueKind::$kind))
                }
            }
        )*
    };
}

value_try_into! {
    i32 => I32, to_i32;
    u32 => I32, to_u32;
    i64 => I64, to_i64;
    u64 => I64, to_u64;
    f32 => F32, to_f32;
    f64 => F64, to_f64;
}

/// Ordered input and output kinds of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionSignature {
    inputs: Vec<ValueKind>,
    outputs: Vec<ValueKind>,
}

impl FunctionSignature {
    pub fn new(inputs: impl Into<Vec<ValueKind>>, outputs: impl Into<Vec<ValueKind>>) -> Self {
        Self {
            inputs: inputs.into(),
            outputs: outputs.into(),
        }
    }

    pub fn inputs(&self) -> &[ValueKind] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueKind] {
        &self.outputs
    }

    pub fn input_arity(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_arity(&self) -> usize {
        self.outputs.len()
    }

    /// Build a signature from an engine function type.
    ///
    /// Returns `None` if any parameter or result is not numeric.
    pub fn from_func_type(ty: &FuncType) -> Option<Self> {
        let inputs = ty
            .params()
            .map(|param| ValueKind::from_val_type(&param))
            .collect::<Option<Vec<_>>>()?;
        let outputs = ty
            .results()
            .map(|result| ValueKind::from_val_type(&result))
            .collect::<Option<Vec<_>>>()?;

        Some(Self { inputs, outputs })
    }

    /// The engine function type for this signature.
    pub fn to_func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(
            engine,
            self.inputs.iter().map(|kind| kind.to_val_type()),
            self.outputs.iter().map(|kind| kind.to_val_type()),
        )
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |kinds: &[ValueKind]| {
            kinds
                .iter()
                .map(|kind| kind.name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.inputs), join(&self.outputs))
    }
}

/// Host types that map onto exactly one WebAssembly value kind.
///
/// Implemented for `i32`, `u32`, `i64`, `u64`, `f32` and `f64`; these are
/// the parameter and return types accepted by typed import functions.
pub trait WasmType: Copy + Send + Sync + 'static {
    /// The kind this type occupies.
    const KIND: ValueKind;

    /// Extract from a value of the matching kind.
    fn from_value(value: Value) -> Option<Self>;

    /// Wrap into a value.
    fn into_value(self) -> Value;
}

macro_rules! wasm_type {
    ($($host:ty => $kind:ident, $accessor:ident);* $(;)?) => {
        $(
            impl WasmType for $host {
                const KIND: ValueKind = ValueKind::$kind;

                fn from_value(value: Value) -> Option<Self> {
                    value.$accessor()
                }

                fn into_value(self) -> Value {
                    Value::from(self)
                }
            }
        )*
    };
}

wasm_type! {
    i32 => I32, to_i32;
    u32 => I32, to_u32;
    i64 => I64, to_i64;
    u64 => I64, to_u64;
    f32 => F32, to_f32;
    f64 => F64, to_f64;
}
