//! Error types for the embed-runtime.
//!
//! This module defines one error type per stage of the embedding lifecycle,
//! all built with `thiserror`:
//! - [`RegistrationError`]: Import registration and materialization
//! - [`InstanceError`]: Module instantiation and instance state
//! - [`ExportError`]: Calls through exported functions
//! - [`MemoryError`]: Exported linear memory access
//! - [`MeteringError`]: Opcode cost tables and gas injection
//! - [`ValueError`]: Conversions between host values and WebAssembly values
//! - [`HostError`]: Failures raised by host (imported) functions
//! - [`ConfigError`]: Configuration loading and validation
//!
//! Several messages are part of the public contract and are matched
//! literally by callers, so they must not be reworded.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Placeholder used when the engine does not provide any error detail.
pub const UNKNOWN_DETAILS: &str = "(unknown details)";

/// Errors raised while registering or materializing imported functions.
///
/// A registration error never affects imports registered before it.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// The namespace/name pair is already registered.
    #[error("Imported function `{name}` is already registered in the `{namespace}` namespace.")]
    Duplicate {
        /// Import namespace.
        namespace: String,
        /// Import name.
        name: String,
    },

    /// The declared signature returns more than one value.
    #[error("Imported function `{name}` may return at most one value; declared {outputs}.")]
    TooManyOutputs {
        /// Import name.
        name: String,
        /// Number of declared outputs.
        outputs: usize,
    },

    /// The imports were already materialized and can no longer change.
    #[error("Imported function `{name}` cannot be registered: the imports are already materialized.")]
    Sealed {
        /// Import name.
        name: String,
    },

    /// The engine refused to create the function handle.
    #[error("Failed to materialize imported function `{namespace}.{name}`: {reason}")]
    Materialization {
        /// Import namespace.
        namespace: String,
        /// Import name.
        name: String,
        /// Engine-provided description.
        reason: String,
    },
}

/// Errors related to a WebAssembly instance.
#[derive(Error, Debug)]
pub enum InstanceError {
    /// The engine rejected the module or its imports.
    #[error("Failed to instantiate the module:\n    {detail}")]
    Instantiation {
        /// Engine detail, or [`UNKNOWN_DETAILS`].
        detail: String,
    },

    /// A shared import object could not be created.
    #[error("Failed to create cached imports: {detail}")]
    ImportObject {
        /// Engine detail, or [`UNKNOWN_DETAILS`].
        detail: String,
    },

    /// Imports could not be materialized.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The instance was already closed.
    #[error("Instance is closed.")]
    Closed,
}

/// Errors raised when calling an exported function.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Fewer arguments than the declared input arity.
    #[error(
        "Missing {missing} argument(s) when calling the `{function}` exported function; Expect {expected} argument(s), given {given}."
    )]
    MissingArguments {
        /// Exported function name.
        function: String,
        /// Number of missing arguments.
        missing: usize,
        /// Declared input arity.
        expected: usize,
        /// Number of arguments given.
        given: usize,
    },

    /// More arguments than the declared input arity.
    #[error(
        "Given {extra} extra argument(s) when calling the `{function}` exported function; Expect {expected} argument(s), given {given}."
    )]
    ExtraArguments {
        /// Exported function name.
        function: String,
        /// Number of surplus arguments.
        extra: usize,
        /// Declared input arity.
        expected: usize,
        /// Number of arguments given.
        given: usize,
    },

    /// An argument does not match the declared value kind.
    #[error(
        "Argument #{position} of the `{function}` exported function must be of type `{expected}`, given `{given}`."
    )]
    ArgumentType {
        /// Exported function name.
        function: String,
        /// 1-based argument position.
        position: usize,
        /// Declared value kind.
        expected: String,
        /// Type of the value that was given.
        given: String,
    },

    /// The engine failed or trapped while running the function.
    #[error("Failed to call the `{function}` exported function.")]
    CallFailed {
        /// Exported function name.
        function: String,
        /// Engine-level cause.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The function returned a value the bridge cannot represent.
    #[error("The `{function}` exported function returned an unsupported value.")]
    UnsupportedResult {
        /// Exported function name.
        function: String,
    },

    /// No callable export with this name exists.
    #[error("Exported function `{function}` does not exist.")]
    NotFound {
        /// Requested export name.
        function: String,
    },

    /// The instance was already closed.
    #[error("Instance is closed.")]
    Closed,
}

/// Errors from exported linear memory access.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The access range falls outside the current memory size.
    #[error("Memory access out of bounds: offset {offset}, length {len}, memory size {size}")]
    OutOfBounds {
        /// Start offset of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Current memory size in bytes.
        size: usize,
    },

    /// The memory could not grow by the requested number of pages.
    #[error("Failed to grow the memory by {pages} page(s): {reason}")]
    Grow {
        /// Requested number of pages.
        pages: u64,
        /// Engine-provided description.
        reason: String,
    },
}

/// Errors from opcode cost tables and gas injection.
#[derive(Error, Debug)]
pub enum MeteringError {
    /// A cost table does not have one entry per opcode.
    #[error("Opcode cost table must have {expected} entries, given {given}.")]
    CostTableLength {
        /// Required number of entries.
        expected: usize,
        /// Number of entries given.
        given: usize,
    },

    /// An opcode index is outside the cost table.
    #[error("Opcode index {index} is out of range; the cost table has {count} entries.")]
    OpcodeOutOfRange {
        /// Offending index.
        index: usize,
        /// Size of the cost table.
        count: usize,
    },

    /// The module uses an opcode that has no slot in the cost table.
    #[error("Opcode 0x{opcode:02x} at offset {offset} cannot be metered.")]
    UnsupportedOpcode {
        /// Leading opcode byte.
        opcode: u8,
        /// Byte offset within the module.
        offset: usize,
    },

    /// The bytes are not a core WebAssembly module.
    #[error("Malformed module: {reason}")]
    Malformed {
        /// Parser-provided description.
        reason: String,
    },
}

/// Errors converting between host values and WebAssembly values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// The value holds a different kind than requested.
    #[error("Expected a value of type `{expected}`, given `{actual}`.")]
    KindMismatch {
        /// Requested kind.
        expected: String,
        /// Kind actually held.
        actual: String,
    },

    /// A textual value could not be parsed as the requested kind.
    #[error("Cannot parse `{input}` as a value of type `{kind}`.")]
    Parse {
        /// Requested kind.
        kind: String,
        /// Input text.
        input: String,
    },
}

/// Errors from host function implementations.
///
/// Returning one of these from an imported function traps the calling
/// WebAssembly code; the exported call then fails with
/// [`ExportError::CallFailed`].
#[derive(Error, Debug)]
pub enum HostError {
    /// Free-form failure reported by the host function.
    #[error("{0}")]
    Failed(String),

    /// An argument could not be used by the host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The host function returned a value that does not match its signature.
    #[error("Imported function `{function}` must return `{expected}`, returned `{given}`.")]
    OutputMismatch {
        /// Qualified import name.
        function: String,
        /// Declared output kind.
        expected: String,
        /// Kind actually returned.
        given: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// Configuration values are inconsistent or rejected by the engine.
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl InstanceError {
    /// Create a new `Instantiation` error, substituting the placeholder
    /// for an empty detail.
    pub fn instantiation(detail: impl Into<String>) -> Self {
        Self::Instantiation {
            detail: non_empty_detail(detail.into()),
        }
    }

    /// Create a new `ImportObject` error.
    pub fn import_object(detail: impl Into<String>) -> Self {
        Self::ImportObject {
            detail: non_empty_detail(detail.into()),
        }
    }
}

impl ExportError {
    /// Create the arity error matching the given and expected counts.
    ///
    /// Returns `None` when the counts agree.
    pub fn arity(function: &str, expected: usize, given: usize) -> Option<Self> {
        match given.cmp(&expected) {
            std::cmp::Ordering::Less => Some(Self::MissingArguments {
                function: function.to_string(),
                missing: expected - given,
                expected,
                given,
            }),
            std::cmp::Ordering::Greater => Some(Self::ExtraArguments {
                function: function.to_string(),
                extra: given - expected,
                expected,
                given,
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Returns `true` if the error was detected before the engine ran.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::MissingArguments { .. } | Self::ExtraArguments { .. } | Self::ArgumentType { .. }
        )
    }
}

impl MeteringError {
    /// Create a new `Malformed` error.
    pub fn malformed(reason: impl ToString) -> Self {
        Self::Malformed {
            reason: reason.to_string(),
        }
    }
}

impl HostError {
    /// Create a new free-form host failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl ConfigError {
    /// Create a new `Invalid` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

fn non_empty_detail(detail: String) -> String {
    if detail.trim().is_empty() {
        UNKNOWN_DETAILS.to_string()
    } else {
        detail
    }
}
