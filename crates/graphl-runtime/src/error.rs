use graphl_types::{LayoutError, RegistryError, TypeMismatchError};
use thiserror::Error;

use crate::compiler::CompileDiagnostic;
use crate::metadata::MetadataError;
use crate::program::RuntimeState;

/// Why a module could not be brought to `Ready`.
///
/// The sandbox has already been released when this is returned.
#[derive(Debug, Error)]
pub enum InstantiationError {
    #[error("failed to load module: {0}")]
    Load(String),

    #[error("unresolved import `{module}.{name}`")]
    UnresolvedImport { module: String, name: String },

    #[error("import `{module}.{name}` has type {expected}, host binding declares {bound}")]
    ImportSignature {
        module: String,
        name: String,
        expected: String,
        bound: String,
    },

    #[error("initializer `{entry}` trapped: {message}")]
    Initializer { entry: String, message: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("signature of `{function}`: {message}")]
    Signature { function: String, message: String },

    #[error("registering module structs: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors surfaced by [`ProgramRuntime`](crate::ProgramRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileDiagnostic),

    #[error("instantiation failed: {0}")]
    Instantiation(#[from] InstantiationError),

    #[error("no such function `{name}` (exported: {})", .available.join(", "))]
    NoSuchFunction { name: String, available: Vec<String> },

    #[error("`{name}` takes {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of `{function}`: {source}")]
    ArgumentType {
        function: String,
        index: usize,
        source: TypeMismatchError,
    },

    #[error("`{name}` returns {actual} value(s), expected {expected}")]
    ResultCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("`{function}` trapped: {message}")]
    Trap { function: String, message: String },

    #[error("runtime failed: {reason}")]
    RuntimeFailed { reason: String },

    #[error("runtime is closed")]
    Closed,

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: RuntimeState,
    },

    #[error("marshalling `{function}`: {message}")]
    Marshal { function: String, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
