//! Error types for values, descriptors and the registry.

use thiserror::Error;

use crate::value::ValueKind;

/// A `try_*` accessor was called on a value of a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("type mismatch: expected {expected}, got {actual}")]
pub struct TypeMismatchError {
    /// The kind the caller asked for.
    pub expected: ValueKind,
    /// The kind the value actually holds.
    pub actual: ValueKind,
}

impl TypeMismatchError {
    pub fn new(expected: ValueKind, actual: ValueKind) -> Self {
        Self { expected, actual }
    }
}

/// Misuse of the [`TypeRegistry`](crate::TypeRegistry).
///
/// The registry is left unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("type `{name}` is already registered")]
    Duplicate { name: String },

    #[error("invalid layout for struct `{name}`: {reason}")]
    InvalidLayout { name: String, reason: String },

    #[error("struct `{name}` references itself: {}", path.join(" -> "))]
    Cyclic { name: String, path: Vec<String> },

    #[error("unknown type `{name}`")]
    NotFound { name: String },

    #[error("type `{type_name}` has no field `{field}`")]
    FieldNotFound { type_name: String, field: String },
}

/// Failure while encoding or decoding a struct against its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("type `{name}` is not a struct")]
    NotAStruct { name: String },

    #[error("expected a `{expected}` value, got `{actual}`")]
    WrongStruct { expected: String, actual: String },

    #[error("struct `{type_name}` is missing field `{field}`")]
    MissingField { type_name: String, field: String },

    #[error("struct `{type_name}` has no field `{field}`")]
    UnknownField { type_name: String, field: String },

    #[error("field `{type_name}.{field}` expects {expected}, got {actual}")]
    FieldType {
        type_name: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("struct `{type_name}` needs {needed} bytes, got {available}")]
    Truncated {
        type_name: String,
        needed: usize,
        available: usize,
    },

    #[error("field `{type_name}.{field}`: {message}")]
    Indirect {
        type_name: String,
        field: String,
        message: String,
    },
}
