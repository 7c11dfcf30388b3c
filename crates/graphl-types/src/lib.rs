//! Boundary types for the graphl runtime bridge.
//!
//! This crate defines the values that cross the host/guest boundary
//! ([`TypedValue`]), the descriptors of guest memory shapes
//! ([`TypeDescriptor`]) and the registry that owns them ([`TypeRegistry`]).
//! It has no dependency on any particular sandbox.

pub mod descriptor;
mod error;
pub mod layout;
mod registry;
mod value;

pub use descriptor::{FieldDescriptor, TypeDescriptor, TypeKind};
pub use error::{LayoutError, RegistryError, TypeMismatchError};
pub use layout::{decode_struct, encode_struct, FieldValue, SliceAccess, StructValue};
pub use registry::{FieldDecl, StagedStructs, StructDecl, TypeRegistry};
pub use value::{Payload, TypedValue, ValueKind};

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
