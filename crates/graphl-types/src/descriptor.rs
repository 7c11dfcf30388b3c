//! Type descriptors: the memory shape of primitive and struct types.
//!
//! ```text
//! TypeDescriptor
//! ├── Primitive  name + fixed byte size
//! └── Struct     name + size + [(field name, offset, field type)]
//! ```
//!
//! Struct descriptors are only built by the [`TypeRegistry`](crate::TypeRegistry),
//! which validates their layout before handing out a shared reference.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::ValueKind;

// ── Primitive names ──────────────────────────────────────────────────────────

pub const VOID: &str = "void";
pub const I32: &str = "i32";
pub const U32: &str = "u32";
pub const I64: &str = "i64";
pub const U64: &str = "u64";
pub const BOOL: &str = "bool";
pub const F32: &str = "f32";
pub const F64: &str = "f64";
pub const STRING: &str = "string";
pub const CODE: &str = "code";
pub const RGBA: &str = "rgba";
pub const EXTERN: &str = "extern";

/// Byte footprint of a guest `(ptr: u32, len: u32)` pair.
pub const SLICE_SIZE: u32 = 8;

/// The fixed primitive set with byte sizes, in registration order.
///
/// `string` and `code` are pointer+length pairs in guest memory; their size
/// is the footprint of that pair, not of the text.
pub const PRIMITIVES: [(&str, u32); 12] = [
    (VOID, 0),
    (I32, 4),
    (U32, 4),
    (I64, 8),
    (U64, 8),
    (BOOL, 4),
    (F32, 4),
    (F64, 8),
    (STRING, SLICE_SIZE),
    (CODE, SLICE_SIZE),
    (RGBA, 4),
    (EXTERN, 4),
];

// ══════════════════════════════════════════════════════════════════════════════
// TypeDescriptor
// ══════════════════════════════════════════════════════════════════════════════

/// Whether a descriptor is a primitive or an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Primitive,
    Struct,
}

/// One field of a struct descriptor.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    name: String,
    offset: u32,
    ty: Arc<TypeDescriptor>,
}

impl FieldDescriptor {
    pub(crate) fn new(name: String, offset: u32, ty: Arc<TypeDescriptor>) -> Self {
        Self { name, offset, ty }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte offset from the start of the enclosing struct.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn ty(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }
}

/// Static metadata describing a type's memory shape.
///
/// Identity is by [`name`](TypeDescriptor::name); descriptors are immutable
/// once registered.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    name: String,
    kind: TypeKind,
    size: u32,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub(crate) fn primitive(name: &str, size: u32) -> Self {
        Self {
            name: name.to_owned(),
            kind: TypeKind::Primitive,
            size,
            fields: Vec::new(),
        }
    }

    pub(crate) fn structure(name: String, size: u32, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name,
            kind: TypeKind::Struct,
            size,
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn is_struct(&self) -> bool {
        self.kind == TypeKind::Struct
    }

    /// Size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Struct fields in layout order; empty for primitives.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().map(|f| f.offset)
    }

    pub fn field_types(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> {
        self.fields.iter().map(|f| &f.ty)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn offset_of(&self, field: &str) -> Option<u32> {
        self.field(field).map(FieldDescriptor::offset)
    }

    /// The value kind this type travels as at the call boundary.
    ///
    /// Structs travel as their guest address. `void` has no value.
    pub fn boundary_kind(&self) -> Option<ValueKind> {
        if self.is_struct() {
            return Some(ValueKind::U32);
        }
        match self.name.as_str() {
            I32 => Some(ValueKind::I32),
            U32 | BOOL | RGBA | EXTERN => Some(ValueKind::U32),
            I64 => Some(ValueKind::I64),
            U64 => Some(ValueKind::U64),
            F32 => Some(ValueKind::F32),
            F64 => Some(ValueKind::F64),
            STRING | CODE => Some(ValueKind::String),
            _ => None,
        }
    }

    /// `true` for primitives stored as a guest pointer+length pair.
    pub fn is_slice(&self) -> bool {
        !self.is_struct() && matches!(self.name.as_str(), STRING | CODE)
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TypeDescriptor {}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_struct() {
            return f.write_str(&self.name);
        }
        write!(f, "struct {} ({} bytes) {{", self.name, self.size)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, " {}: {} @{}", field.name, field.ty.name, field.offset)?;
        }
        f.write_str(" }")
    }
}
