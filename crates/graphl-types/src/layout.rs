//! Struct values and their byte layout.
//!
//! A [`TypedValue`] cannot carry an aggregate, so struct arguments and
//! results live in guest memory and travel as an address. This module
//! converts between a host-side [`StructValue`] and the little-endian bytes
//! described by a struct [`TypeDescriptor`].
//!
//! String fields are stored as a `(ptr: u32, len: u32)` pair; the text
//! itself is placed and fetched through a [`SliceAccess`] implementation
//! supplied by whoever owns the guest memory.

use serde::{Deserialize, Serialize};

use crate::descriptor::TypeDescriptor;
use crate::error::LayoutError;
use crate::value::{TypedValue, ValueKind};

/// The value of one struct field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(TypedValue),
    Struct(StructValue),
}

impl From<TypedValue> for FieldValue {
    fn from(v: TypedValue) -> Self {
        FieldValue::Scalar(v)
    }
}

macro_rules! scalar_fields {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::Scalar(TypedValue::from(v))
                }
            }
        )*
    };
}

scalar_fields!(u32, u64, i32, i64, f32, f64, String, &str);

impl From<StructValue> for FieldValue {
    fn from(v: StructValue) -> Self {
        FieldValue::Struct(v)
    }
}

/// A host-side struct instance: type name plus named field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructValue {
    pub type_name: String,
    pub fields: Vec<(String, FieldValue)>,
}

impl StructValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Shorthand for a scalar field.
    pub fn scalar(&self, name: &str) -> Option<&TypedValue> {
        match self.get(name)? {
            FieldValue::Scalar(v) => Some(v),
            FieldValue::Struct(_) => None,
        }
    }
}

/// Places and fetches string payloads referenced from struct fields.
pub trait SliceAccess {
    /// Copy `text` somewhere addressable and return `(ptr, len)`.
    fn store(&mut self, text: &str) -> Result<(u32, u32), String>;

    /// Read back `len` bytes of UTF-8 at `ptr`.
    fn load(&mut self, ptr: u32, len: u32) -> Result<String, String>;
}

// ══════════════════════════════════════════════════════════════════════════════
// Encode
// ══════════════════════════════════════════════════════════════════════════════

/// Lay `value` out according to `descriptor`.
///
/// Every descriptor field must be present with exactly the matching kind;
/// no coercion is applied.
pub fn encode_struct(
    descriptor: &TypeDescriptor,
    value: &StructValue,
    slices: &mut dyn SliceAccess,
) -> Result<Vec<u8>, LayoutError> {
    check_struct(descriptor, value)?;
    let mut buf = vec![0u8; descriptor.size() as usize];

    for field in descriptor.fields() {
        let at = field.offset() as usize;
        let given = value.get(field.name()).ok_or_else(|| LayoutError::MissingField {
            type_name: descriptor.name().to_owned(),
            field: field.name().to_owned(),
        })?;
        let ty = field.ty();
        let mismatch = |actual: String| LayoutError::FieldType {
            type_name: descriptor.name().to_owned(),
            field: field.name().to_owned(),
            expected: ty.name().to_owned(),
            actual,
        };

        match given {
            FieldValue::Struct(inner) if ty.is_struct() => {
                let bytes = encode_struct(ty, inner, slices)?;
                put(&mut buf, at, &bytes);
            }
            FieldValue::Struct(inner) => return Err(mismatch(inner.type_name.clone())),
            FieldValue::Scalar(TypedValue::String(text)) if ty.is_slice() => {
                let (ptr, len) = slices.store(text).map_err(|message| LayoutError::Indirect {
                    type_name: descriptor.name().to_owned(),
                    field: field.name().to_owned(),
                    message,
                })?;
                put(&mut buf, at, &ptr.to_le_bytes());
                put(&mut buf, at + 4, &len.to_le_bytes());
            }
            FieldValue::Scalar(scalar) => {
                if ty.is_struct() || ty.boundary_kind() != Some(scalar.kind()) {
                    return Err(mismatch(scalar.kind().to_string()));
                }
                put(&mut buf, at, &scalar_bytes(scalar));
            }
        }
    }
    Ok(buf)
}

fn check_struct(descriptor: &TypeDescriptor, value: &StructValue) -> Result<(), LayoutError> {
    if !descriptor.is_struct() {
        return Err(LayoutError::NotAStruct {
            name: descriptor.name().to_owned(),
        });
    }
    if value.type_name != descriptor.name() {
        return Err(LayoutError::WrongStruct {
            expected: descriptor.name().to_owned(),
            actual: value.type_name.clone(),
        });
    }
    if let Some((name, _)) = value
        .fields
        .iter()
        .find(|(name, _)| descriptor.field(name).is_none())
    {
        return Err(LayoutError::UnknownField {
            type_name: descriptor.name().to_owned(),
            field: name.clone(),
        });
    }
    Ok(())
}

fn scalar_bytes(value: &TypedValue) -> Vec<u8> {
    match value {
        TypedValue::U32(v) => v.to_le_bytes().to_vec(),
        TypedValue::U64(v) => v.to_le_bytes().to_vec(),
        TypedValue::I32(v) => v.to_le_bytes().to_vec(),
        TypedValue::I64(v) => v.to_le_bytes().to_vec(),
        TypedValue::F32(v) => v.to_le_bytes().to_vec(),
        TypedValue::F64(v) => v.to_le_bytes().to_vec(),
        TypedValue::String(s) => s.as_bytes().to_vec(),
    }
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

// ══════════════════════════════════════════════════════════════════════════════
// Decode
// ══════════════════════════════════════════════════════════════════════════════

/// Read a struct laid out according to `descriptor` from `bytes`.
pub fn decode_struct(
    descriptor: &TypeDescriptor,
    bytes: &[u8],
    slices: &mut dyn SliceAccess,
) -> Result<StructValue, LayoutError> {
    if !descriptor.is_struct() {
        return Err(LayoutError::NotAStruct {
            name: descriptor.name().to_owned(),
        });
    }
    let size = descriptor.size() as usize;
    if bytes.len() < size {
        return Err(LayoutError::Truncated {
            type_name: descriptor.name().to_owned(),
            needed: size,
            available: bytes.len(),
        });
    }

    let mut out = StructValue::new(descriptor.name());
    for field in descriptor.fields() {
        let at = field.offset() as usize;
        let ty = field.ty();
        let end = at + ty.size() as usize;
        let raw = &bytes[at..end];

        let value = if ty.is_struct() {
            FieldValue::Struct(decode_struct(ty, raw, slices)?)
        } else if ty.is_slice() {
            let ptr = u32::from_le_bytes(word(raw, 0));
            let len = u32::from_le_bytes(word(raw, 4));
            let text = slices.load(ptr, len).map_err(|message| LayoutError::Indirect {
                type_name: descriptor.name().to_owned(),
                field: field.name().to_owned(),
                message,
            })?;
            FieldValue::Scalar(TypedValue::String(text))
        } else {
            let kind = ty.boundary_kind().ok_or_else(|| LayoutError::FieldType {
                type_name: descriptor.name().to_owned(),
                field: field.name().to_owned(),
                expected: ty.name().to_owned(),
                actual: "no value".to_owned(),
            })?;
            FieldValue::Scalar(read_scalar(kind, raw))
        };
        out.fields.push((field.name().to_owned(), value));
    }
    Ok(out)
}

fn word(raw: &[u8], at: usize) -> [u8; 4] {
    let mut w = [0u8; 4];
    w.copy_from_slice(&raw[at..at + 4]);
    w
}

fn dword(raw: &[u8]) -> [u8; 8] {
    let mut w = [0u8; 8];
    w.copy_from_slice(&raw[..8]);
    w
}

/// `raw` is exactly the primitive's size, so the word reads are in bounds.
fn read_scalar(kind: ValueKind, raw: &[u8]) -> TypedValue {
    match kind {
        ValueKind::U32 => TypedValue::U32(u32::from_le_bytes(word(raw, 0))),
        ValueKind::I32 => TypedValue::I32(i32::from_le_bytes(word(raw, 0))),
        ValueKind::F32 => TypedValue::F32(f32::from_le_bytes(word(raw, 0))),
        ValueKind::U64 => TypedValue::U64(u64::from_le_bytes(dword(raw))),
        ValueKind::I64 => TypedValue::I64(i64::from_le_bytes(dword(raw))),
        ValueKind::F64 => TypedValue::F64(f64::from_le_bytes(dword(raw))),
        ValueKind::String => TypedValue::String(String::from_utf8_lossy(raw).into_owned()),
    }
}
