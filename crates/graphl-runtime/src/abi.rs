//! Host/guest calling convention.
//!
//! Guest exports and host imports use fixed-width wasm words only. Each
//! [`ValueKind`] lowers to one or more words:
//!
//! | Kind            | Words                     |
//! |-----------------|---------------------------|
//! | `U32` / `I32`   | one `i32` (bit pattern)   |
//! | `U64` / `I64`   | one `i64` (bit pattern)   |
//! | `F32`           | one `f32`                 |
//! | `F64`           | one `f64`                 |
//! | `String`        | `i32` ptr, `i32` len      |
//!
//! String payloads are copied into guest memory through the guest's
//! allocator export and copied back out on the way up; the host never holds
//! a reference into guest memory past a single call.

use graphl_types::{TypedValue, ValueKind};
use serde::{Deserialize, Serialize};

use crate::sandbox::{GuestMemory, SandboxError};

// ── Well-known names ─────────────────────────────────────────────────────────

/// Initializer export run once after instantiation.
pub const DEFAULT_INITIALIZER: &str = "_initialize";
/// Import module that host functions are linked under.
pub const HOST_MODULE: &str = "env";
/// Linear memory export.
pub const MEMORY_EXPORT: &str = "memory";
/// `alloc(len: i32) -> i32` export used to place host data in guest memory.
pub const ALLOC_EXPORT: &str = "alloc";
/// Custom section holding the module's JSON metadata.
pub const METADATA_SECTION: &str = "graphl";
/// Highest metadata format version understood by this runtime.
pub const METADATA_VERSION: u32 = 1;

// ══════════════════════════════════════════════════════════════════════════════
// Words
// ══════════════════════════════════════════════════════════════════════════════

/// A wasm number type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    I32,
    I64,
    F32,
    F64,
}

/// A single wasm argument or result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Word {
    pub fn ty(&self) -> WireType {
        match self {
            Self::I32(_) => WireType::I32,
            Self::I64(_) => WireType::I64,
            Self::F32(_) => WireType::F32,
            Self::F64(_) => WireType::F64,
        }
    }
}

/// Words a single kind lowers to.
pub fn lower_kind(kind: ValueKind) -> &'static [WireType] {
    match kind {
        ValueKind::U32 | ValueKind::I32 => &[WireType::I32],
        ValueKind::U64 | ValueKind::I64 => &[WireType::I64],
        ValueKind::F32 => &[WireType::F32],
        ValueKind::F64 => &[WireType::F64],
        ValueKind::String => &[WireType::I32, WireType::I32],
    }
}

pub fn lower_kinds(kinds: &[ValueKind]) -> Vec<WireType> {
    kinds.iter().flat_map(|k| lower_kind(*k).iter().copied()).collect()
}

/// Kind assumed for a wire type when the module declares no signature.
pub fn default_kind(wire: WireType) -> ValueKind {
    match wire {
        WireType::I32 => ValueKind::I32,
        WireType::I64 => ValueKind::I64,
        WireType::F32 => ValueKind::F32,
        WireType::F64 => ValueKind::F64,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Signatures
// ══════════════════════════════════════════════════════════════════════════════

/// Parameter and result kinds of a guest export or host import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub params: Vec<ValueKind>,
    pub results: Vec<ValueKind>,
}

impl FunctionSignature {
    pub fn new(params: impl Into<Vec<ValueKind>>, results: impl Into<Vec<ValueKind>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Signature inferred from raw wasm types.
    pub fn from_wire(params: &[WireType], results: &[WireType]) -> Self {
        Self {
            params: params.iter().map(|w| default_kind(*w)).collect(),
            results: results.iter().map(|w| default_kind(*w)).collect(),
        }
    }

    pub fn wire_params(&self) -> Vec<WireType> {
        lower_kinds(&self.params)
    }

    pub fn wire_results(&self) -> Vec<WireType> {
        lower_kinds(&self.results)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Marshalling
// ══════════════════════════════════════════════════════════════════════════════

/// Lower values to words, copying strings into guest memory.
///
/// Empty strings are passed as `(0, 0)` without touching the allocator.
pub fn lower_values<M>(values: &[TypedValue], mem: &mut M) -> Result<Vec<Word>, SandboxError>
where
    M: GuestMemory + ?Sized,
{
    let mut words = Vec::with_capacity(values.len());
    for value in values {
        match value {
            TypedValue::U32(v) => words.push(Word::I32(*v as i32)),
            TypedValue::I32(v) => words.push(Word::I32(*v)),
            TypedValue::U64(v) => words.push(Word::I64(*v as i64)),
            TypedValue::I64(v) => words.push(Word::I64(*v)),
            TypedValue::F32(v) => words.push(Word::F32(*v)),
            TypedValue::F64(v) => words.push(Word::F64(*v)),
            TypedValue::String(s) => {
                let len = u32::try_from(s.len()).map_err(|_| {
                    SandboxError::Memory(format!("string of {} bytes does not fit", s.len()))
                })?;
                let ptr = if len == 0 { 0 } else { mem.alloc_bytes(s.as_bytes())? };
                words.push(Word::I32(ptr as i32));
                words.push(Word::I32(len as i32));
            }
        }
    }
    Ok(words)
}

/// Lift words to values of the given kinds, copying strings out of guest
/// memory.
pub fn lift_values<M>(
    kinds: &[ValueKind],
    words: &[Word],
    mem: &mut M,
) -> Result<Vec<TypedValue>, SandboxError>
where
    M: GuestMemory + ?Sized,
{
    let expected = lower_kinds(kinds).len();
    if words.len() != expected {
        return Err(SandboxError::Abi(format!(
            "expected {expected} word(s), got {}",
            words.len()
        )));
    }

    let mut it = words.iter().copied();
    let mut values = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let value = match (kind, it.next()) {
            (ValueKind::U32, Some(Word::I32(v))) => TypedValue::U32(v as u32),
            (ValueKind::I32, Some(Word::I32(v))) => TypedValue::I32(v),
            (ValueKind::U64, Some(Word::I64(v))) => TypedValue::U64(v as u64),
            (ValueKind::I64, Some(Word::I64(v))) => TypedValue::I64(v),
            (ValueKind::F32, Some(Word::F32(v))) => TypedValue::F32(v),
            (ValueKind::F64, Some(Word::F64(v))) => TypedValue::F64(v),
            (ValueKind::String, Some(Word::I32(ptr))) => {
                let Some(Word::I32(len)) = it.next() else {
                    return Err(SandboxError::Abi("string length word missing".into()));
                };
                let bytes = if len == 0 {
                    Vec::new()
                } else {
                    mem.read_bytes(ptr as u32, len as u32)?
                };
                TypedValue::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            (kind, word) => {
                return Err(SandboxError::Abi(format!(
                    "cannot read {kind} from {word:?}"
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}
