//! Tagged values crossing the host/guest boundary.
//!
//! A [`TypedValue`] carries exactly one payload of a fixed set of kinds.
//! Accessors never coerce: asking a `U32` value for an `I64` is an error
//! (`try_*`) or a panic (`get_*`), never a widening.
//!
//! All per-kind accessors funnel through [`TypedValue::try_get`] and
//! [`TypedValue::get`], generic over the [`Payload`] trait.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeMismatchError;

// ══════════════════════════════════════════════════════════════════════════════
// ValueKind
// ══════════════════════════════════════════════════════════════════════════════

/// The tag of a [`TypedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
    String,
}

impl ValueKind {
    /// Every kind, in declaration order.
    pub const ALL: [ValueKind; 7] = [
        ValueKind::U32,
        ValueKind::U64,
        ValueKind::I32,
        ValueKind::I64,
        ValueKind::F32,
        ValueKind::F64,
        ValueKind::String,
    ];

    /// Upper-case display name (`"U32"`, `"String"`, …).
    pub fn name(self) -> &'static str {
        match self {
            Self::U32 => "U32",
            Self::U64 => "U64",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::String => "String",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// TypedValue
// ══════════════════════════════════════════════════════════════════════════════

/// A value passed as an argument to, or returned from, a guest or host
/// function.
///
/// Strings are owned: guest memory may be reused as soon as the call that
/// produced them returns, so the payload is always a host-side copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl TypedValue {
    /// The tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::U32(_) => ValueKind::U32,
            Self::U64(_) => ValueKind::U64,
            Self::I32(_) => ValueKind::I32,
            Self::I64(_) => ValueKind::I64,
            Self::F32(_) => ValueKind::F32,
            Self::F64(_) => ValueKind::F64,
            Self::String(_) => ValueKind::String,
        }
    }

    /// Extract a payload of type `T`, or report which kind was found instead.
    pub fn try_get<T: Payload>(&self) -> Result<T, TypeMismatchError> {
        T::extract(self).ok_or_else(|| TypeMismatchError::new(T::KIND, self.kind()))
    }

    /// Extract a payload of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the value holds a different kind. A mismatch here is a bug
    /// at the call site; use [`TypedValue::try_get`] when the kind is not
    /// statically known.
    #[track_caller]
    pub fn get<T: Payload>(&self) -> T {
        match T::extract(self) {
            Some(v) => v,
            None => mismatch_abort(T::KIND, self.kind()),
        }
    }

    /// Borrow the string payload.
    pub fn try_string(&self) -> Result<&str, TypeMismatchError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(TypeMismatchError::new(ValueKind::String, other.kind())),
        }
    }

    /// Borrow the string payload.
    ///
    /// # Panics
    ///
    /// Panics if the value is not a `String`.
    #[track_caller]
    pub fn get_string(&self) -> &str {
        match self {
            Self::String(s) => s,
            other => mismatch_abort(ValueKind::String, other.kind()),
        }
    }

    /// Take the string payload by value.
    pub fn into_string(self) -> Result<String, TypeMismatchError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(TypeMismatchError::new(ValueKind::String, other.kind())),
        }
    }
}

#[cold]
#[track_caller]
fn mismatch_abort(expected: ValueKind, actual: ValueKind) -> ! {
    panic!("{}", TypeMismatchError::new(expected, actual))
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U32(v) => write!(f, "{v}u32"),
            Self::U64(v) => write!(f, "{v}u64"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::I64(v) => write!(f, "{v}i64"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Payload
// ══════════════════════════════════════════════════════════════════════════════

/// A Rust type that is the payload of exactly one [`ValueKind`].
pub trait Payload: Sized {
    /// The kind whose payload this type is.
    const KIND: ValueKind;

    /// Copy the payload out if `value` has kind [`Payload::KIND`].
    fn extract(value: &TypedValue) -> Option<Self>;

    /// Wrap this payload in its tagged value.
    fn into_value(self) -> TypedValue;
}

impl Payload for String {
    const KIND: ValueKind = ValueKind::String;

    fn extract(value: &TypedValue) -> Option<Self> {
        match value {
            TypedValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn into_value(self) -> TypedValue {
        TypedValue::String(self)
    }
}

impl From<String> for TypedValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

macro_rules! scalar_payloads {
    ($($variant:ident => $ty:ty, $get:ident, $try:ident;)*) => {
        $(
            impl Payload for $ty {
                const KIND: ValueKind = ValueKind::$variant;

                fn extract(value: &TypedValue) -> Option<Self> {
                    match value {
                        TypedValue::$variant(v) => Some(*v),
                        _ => None,
                    }
                }

                fn into_value(self) -> TypedValue {
                    TypedValue::$variant(self)
                }
            }

            impl From<$ty> for TypedValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*

        impl TypedValue {
            $(
                #[doc = concat!("The `", stringify!($ty), "` payload. Panics on any other kind.")]
                #[track_caller]
                pub fn $get(&self) -> $ty {
                    self.get::<$ty>()
                }

                #[doc = concat!("The `", stringify!($ty), "` payload, or a [`TypeMismatchError`].")]
                pub fn $try(&self) -> Result<$ty, TypeMismatchError> {
                    self.try_get::<$ty>()
                }
            )*
        }
    };
}

scalar_payloads! {
    U32 => u32, get_u32, try_u32;
    U64 => u64, get_u64, try_u64;
    I32 => i32, get_i32, try_i32;
    I64 => i64, get_i64, try_i64;
    F32 => f32, get_f32, try_f32;
    F64 => f64, get_f64, try_f64;
}
