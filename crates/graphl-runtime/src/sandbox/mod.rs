//! The execution engine a [`ProgramRuntime`](crate::ProgramRuntime) drives.
//!
//! A sandbox speaks raw wasm words only; typed marshalling lives in
//! [`abi`](crate::abi) and sits on top of [`GuestMemory`].

mod wasmi_backend;

use thiserror::Error;

use crate::abi::{WireType, Word};
use crate::config::RuntimeConfig;
use crate::host::HostBindings;

pub use wasmi_backend::WasmiSandbox;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("{0}")]
    Load(String),

    #[error("unresolved import `{module}.{name}`")]
    UnresolvedImport { module: String, name: String },

    /// The binding for an import exists but its wasm type differs.
    #[error("import `{module}.{name}` has type {expected}, host binding declares {bound}")]
    ImportSignature {
        module: String,
        name: String,
        expected: String,
        bound: String,
    },

    #[error("missing export `{0}`")]
    MissingExport(String),

    /// Guest execution aborted. `fatal` traps leave the instance unusable.
    #[error("{message}")]
    Trap { message: String, fatal: bool },

    #[error("guest memory: {0}")]
    Memory(String),

    #[error("abi mismatch: {0}")]
    Abi(String),
}

impl SandboxError {
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Trap { fatal: true, .. })
    }
}

/// Raw wasm signature of an exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub params: Vec<WireType>,
    pub results: Vec<WireType>,
}

/// Byte-level access to guest linear memory.
pub trait GuestMemory {
    /// Allocate `bytes.len()` bytes with the guest allocator and copy `bytes`
    /// there. A trap inside the allocator is reported as fatal.
    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<u32, SandboxError>;

    fn read_bytes(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, SandboxError>;
}

/// A loaded, linked module instance.
///
/// Implementations are not reentrant; the runtime holds `&mut` for every
/// operation.
pub trait Sandbox: GuestMemory + Sized {
    /// Load `bytecode` and link every import against `host`.
    ///
    /// No guest code other than a wasm start function runs here.
    fn load(
        bytecode: &[u8],
        host: &HostBindings,
        config: &RuntimeConfig,
    ) -> Result<Self, SandboxError>;

    /// Exported functions with their raw signatures.
    fn exports(&self) -> Vec<ExportInfo>;

    /// Run `entry` once if the module exports it. Returns whether it ran.
    fn run_initializer(&mut self, entry: &str) -> Result<bool, SandboxError>;

    fn invoke(&mut self, name: &str, args: &[Word]) -> Result<Vec<Word>, SandboxError>;

    /// Tear the instance down.
    fn release(self) {
        drop(self);
    }
}
