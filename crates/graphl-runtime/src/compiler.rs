//! The compiler collaborator.
//!
//! The runtime never inspects source text. Anything that turns graphl source
//! into a wasm buffer implements [`Compiler`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use crate::host::HostBindings;
use crate::program::ProgramRuntime;

/// A source-level error reported by the compiler, surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostic {
    pub source_name: String,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CompileDiagnostic {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => {
                write!(f, "{}:{}:{}: {}", self.source_name, line, col, self.message)
            }
            (Some(line), None) => write!(f, "{}:{}: {}", self.source_name, line, self.message),
            _ => write!(f, "{}: {}", self.source_name, self.message),
        }
    }
}

impl std::error::Error for CompileDiagnostic {}

/// Bytecode produced by a [`Compiler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    source_name: String,
    bytecode: Vec<u8>,
}

impl CompiledModule {
    pub fn new(source_name: impl Into<String>, bytecode: Vec<u8>) -> Self {
        Self {
            source_name: source_name.into(),
            bytecode,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn into_bytecode(self) -> Vec<u8> {
        self.bytecode
    }

    /// SHA-256 of the bytecode, lowercase hex.
    pub fn digest(&self) -> String {
        digest(&self.bytecode)
    }
}

pub(crate) fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub trait Compiler {
    fn compile(&self, source_name: &str, source: &str) -> Result<CompiledModule, CompileDiagnostic>;
}

impl<F> Compiler for F
where
    F: Fn(&str, &str) -> Result<CompiledModule, CompileDiagnostic>,
{
    fn compile(&self, source_name: &str, source: &str) -> Result<CompiledModule, CompileDiagnostic> {
        self(source_name, source)
    }
}

/// Compile `source` and instantiate the result against the process-wide
/// registry.
///
/// A compile failure is returned as [`RuntimeError::Compile`](crate::RuntimeError::Compile)
/// and no sandbox is created.
pub fn compile_and_instantiate<C>(
    compiler: &C,
    source_name: &str,
    source: &str,
    host: &HostBindings,
    config: RuntimeConfig,
) -> RuntimeResult<ProgramRuntime>
where
    C: Compiler + ?Sized,
{
    let compiled = compiler.compile(source_name, source)?;
    let mut runtime = ProgramRuntime::new(config, graphl_types::TypeRegistry::global());
    runtime.instantiate_compiled(&compiled, host)?;
    Ok(runtime)
}
