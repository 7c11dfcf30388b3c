//! Graphl host runtime: runs compiled graphl modules in a wasm sandbox.
//!
//! # Architecture
//!
//! A [`ProgramRuntime`] owns exactly one [`Sandbox`] instance. It resolves
//! the module's exports against the signatures declared in the module's
//! metadata section, links the embedder's [`HostBindings`] to the module's
//! imports, and runs the initializer before the first call.
//!
//! ## Module contract
//!
//! Imports
//! - `env.<name>` for every host function the module calls
//! - `<module>.<name>` for functions bound with [`HostBindings::with_in`],
//!   such as `wasi_snapshot_preview1` imports
//!
//! Exports
//! - `memory`: linear memory
//! - `alloc(len) → ptr`: allocator used to copy strings and structs in
//! - `_initialize()`: optional, run once during instantiation
//! - any number of callable functions
//!
//! Custom sections
//! - `graphl`: JSON [`ModuleMetadata`] (structs and declared signatures)
//!
//! See [`abi`] for how each [`ValueKind`](graphl_types::ValueKind) lowers to
//! wasm words.
//!
//! ```no_run
//! use graphl_runtime::{instantiate, HostBindings, HostFunction};
//! use graphl_types::{TypedValue, ValueKind};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bytecode = std::fs::read("adder.wasm")?;
//! let host = HostBindings::new().with(
//!     "log",
//!     HostFunction::new([ValueKind::String], ValueKind::U32, |ctx| {
//!         println!("{}", ctx.args()[0].get_string());
//!         Ok(TypedValue::U32(0))
//!     }),
//! );
//! let mut runtime = instantiate(&bytecode, &host)?;
//! let sum = runtime.call_function("add", &[TypedValue::I32(2), TypedValue::I32(3)])?;
//! assert_eq!(sum.get_i32(), 5);
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod compiler;
pub mod config;
pub mod error;
pub mod host;
pub mod metadata;
pub mod program;
pub mod sandbox;

pub use abi::{FunctionSignature, WireType, Word};
pub use compiler::{compile_and_instantiate, CompileDiagnostic, CompiledModule, Compiler};
pub use config::RuntimeConfig;
pub use error::{InstantiationError, RuntimeError, RuntimeResult};
pub use host::{HostBindings, HostCallError, HostFunction, HostFunctionContext};
pub use metadata::{DeclaredSignature, MetadataError, ModuleMetadata};
pub use program::{instantiate, ProgramRuntime, RuntimeState};
pub use sandbox::{ExportInfo, GuestMemory, Sandbox, SandboxError, WasmiSandbox};
