//! [`ProgramRuntime`]: one module instance and its call protocol.
//!
//! ```text
//! Uninstantiated ──instantiate──▶ Instantiating ──▶ Ready ◀──▶ CallInFlight
//!                                       │             │
//!                                       ▼             ▼ (fatal trap)
//!                                     Failed ◀────────┘
//!            any state ──close──▶ Closed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use graphl_types::{
    decode_struct, encode_struct, LayoutError, SliceAccess, StagedStructs, StructValue,
    TypeMismatchError, TypeRegistry, TypedValue,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::abi::{self, FunctionSignature};
use crate::compiler::{self, CompiledModule};
use crate::config::RuntimeConfig;
use crate::error::{InstantiationError, RuntimeError, RuntimeResult};
use crate::host::HostBindings;
use crate::metadata::ModuleMetadata;
use crate::sandbox::{GuestMemory, Sandbox, SandboxError, WasmiSandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RuntimeState {
    Uninstantiated,
    Instantiating,
    Ready,
    CallInFlight,
    Failed,
    Closed,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninstantiated => "uninstantiated",
            Self::Instantiating => "instantiating",
            Self::Ready => "ready",
            Self::CallInFlight => "call in flight",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

/// A compiled graphl module bound to its own sandbox.
///
/// All operations take `&mut self`: one call at a time per runtime. Separate
/// runtimes share nothing but the [`TypeRegistry`] they were given.
///
/// Dropping a runtime closes it.
pub struct ProgramRuntime<S: Sandbox = WasmiSandbox> {
    config: RuntimeConfig,
    registry: Arc<TypeRegistry>,
    state: RuntimeState,
    sandbox: Option<S>,
    exports: BTreeMap<String, FunctionSignature>,
    metadata: ModuleMetadata,
    digest: Option<String>,
    failure: Option<String>,
}

/// Instantiate `bytecode` with default configuration against the
/// process-wide registry.
pub fn instantiate(bytecode: &[u8], host: &HostBindings) -> RuntimeResult<ProgramRuntime> {
    let mut runtime = ProgramRuntime::new(RuntimeConfig::default(), TypeRegistry::global());
    runtime.instantiate(bytecode, host)?;
    Ok(runtime)
}

impl ProgramRuntime {
    pub fn new(config: RuntimeConfig, registry: Arc<TypeRegistry>) -> Self {
        Self::with_backend(config, registry)
    }
}

impl<S: Sandbox> ProgramRuntime<S> {
    /// A runtime driving a sandbox backend other than `wasmi`.
    pub fn with_backend(config: RuntimeConfig, registry: Arc<TypeRegistry>) -> Self {
        Self {
            config,
            registry,
            state: RuntimeState::Uninstantiated,
            sandbox: None,
            exports: BTreeMap::new(),
            metadata: ModuleMetadata::default(),
            digest: None,
            failure: None,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// SHA-256 of the instantiated bytecode.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Callable exports in name order. The initializer is not listed.
    pub fn exports(&self) -> impl Iterator<Item = (&str, &FunctionSignature)> + '_ {
        self.exports.iter().map(|(name, sig)| (name.as_str(), sig))
    }

    pub fn signature(&self, name: &str) -> Option<&FunctionSignature> {
        self.exports.get(name)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Instantiation
    // ══════════════════════════════════════════════════════════════════════

    pub fn instantiate_compiled(
        &mut self,
        module: &CompiledModule,
        host: &HostBindings,
    ) -> RuntimeResult<()> {
        self.instantiate(module.bytecode(), host)
    }

    /// Load `bytecode`, link `host`, and run the initializer.
    ///
    /// On failure the sandbox is released before returning and the runtime
    /// is left `Failed`.
    #[instrument(skip_all, fields(bytes = bytecode.len()))]
    pub fn instantiate(&mut self, bytecode: &[u8], host: &HostBindings) -> RuntimeResult<()> {
        if self.state != RuntimeState::Uninstantiated {
            return Err(RuntimeError::InvalidState {
                operation: "instantiate",
                state: self.state,
            });
        }
        self.state = RuntimeState::Instantiating;
        let digest = compiler::digest(bytecode);

        match self.bring_up(bytecode, host) {
            Ok(()) => {
                info!(%digest, exports = self.exports.len(), "module instantiated");
                self.digest = Some(digest);
                self.state = RuntimeState::Ready;
                Ok(())
            }
            Err(err) => {
                error!(%digest, error = %err, "instantiation failed");
                self.digest = Some(digest);
                self.failure = Some(err.to_string());
                self.state = RuntimeState::Failed;
                Err(err.into())
            }
        }
    }

    fn bring_up(&mut self, bytecode: &[u8], host: &HostBindings) -> Result<(), InstantiationError> {
        let metadata = ModuleMetadata::read_from_wasm(bytecode, &self.config.metadata_section)?
            .unwrap_or_default();
        // Module structs join the registry only once the module is up.
        let staged = self.registry.stage_structs(&metadata.structs)?;

        let mut sandbox = S::load(bytecode, host, &self.config).map_err(|e| match e {
            SandboxError::UnresolvedImport { module, name } => {
                InstantiationError::UnresolvedImport { module, name }
            }
            SandboxError::ImportSignature {
                module,
                name,
                expected,
                bound,
            } => InstantiationError::ImportSignature {
                module,
                name,
                expected,
                bound,
            },
            SandboxError::Trap { message, .. } => InstantiationError::Initializer {
                entry: "start".into(),
                message,
            },
            other => InstantiationError::Load(other.to_string()),
        })?;

        let prepared = resolve_exports(&sandbox, &metadata, &self.registry, &staged, &self.config)
            .and_then(|exports| initialize(&mut sandbox, &self.config).map(|()| exports))
            .and_then(|exports| {
                if !staged.is_empty() {
                    let declared = self.registry.commit(staged)?;
                    debug!(count = declared.len(), "declared module structs");
                }
                Ok(exports)
            });
        match prepared {
            Ok(exports) => {
                self.sandbox = Some(sandbox);
                self.exports = exports;
                self.metadata = metadata;
                Ok(())
            }
            Err(err) => {
                sandbox.release();
                Err(err)
            }
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Calls
    // ══════════════════════════════════════════════════════════════════════

    /// Call an export that returns exactly one value.
    #[instrument(skip(self, args), fields(argc = args.len()))]
    pub fn call_function(&mut self, name: &str, args: &[TypedValue]) -> RuntimeResult<TypedValue> {
        let sig = self.prepare_call(name, args)?;
        let result_count = |actual| RuntimeError::ResultCount {
            name: name.to_owned(),
            expected: 1,
            actual,
        };
        if sig.results.len() != 1 {
            return Err(result_count(sig.results.len()));
        }
        let mut values = self.dispatch(name, &sig, args)?;
        values.pop().ok_or_else(|| result_count(0))
    }

    /// Call an export returning any number of values.
    #[instrument(skip(self, args), fields(argc = args.len()))]
    pub fn call_function_multi(
        &mut self,
        name: &str,
        args: &[TypedValue],
    ) -> RuntimeResult<Vec<TypedValue>> {
        let sig = self.prepare_call(name, args)?;
        self.dispatch(name, &sig, args)
    }

    fn prepare_call(&self, name: &str, args: &[TypedValue]) -> RuntimeResult<FunctionSignature> {
        self.ensure_ready("call a function")?;
        let sig = self
            .exports
            .get(name)
            .ok_or_else(|| RuntimeError::NoSuchFunction {
                name: name.to_owned(),
                available: self.exports.keys().cloned().collect(),
            })?;
        if args.len() != sig.params.len() {
            return Err(RuntimeError::Arity {
                name: name.to_owned(),
                expected: sig.params.len(),
                actual: args.len(),
            });
        }
        for (index, (arg, kind)) in args.iter().zip(&sig.params).enumerate() {
            if arg.kind() != *kind {
                return Err(RuntimeError::ArgumentType {
                    function: name.to_owned(),
                    index,
                    source: TypeMismatchError::new(*kind, arg.kind()),
                });
            }
        }
        Ok(sig.clone())
    }

    fn dispatch(
        &mut self,
        name: &str,
        sig: &FunctionSignature,
        args: &[TypedValue],
    ) -> RuntimeResult<Vec<TypedValue>> {
        debug!(function = name, argc = args.len(), "calling export");
        let values = self.with_guest("call a function", name, |sandbox| {
            let words = abi::lower_values(args, sandbox)?;
            let out = sandbox.invoke(name, &words)?;
            Ok(abi::lift_values(&sig.results, &out, sandbox)?)
        })?;
        debug!(function = name, results = values.len(), "export returned");
        Ok(values)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Structs
    // ══════════════════════════════════════════════════════════════════════

    /// Copy `value` into guest memory and return its address.
    ///
    /// The address can be passed to any export declaring a parameter of the
    /// struct's type.
    pub fn write_struct(&mut self, value: &StructValue) -> RuntimeResult<u32> {
        self.ensure_ready("write a struct")?;
        let descriptor = self.registry.lookup(&value.type_name)?;
        self.with_guest("write a struct", &value.type_name, |sandbox| {
            let mut slices = GuestSlices::new(&mut *sandbox);
            match encode_struct(&descriptor, value, &mut slices) {
                Ok(bytes) => {
                    drop(slices);
                    Ok(sandbox.alloc_bytes(&bytes)?)
                }
                Err(err) => Err(slices.into_fault(err)),
            }
        })
    }

    /// Read a struct of type `type_name` at `address`.
    pub fn read_struct(&mut self, type_name: &str, address: u32) -> RuntimeResult<StructValue> {
        self.ensure_ready("read a struct")?;
        let descriptor = self.registry.lookup(type_name)?;
        self.with_guest("read a struct", type_name, |sandbox| {
            let bytes = sandbox.read_bytes(address, descriptor.size())?;
            let mut slices = GuestSlices::new(sandbox);
            decode_struct(&descriptor, &bytes, &mut slices).map_err(|err| slices.into_fault(err))
        })
    }

    // ══════════════════════════════════════════════════════════════════════
    // Teardown
    // ══════════════════════════════════════════════════════════════════════

    /// Release the sandbox. Idempotent.
    pub fn close(&mut self) {
        if self.state == RuntimeState::Closed {
            return;
        }
        let released = match self.sandbox.take() {
            Some(sandbox) => {
                sandbox.release();
                true
            }
            None => false,
        };
        info!(
            digest = self.digest.as_deref().unwrap_or("-"),
            from = %self.state,
            released,
            "runtime closed"
        );
        self.state = RuntimeState::Closed;
    }

    // ══════════════════════════════════════════════════════════════════════
    // Internals
    // ══════════════════════════════════════════════════════════════════════

    fn ensure_ready(&self, operation: &'static str) -> RuntimeResult<()> {
        match self.state {
            RuntimeState::Ready => Ok(()),
            RuntimeState::Failed => Err(RuntimeError::RuntimeFailed {
                reason: self
                    .failure
                    .clone()
                    .unwrap_or_else(|| "unknown failure".into()),
            }),
            RuntimeState::Closed => Err(RuntimeError::Closed),
            state => Err(RuntimeError::InvalidState { operation, state }),
        }
    }

    /// Run `f` against the sandbox inside the `CallInFlight` window.
    fn with_guest<T>(
        &mut self,
        operation: &'static str,
        function: &str,
        f: impl FnOnce(&mut S) -> Result<T, CallFault>,
    ) -> RuntimeResult<T> {
        self.ensure_ready(operation)?;
        let Some(sandbox) = self.sandbox.as_mut() else {
            return Err(RuntimeError::Closed);
        };
        self.state = RuntimeState::CallInFlight;
        let outcome = f(sandbox);
        self.state = RuntimeState::Ready;
        outcome.map_err(|fault| match fault {
            CallFault::Sandbox(err) => self.classify(function, err),
            CallFault::Runtime(err) => err,
        })
    }

    fn classify(&mut self, function: &str, err: SandboxError) -> RuntimeError {
        match err {
            SandboxError::Trap {
                message,
                fatal: true,
            } => {
                let reason = format!("`{function}` trapped: {message}");
                error!(%reason, "runtime failed");
                self.state = RuntimeState::Failed;
                self.failure = Some(reason);
                RuntimeError::Trap {
                    function: function.to_owned(),
                    message,
                }
            }
            SandboxError::Trap { message, .. } => {
                warn!(function, %message, "guest trapped");
                RuntimeError::Trap {
                    function: function.to_owned(),
                    message,
                }
            }
            other => RuntimeError::Marshal {
                function: function.to_owned(),
                message: other.to_string(),
            },
        }
    }
}

impl<S: Sandbox> Drop for ProgramRuntime<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Sandbox> fmt::Debug for ProgramRuntime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRuntime")
            .field("state", &self.state)
            .field("digest", &self.digest)
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Error from inside the `CallInFlight` window.
enum CallFault {
    Sandbox(SandboxError),
    Runtime(RuntimeError),
}

impl From<SandboxError> for CallFault {
    fn from(err: SandboxError) -> Self {
        Self::Sandbox(err)
    }
}

impl From<LayoutError> for CallFault {
    fn from(err: LayoutError) -> Self {
        Self::Runtime(err.into())
    }
}

/// Struct string fields routed through guest memory.
struct GuestSlices<'a, M: GuestMemory + ?Sized> {
    memory: &'a mut M,
    fault: Option<SandboxError>,
}

impl<'a, M: GuestMemory + ?Sized> GuestSlices<'a, M> {
    fn new(memory: &'a mut M) -> Self {
        Self {
            memory,
            fault: None,
        }
    }

    fn record(&mut self, err: SandboxError) -> String {
        let message = err.to_string();
        self.fault = Some(err);
        message
    }

    /// A fatal sandbox fault outranks the layout error it caused.
    fn into_fault(self, err: LayoutError) -> CallFault {
        match self.fault {
            Some(fault) if fault.is_fatal() => CallFault::Sandbox(fault),
            _ => err.into(),
        }
    }
}

impl<M: GuestMemory + ?Sized> SliceAccess for GuestSlices<'_, M> {
    fn store(&mut self, text: &str) -> Result<(u32, u32), String> {
        let len = u32::try_from(text.len()).map_err(|_| format!("{} bytes do not fit", text.len()))?;
        if len == 0 {
            return Ok((0, 0));
        }
        match self.memory.alloc_bytes(text.as_bytes()) {
            Ok(ptr) => Ok((ptr, len)),
            Err(err) => Err(self.record(err)),
        }
    }

    fn load(&mut self, ptr: u32, len: u32) -> Result<String, String> {
        if len == 0 {
            return Ok(String::new());
        }
        match self.memory.read_bytes(ptr, len) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => Err(self.record(err)),
        }
    }
}

fn resolve_exports<S: Sandbox>(
    sandbox: &S,
    metadata: &ModuleMetadata,
    registry: &TypeRegistry,
    staged: &StagedStructs,
    config: &RuntimeConfig,
) -> Result<BTreeMap<String, FunctionSignature>, InstantiationError> {
    let mut exports = BTreeMap::new();
    for export in sandbox.exports() {
        if config.initializer.as_deref() == Some(export.name.as_str()) {
            continue;
        }
        let sig = match metadata.function(&export.name) {
            Some(declared) => {
                let sig = declared
                    .resolve_staged(registry, staged)
                    .map_err(|e| InstantiationError::Signature {
                        function: export.name.clone(),
                        message: e.to_string(),
                    })?;
                if sig.wire_params() != export.params || sig.wire_results() != export.results {
                    return Err(InstantiationError::Signature {
                        function: export.name.clone(),
                        message: format!(
                            "declared ({}) -> ({}) lowers to {:?} -> {:?}, but the export is {:?} -> {:?}",
                            declared.params.join(", "),
                            declared.results.join(", "),
                            sig.wire_params(),
                            sig.wire_results(),
                            export.params,
                            export.results
                        ),
                    });
                }
                sig
            }
            None => FunctionSignature::from_wire(&export.params, &export.results),
        };
        exports.insert(export.name, sig);
    }
    for name in metadata.functions.keys() {
        if !exports.contains_key(name) {
            warn!(function = %name, "metadata declares a function the module does not export");
        }
    }
    Ok(exports)
}

fn initialize<S: Sandbox>(sandbox: &mut S, config: &RuntimeConfig) -> Result<(), InstantiationError> {
    let Some(entry) = config.initializer.as_deref() else {
        return Ok(());
    };
    match sandbox.run_initializer(entry) {
        Ok(ran) => {
            debug!(entry, ran, "initializer step done");
            Ok(())
        }
        Err(err) => Err(InstantiationError::Initializer {
            entry: entry.to_owned(),
            message: err.to_string(),
        }),
    }
}
