//! [`Sandbox`] backed by the `wasmi` interpreter.

use std::collections::HashSet;

use tracing::{debug, warn};
use wasmi::core::ValType;
use wasmi::{
    AsContext, AsContextMut, Caller, Config, Engine, Extern, ExternType, Func, FuncType, Instance,
    Linker, Memory, Module, Store, Val,
};

use super::{ExportInfo, GuestMemory, Sandbox, SandboxError};
use crate::abi::{self, FunctionSignature, WireType, Word};
use crate::config::RuntimeConfig;
use crate::host::{HostBindings, HostCallError, HostFunction, HostFunctionContext};

/// Per-store data visible to host callbacks.
struct SandboxState {
    memory_export: String,
    alloc_export: String,
    /// Set by a failing host function; read back once the trap unwinds.
    fault: Option<HostFault>,
}

#[derive(Debug)]
struct HostFault {
    message: String,
    fatal: bool,
}

pub struct WasmiSandbox {
    store: Store<SandboxState>,
    instance: Instance,
    module: Module,
    fuel: Option<u64>,
}

impl WasmiSandbox {
    fn memory(&self) -> Result<Memory, SandboxError> {
        let name = &self.store.data().memory_export;
        self.instance
            .get_memory(&self.store, name)
            .ok_or_else(|| SandboxError::MissingExport(name.clone()))
    }

    fn alloc_func(&self) -> Result<Func, SandboxError> {
        let name = &self.store.data().alloc_export;
        self.instance
            .get_func(&self.store, name)
            .ok_or_else(|| SandboxError::MissingExport(name.clone()))
    }

    fn refuel(&mut self) -> Result<(), SandboxError> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| SandboxError::trap(format!("cannot set fuel: {e}")))?;
        }
        Ok(())
    }

    /// Turn an engine error into a trap, preferring a recorded host fault.
    fn trap_from(&mut self, err: wasmi::Error) -> SandboxError {
        match self.store.data_mut().fault.take() {
            Some(fault) => SandboxError::Trap {
                message: fault.message,
                fatal: fault.fatal,
            },
            None => SandboxError::trap(err.to_string()),
        }
    }
}

impl Sandbox for WasmiSandbox {
    fn load(
        bytecode: &[u8],
        host: &HostBindings,
        config: &RuntimeConfig,
    ) -> Result<Self, SandboxError> {
        let mut engine_config = Config::default();
        if config.fuel_per_call.is_some() {
            engine_config.consume_fuel(true);
        }
        let engine = Engine::new(&engine_config);
        let module =
            Module::new(&engine, bytecode).map_err(|e| SandboxError::Load(e.to_string()))?;

        let state = SandboxState {
            memory_export: config.memory_export.clone(),
            alloc_export: config.alloc_export.clone(),
            fault: None,
        };
        let mut store = Store::new(&engine, state);
        let mut linker = <Linker<SandboxState>>::new(&engine);

        let mut linked = HashSet::new();
        for import in module.imports() {
            let (module_name, name) = (import.module(), import.name());
            let unresolved = || SandboxError::UnresolvedImport {
                module: module_name.to_owned(),
                name: name.to_owned(),
            };
            let ExternType::Func(expected) = import.ty() else {
                return Err(unresolved());
            };
            let function = host
                .resolve(module_name, name, &config.host_module)
                .ok_or_else(unresolved)?;
            if !linked.insert((module_name.to_owned(), name.to_owned())) {
                continue;
            }
            let ty = host_func_type(function);
            if ty.params() != expected.params() || ty.results() != expected.results() {
                return Err(SandboxError::ImportSignature {
                    module: module_name.to_owned(),
                    name: name.to_owned(),
                    expected: describe(expected),
                    bound: describe(&ty),
                });
            }
            link_host_function(&mut linker, module_name, name, function.clone(), ty)?;
            debug!(module = module_name, import = name, "linked host function");
        }

        if let Some(fuel) = config.fuel_per_call {
            store
                .set_fuel(fuel)
                .map_err(|e| SandboxError::Load(e.to_string()))?;
        }
        let pre = linker
            .instantiate(&mut store, &module)
            .map_err(|e| SandboxError::Load(e.to_string()))?;
        let instance = match pre.start(&mut store) {
            Ok(instance) => instance,
            Err(e) => {
                let fault = store.data_mut().fault.take();
                return Err(SandboxError::Trap {
                    message: fault.as_ref().map_or_else(|| e.to_string(), |f| f.message.clone()),
                    fatal: true,
                });
            }
        };

        Ok(Self {
            store,
            instance,
            module,
            fuel: config.fuel_per_call,
        })
    }

    fn exports(&self) -> Vec<ExportInfo> {
        self.module
            .exports()
            .filter_map(|export| {
                let ExternType::Func(ty) = export.ty() else {
                    return None;
                };
                let params = wire_types(ty.params());
                let results = wire_types(ty.results());
                match (params, results) {
                    (Some(params), Some(results)) => Some(ExportInfo {
                        name: export.name().to_owned(),
                        params,
                        results,
                    }),
                    _ => {
                        debug!(export = export.name(), "skipping export with reference types");
                        None
                    }
                }
            })
            .collect()
    }

    fn run_initializer(&mut self, entry: &str) -> Result<bool, SandboxError> {
        if self.instance.get_func(&self.store, entry).is_none() {
            return Ok(false);
        }
        self.invoke(entry, &[])?;
        Ok(true)
    }

    fn invoke(&mut self, name: &str, args: &[Word]) -> Result<Vec<Word>, SandboxError> {
        let func = self
            .instance
            .get_func(&self.store, name)
            .ok_or_else(|| SandboxError::MissingExport(name.to_owned()))?;
        let ty = func.ty(&self.store);
        let inputs: Vec<Val> = args.iter().copied().map(val_from_word).collect();
        let mut outputs: Vec<Val> = ty.results().iter().map(|t| Val::default(*t)).collect();

        self.store.data_mut().fault = None;
        self.refuel()?;
        if let Err(e) = func.call(&mut self.store, &inputs, &mut outputs) {
            return Err(self.trap_from(e));
        }
        outputs
            .iter()
            .map(word_from_val)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SandboxError::Abi(format!("`{name}` returned a non-numeric value")))
    }
}

impl GuestMemory for WasmiSandbox {
    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<u32, SandboxError> {
        let alloc = self.alloc_func()?;
        let memory = self.memory()?;
        self.refuel()?;
        alloc_in(&mut self.store, alloc, memory, bytes)
    }

    fn read_bytes(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
        let memory = self.memory()?;
        read_in(&self.store, memory, addr, len)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Host calls
// ══════════════════════════════════════════════════════════════════════════════

fn host_func_type(function: &HostFunction) -> FuncType {
    let sig = function.signature();
    FuncType::new(
        sig.wire_params().into_iter().map(val_type),
        sig.wire_results().into_iter().map(val_type),
    )
}

fn link_host_function(
    linker: &mut Linker<SandboxState>,
    module: &str,
    name: &str,
    function: HostFunction,
    ty: FuncType,
) -> Result<(), SandboxError> {
    let import = name.to_owned();
    linker
        .func_new(
            module,
            name,
            ty,
            move |mut caller: Caller<'_, SandboxState>, params: &[Val], results: &mut [Val]| {
                match dispatch(&mut caller, &import, &function, params) {
                    Ok(words) => {
                        for (slot, word) in results.iter_mut().zip(words) {
                            *slot = val_from_word(word);
                        }
                        Ok(())
                    }
                    Err(fault) => {
                        let message = fault.message.clone();
                        caller.data_mut().fault = Some(fault);
                        Err(wasmi::Error::new(message))
                    }
                }
            },
        )
        .map_err(|e| SandboxError::Load(e.to_string()))?;
    Ok(())
}

/// Lift guest words, run the host function, lower its result.
fn dispatch(
    caller: &mut Caller<'_, SandboxState>,
    name: &str,
    function: &HostFunction,
    params: &[Val],
) -> Result<Vec<Word>, HostFault> {
    let failed = |message: String, fatal: bool| HostFault {
        message: format!("host function `{name}` failed: {message}"),
        fatal,
    };
    let sig: FunctionSignature = function.signature();
    let words = params
        .iter()
        .map(word_from_val)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| failed("non-numeric argument".into(), false))?;

    let mut mem = CallerMemory { caller };
    let args = abi::lift_values(&sig.params, &words, &mut mem)
        .map_err(|e| failed(e.to_string(), e.is_fatal()))?;
    let ctx = HostFunctionContext::new(name, args);
    let value = function.call(&ctx).map_err(|e| {
        let fatal = matches!(e, HostCallError::Fatal(_));
        warn!(function = name, error = %e, fatal, "host function failed");
        failed(e.to_string(), fatal)
    })?;
    drop(ctx);
    abi::lower_values(std::slice::from_ref(&value), &mut mem)
        .map_err(|e| failed(e.to_string(), e.is_fatal()))
}

/// Guest memory reached from inside a host callback.
struct CallerMemory<'a, 'b> {
    caller: &'a mut Caller<'b, SandboxState>,
}

impl CallerMemory<'_, '_> {
    fn export(&self, name: &str) -> Option<Extern> {
        self.caller.get_export(name)
    }

    fn memory(&self) -> Result<Memory, SandboxError> {
        let name = self.caller.data().memory_export.clone();
        self.export(&name)
            .and_then(Extern::into_memory)
            .ok_or(SandboxError::MissingExport(name))
    }
}

impl GuestMemory for CallerMemory<'_, '_> {
    fn alloc_bytes(&mut self, bytes: &[u8]) -> Result<u32, SandboxError> {
        let name = self.caller.data().alloc_export.clone();
        let alloc = self
            .export(&name)
            .and_then(Extern::into_func)
            .ok_or(SandboxError::MissingExport(name))?;
        let memory = self.memory()?;
        alloc_in(&mut *self.caller, alloc, memory, bytes)
    }

    fn read_bytes(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
        let memory = self.memory()?;
        read_in(&*self.caller, memory, addr, len)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Memory helpers
// ══════════════════════════════════════════════════════════════════════════════

fn alloc_in(
    mut ctx: impl AsContextMut,
    alloc: Func,
    memory: Memory,
    bytes: &[u8],
) -> Result<u32, SandboxError> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| SandboxError::Memory(format!("{} bytes exceed guest range", bytes.len())))?;
    let mut out = [Val::I32(0)];
    alloc
        .call(&mut ctx, &[Val::I32(len)], &mut out)
        .map_err(|e| SandboxError::Trap {
            message: format!("allocator trapped: {e}"),
            fatal: true,
        })?;
    let ptr = match out[0] {
        Val::I32(ptr) => ptr as u32,
        _ => return Err(SandboxError::Abi("allocator must return i32".into())),
    };
    memory
        .write(&mut ctx, ptr as usize, bytes)
        .map_err(|e| SandboxError::Memory(format!("writing {} bytes at {ptr}: {e}", bytes.len())))?;
    Ok(ptr)
}

fn read_in(ctx: impl AsContext, memory: Memory, addr: u32, len: u32) -> Result<Vec<u8>, SandboxError> {
    let data = memory.data(&ctx);
    let start = addr as usize;
    start
        .checked_add(len as usize)
        .and_then(|end| data.get(start..end))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            SandboxError::Memory(format!(
                "read of {len} bytes at {addr} exceeds memory size {}",
                data.len()
            ))
        })
}

// ══════════════════════════════════════════════════════════════════════════════
// Value conversion
// ══════════════════════════════════════════════════════════════════════════════

fn val_type(wire: WireType) -> ValType {
    match wire {
        WireType::I32 => ValType::I32,
        WireType::I64 => ValType::I64,
        WireType::F32 => ValType::F32,
        WireType::F64 => ValType::F64,
    }
}

/// `(i32, i32) -> (i32)`
fn describe(ty: &FuncType) -> String {
    let list = |types: &[ValType]| {
        types
            .iter()
            .map(|t| format!("{t:?}").to_lowercase())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("({}) -> ({})", list(ty.params()), list(ty.results()))
}

fn wire_types(types: &[ValType]) -> Option<Vec<WireType>> {
    types
        .iter()
        .map(|ty| match ty {
            ValType::I32 => Some(WireType::I32),
            ValType::I64 => Some(WireType::I64),
            ValType::F32 => Some(WireType::F32),
            ValType::F64 => Some(WireType::F64),
            _ => None,
        })
        .collect()
}

fn val_from_word(word: Word) -> Val {
    match word {
        Word::I32(v) => Val::I32(v),
        Word::I64(v) => Val::I64(v),
        Word::F32(v) => Val::F32(v.into()),
        Word::F64(v) => Val::F64(v.into()),
    }
}

fn word_from_val(val: &Val) -> Option<Word> {
    match val {
        Val::I32(v) => Some(Word::I32(*v)),
        Val::I64(v) => Some(Word::I64(*v)),
        Val::F32(v) => Some(Word::F32(f32::from(*v))),
        Val::F64(v) => Some(Word::F64(f64::from(*v))),
        _ => None,
    }
}
