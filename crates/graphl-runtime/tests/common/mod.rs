//! Guest module fixtures assembled with `wasm-encoder`.
//!
//! Every fixture exports `memory` and a bump `alloc`, so strings and structs
//! can be copied in. Function indices: imports first, in declaration order,
//! then functions in declaration order, then `alloc`.

#![allow(dead_code)]

use std::borrow::Cow;
use std::sync::Arc;

use graphl_runtime::{HostBindings, ProgramRuntime, RuntimeConfig};
use graphl_types::TypeRegistry;
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, GlobalSection, GlobalType, ImportSection,
    Instruction, MemArg, MemorySection, MemoryType, Module, TypeSection, ValType,
};

pub const HEAP_START: i32 = 4096;
pub const GLOBAL_HEAP: u32 = 0;
pub const GLOBAL_COUNTER: u32 = 1;

/// Where `"hello"` lives in fixtures that carry it.
pub const GREETING_AT: i32 = 16;

pub fn memarg(offset: u64, align: u32) -> MemArg {
    MemArg {
        offset,
        align,
        memory_index: 0,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Builder
// ══════════════════════════════════════════════════════════════════════════════

pub struct GuestBuilder {
    types: TypeSection,
    type_count: u32,
    imports: ImportSection,
    import_count: u32,
    funcs: Vec<(u32, Function, String)>,
    data: Vec<(i32, Vec<u8>)>,
    custom: Vec<(String, Vec<u8>)>,
    trapping_alloc: bool,
}

impl GuestBuilder {
    pub fn new() -> Self {
        Self {
            types: TypeSection::new(),
            type_count: 0,
            imports: ImportSection::new(),
            import_count: 0,
            funcs: Vec::new(),
            data: Vec::new(),
            custom: Vec::new(),
            trapping_alloc: false,
        }
    }

    fn add_type(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        self.types
            .ty()
            .function(params.iter().copied(), results.iter().copied());
        self.type_count += 1;
        self.type_count - 1
    }

    /// Import `env.<name>`. Must be called before any [`func`](Self::func).
    pub fn import(self, name: &str, params: &[ValType], results: &[ValType]) -> Self {
        self.import_from("env", name, params, results)
    }

    pub fn import_from(
        mut self,
        module: &str,
        name: &str,
        params: &[ValType],
        results: &[ValType],
    ) -> Self {
        assert!(self.funcs.is_empty(), "imports must precede functions");
        let ty = self.add_type(params, results);
        self.imports.import(module, name, EntityType::Function(ty));
        self.import_count += 1;
        self
    }

    /// Exported function; `End` is appended to `body`.
    pub fn func(
        self,
        export: &str,
        params: &[ValType],
        results: &[ValType],
        body: &[Instruction<'_>],
    ) -> Self {
        self.func_with_locals(export, params, results, vec![], body)
    }

    pub fn func_with_locals(
        mut self,
        export: &str,
        params: &[ValType],
        results: &[ValType],
        locals: Vec<(u32, ValType)>,
        body: &[Instruction<'_>],
    ) -> Self {
        let ty = self.add_type(params, results);
        let mut f = Function::new(locals);
        for instr in body {
            f.instruction(instr);
        }
        f.instruction(&Instruction::End);
        self.funcs.push((ty, f, export.to_owned()));
        self
    }

    pub fn data(mut self, offset: i32, bytes: &[u8]) -> Self {
        self.data.push((offset, bytes.to_vec()));
        self
    }

    /// Attach `json` as the `graphl` metadata section.
    pub fn metadata(self, json: &str) -> Self {
        self.custom("graphl", json.as_bytes())
    }

    pub fn custom(mut self, name: &str, bytes: &[u8]) -> Self {
        self.custom.push((name.to_owned(), bytes.to_vec()));
        self
    }

    /// Make `alloc` execute `unreachable`.
    pub fn trapping_alloc(mut self) -> Self {
        self.trapping_alloc = true;
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let alloc_ty = self.add_type(&[ValType::I32], &[ValType::I32]);

        let mut functions = FunctionSection::new();
        let mut code = CodeSection::new();
        let mut exports = ExportSection::new();
        for (i, (ty, body, name)) in self.funcs.iter().enumerate() {
            functions.function(*ty);
            code.function(body);
            exports.export(name, ExportKind::Func, self.import_count + i as u32);
        }
        functions.function(alloc_ty);
        code.function(&alloc_body(self.trapping_alloc));
        exports.export(
            "alloc",
            ExportKind::Func,
            self.import_count + self.funcs.len() as u32,
        );
        exports.export("memory", ExportKind::Memory, 0);

        let mut memory = MemorySection::new();
        memory.memory(MemoryType {
            minimum: 1,
            maximum: Some(16),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });

        let mut globals = GlobalSection::new();
        for init in [HEAP_START, 0] {
            globals.global(
                GlobalType {
                    val_type: ValType::I32,
                    mutable: true,
                    shared: false,
                },
                &ConstExpr::i32_const(init),
            );
        }

        let mut module = Module::new();
        module.section(&self.types);
        if self.import_count > 0 {
            module.section(&self.imports);
        }
        module.section(&functions);
        module.section(&memory);
        module.section(&globals);
        module.section(&exports);
        module.section(&code);
        if !self.data.is_empty() {
            let mut data = DataSection::new();
            for (offset, bytes) in &self.data {
                data.active(0, &ConstExpr::i32_const(*offset), bytes.iter().copied());
            }
            module.section(&data);
        }
        for (name, bytes) in &self.custom {
            module.section(&CustomSection {
                name: Cow::Borrowed(name.as_str()),
                data: Cow::Borrowed(bytes.as_slice()),
            });
        }

        let bytes = module.finish();
        wasmparser::validate(&bytes).expect("fixture must be valid wasm");
        bytes
    }
}

/// `alloc(len) -> ptr`: bump the heap pointer, no reuse.
fn alloc_body(trapping: bool) -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]);
    if trapping {
        f.instruction(&Instruction::Unreachable);
        f.instruction(&Instruction::End);
        return f;
    }
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP));
    f.instruction(&Instruction::LocalSet(1));
    f.instruction(&Instruction::GlobalGet(GLOBAL_HEAP));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(GLOBAL_HEAP));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

// ══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ══════════════════════════════════════════════════════════════════════════════

pub const BASIC_METADATA: &str = r#"{
  "version": 1,
  "structs": [
    { "name": "fx_vec3", "size": 24, "fields": [
      { "name": "x", "type": "f64", "offset": 0 },
      { "name": "y", "type": "f64", "offset": 8 },
      { "name": "z", "type": "f64", "offset": 16 } ] },
    { "name": "fx_label", "size": 12, "fields": [
      { "name": "text", "type": "string", "offset": 0 },
      { "name": "id", "type": "u32", "offset": 8 } ] }
  ],
  "functions": {
    "greeting":   { "results": ["string"] },
    "strlen":     { "params": ["string"], "results": ["u32"] },
    "echo":       { "params": ["string"], "results": ["string"] },
    "first_byte": { "params": ["string"], "results": ["u32"] },
    "vec3_sum":   { "params": ["fx_vec3"], "results": ["f64"] },
    "bump_x":     { "params": ["fx_vec3"], "results": ["void"] },
    "label_len":  { "params": ["fx_label"], "results": ["u32"] }
  }
}"#;

/// The module most runtime tests run against.
pub fn basic_guest() -> Vec<u8> {
    basic_builder().finish()
}

pub fn basic_builder() -> GuestBuilder {
    use Instruction as I;
    use ValType::{F32, F64, I32, I64};

    GuestBuilder::new()
        .func(
            "_initialize",
            &[],
            &[],
            &[I::I32Const(100), I::GlobalSet(GLOBAL_COUNTER)],
        )
        .func("answer", &[], &[I32], &[I::I32Const(42)])
        .func("ok_fn", &[], &[I32], &[I::I32Const(1)])
        .func("boom", &[], &[I32], &[I::Unreachable])
        .func(
            "add",
            &[I32, I32],
            &[I32],
            &[I::LocalGet(0), I::LocalGet(1), I::I32Add],
        )
        .func(
            "div",
            &[I32, I32],
            &[I32],
            &[I::LocalGet(0), I::LocalGet(1), I::I32DivS],
        )
        .func(
            "oob",
            &[],
            &[I32],
            &[I::I32Const(-16), I::I32Load(memarg(0, 2))],
        )
        .func(
            "mul64",
            &[I64, I64],
            &[I64],
            &[I::LocalGet(0), I::LocalGet(1), I::I64Mul],
        )
        .func(
            "add_f64",
            &[F64, F64],
            &[F64],
            &[I::LocalGet(0), I::LocalGet(1), I::F64Add],
        )
        .func(
            "mul_f32",
            &[F32, F32],
            &[F32],
            &[I::LocalGet(0), I::LocalGet(1), I::F32Mul],
        )
        .func(
            "counter",
            &[],
            &[I32],
            &[
                I::GlobalGet(GLOBAL_COUNTER),
                I::I32Const(1),
                I::I32Add,
                I::GlobalSet(GLOBAL_COUNTER),
                I::GlobalGet(GLOBAL_COUNTER),
            ],
        )
        .func(
            "greeting",
            &[],
            &[I32, I32],
            &[I::I32Const(GREETING_AT), I::I32Const(5)],
        )
        .func("strlen", &[I32, I32], &[I32], &[I::LocalGet(1)])
        .func(
            "echo",
            &[I32, I32],
            &[I32, I32],
            &[I::LocalGet(0), I::LocalGet(1)],
        )
        .func(
            "first_byte",
            &[I32, I32],
            &[I32],
            &[I::LocalGet(0), I::I32Load8U(memarg(0, 0))],
        )
        .func("pair", &[], &[I32, I32], &[I::I32Const(7), I::I32Const(-7)])
        .func("nothing", &[], &[], &[])
        .func(
            "vec3_sum",
            &[I32],
            &[F64],
            &[
                I::LocalGet(0),
                I::F64Load(memarg(0, 3)),
                I::LocalGet(0),
                I::F64Load(memarg(8, 3)),
                I::F64Add,
                I::LocalGet(0),
                I::F64Load(memarg(16, 3)),
                I::F64Add,
            ],
        )
        .func(
            "bump_x",
            &[I32],
            &[],
            &[
                I::LocalGet(0),
                I::LocalGet(0),
                I::F64Load(memarg(0, 3)),
                I::LocalGet(0),
                I::F64Load(memarg(0, 3)),
                I::F64Add,
                I::F64Store(memarg(0, 3)),
            ],
        )
        .func(
            "label_len",
            &[I32],
            &[I32],
            &[I::LocalGet(0), I::I32Load(memarg(4, 2))],
        )
        .func(
            "spin",
            &[],
            &[],
            &[I::Loop(BlockType::Empty), I::Br(0), I::End],
        )
        .data(GREETING_AT, b"hello")
        .metadata(BASIC_METADATA)
}

/// Imports, by index:
/// 0 `double(i32) -> i32`, 1 `shout(ptr, len) -> (ptr, len)`,
/// 2 `fail_soft() -> i32`, 3 `fail_hard() -> i32`.
pub fn host_guest() -> Vec<u8> {
    use Instruction as I;
    use ValType::I32;

    GuestBuilder::new()
        .import("double", &[I32], &[I32])
        .import("shout", &[I32, I32], &[I32, I32])
        .import("fail_soft", &[], &[I32])
        .import("fail_hard", &[], &[I32])
        .func("call_double", &[I32], &[I32], &[I::LocalGet(0), I::Call(0)])
        .func(
            "shout_greeting",
            &[],
            &[I32, I32],
            &[I::I32Const(GREETING_AT), I::I32Const(5), I::Call(1)],
        )
        .func("soft", &[], &[I32], &[I::Call(2)])
        .func("hard", &[], &[I32], &[I::Call(3)])
        .func("ok_fn", &[], &[I32], &[I::I32Const(1)])
        .data(GREETING_AT, b"hello")
        .metadata(r#"{ "functions": { "shout_greeting": { "results": ["string"] } } }"#)
        .finish()
}

/// A runtime against its own registry so struct declarations stay local.
pub fn runtime(config: RuntimeConfig) -> ProgramRuntime {
    ProgramRuntime::new(config, Arc::new(TypeRegistry::new()))
}

pub fn ready(bytecode: &[u8], host: &HostBindings) -> ProgramRuntime {
    let mut rt = runtime(RuntimeConfig::default());
    rt.instantiate(bytecode, host).expect("fixture instantiates");
    rt
}
