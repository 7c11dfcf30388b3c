//! End-to-end behaviour of [`ProgramRuntime`] over the `wasmi` backend.

mod common;

use std::sync::Arc;
use std::thread;

use common::{basic_builder, basic_guest, ready, runtime, GuestBuilder};
use graphl_runtime::{
    compile_and_instantiate, CompileDiagnostic, CompiledModule, HostBindings, InstantiationError,
    ProgramRuntime, RuntimeConfig, RuntimeError, RuntimeState,
};
use graphl_types::{StructValue, TypeRegistry, TypedValue, ValueKind};
use wasm_encoder::{Instruction, ValType};

fn no_host() -> HostBindings {
    HostBindings::new()
}

// ══════════════════════════════════════════════════════════════════════════════
// Instantiation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn instantiate_reaches_ready() {
    let rt = ready(&basic_guest(), &no_host());
    assert_eq!(rt.state(), RuntimeState::Ready);
    assert!(rt.digest().is_some());
    assert_eq!(rt.metadata().structs.len(), 2);
}

#[test]
fn initializer_runs_once_before_first_call() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert_eq!(rt.call_function("counter", &[]).unwrap(), TypedValue::I32(101));
    assert_eq!(rt.call_function("counter", &[]).unwrap(), TypedValue::I32(102));
}

#[test]
fn initializer_can_be_disabled() {
    let mut rt = runtime(RuntimeConfig::default().with_initializer(None::<String>));
    rt.instantiate(&basic_guest(), &no_host()).unwrap();
    assert_eq!(rt.call_function("counter", &[]).unwrap(), TypedValue::I32(1));
}

#[test]
fn module_without_initializer_is_fine() {
    let bytes = GuestBuilder::new()
        .func("ok_fn", &[], &[ValType::I32], &[Instruction::I32Const(1)])
        .finish();
    let mut rt = ready(&bytes, &no_host());
    assert_eq!(rt.call_function("ok_fn", &[]).unwrap(), TypedValue::I32(1));
}

#[test]
fn initializer_is_not_callable() {
    let mut rt = ready(&basic_guest(), &no_host());
    let names: Vec<_> = rt.exports().map(|(name, _)| name.to_owned()).collect();
    assert!(!names.contains(&"_initialize".to_owned()));
    assert!(names.contains(&"ok_fn".to_owned()));
    assert!(matches!(
        rt.call_function_multi("_initialize", &[]),
        Err(RuntimeError::NoSuchFunction { .. })
    ));
}

#[test]
fn unresolved_import_fails_and_close_is_noop() {
    let bytes = GuestBuilder::new()
        .import("missing_host_fn", &[], &[ValType::I32])
        .func("ok_fn", &[], &[ValType::I32], &[Instruction::I32Const(1)])
        .finish();
    let mut rt = runtime(RuntimeConfig::default());
    let err = rt.instantiate(&bytes, &no_host()).unwrap_err();
    match err {
        RuntimeError::Instantiation(InstantiationError::UnresolvedImport { module, name }) => {
            assert_eq!(module, "env");
            assert_eq!(name, "missing_host_fn");
        }
        other => panic!("expected unresolved import, got {other}"),
    }
    assert_eq!(rt.state(), RuntimeState::Failed);
    rt.close();
    assert_eq!(rt.state(), RuntimeState::Closed);
    rt.close();
    assert_eq!(rt.state(), RuntimeState::Closed);
}

#[test]
fn trapping_initializer_fails_instantiation() {
    let bytes = GuestBuilder::new()
        .func("_initialize", &[], &[], &[Instruction::Unreachable])
        .finish();
    let mut rt = runtime(RuntimeConfig::default());
    let err = rt.instantiate(&bytes, &no_host()).unwrap_err();
    assert!(
        matches!(
            err,
            RuntimeError::Instantiation(InstantiationError::Initializer { ref entry, .. })
                if entry == "_initialize"
        ),
        "{err}"
    );
    assert!(matches!(
        rt.call_function("ok_fn", &[]),
        Err(RuntimeError::RuntimeFailed { .. })
    ));
}

#[test]
fn garbage_bytes_fail_to_load() {
    let mut rt = runtime(RuntimeConfig::default());
    let err = rt.instantiate(b"not wasm", &no_host()).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Instantiation(InstantiationError::Load(_))
    ));
}

#[test]
fn instantiate_twice_is_invalid() {
    let mut rt = ready(&basic_guest(), &no_host());
    let err = rt.instantiate(&basic_guest(), &no_host()).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::InvalidState {
            operation: "instantiate",
            state: RuntimeState::Ready
        }
    ));
    assert_eq!(rt.state(), RuntimeState::Ready);
}

#[test]
fn call_before_instantiate_is_invalid() {
    let mut rt = runtime(RuntimeConfig::default());
    assert!(matches!(
        rt.call_function("ok_fn", &[]),
        Err(RuntimeError::InvalidState {
            state: RuntimeState::Uninstantiated,
            ..
        })
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Metadata signatures
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn declared_signatures_override_wire_defaults() {
    let rt = ready(&basic_guest(), &no_host());
    let strlen = rt.signature("strlen").unwrap();
    assert_eq!(strlen.params, vec![ValueKind::String]);
    assert_eq!(strlen.results, vec![ValueKind::U32]);
    let add = rt.signature("add").unwrap();
    assert_eq!(add.params, vec![ValueKind::I32, ValueKind::I32]);
}

#[test]
fn mismatched_declaration_fails_instantiation() {
    let bytes = GuestBuilder::new()
        .func("answer", &[], &[ValType::I32], &[Instruction::I32Const(42)])
        .metadata(r#"{ "functions": { "answer": { "params": ["string"], "results": ["i32"] } } }"#)
        .finish();
    let mut rt = runtime(RuntimeConfig::default());
    let err = rt.instantiate(&bytes, &no_host()).unwrap_err();
    assert!(
        matches!(
            err,
            RuntimeError::Instantiation(InstantiationError::Signature { ref function, .. })
                if function == "answer"
        ),
        "{err}"
    );
}

#[test]
fn unknown_declared_type_fails_instantiation() {
    let bytes = GuestBuilder::new()
        .func("answer", &[], &[ValType::I32], &[Instruction::I32Const(42)])
        .metadata(r#"{ "functions": { "answer": { "results": ["quaternion"] } } }"#)
        .finish();
    let mut rt = runtime(RuntimeConfig::default());
    assert!(matches!(
        rt.instantiate(&bytes, &no_host()),
        Err(RuntimeError::Instantiation(InstantiationError::Signature { .. }))
    ));
}

#[test]
fn malformed_metadata_fails_instantiation() {
    let bytes = GuestBuilder::new().metadata("{ not json").finish();
    let mut rt = runtime(RuntimeConfig::default());
    assert!(matches!(
        rt.instantiate(&bytes, &no_host()),
        Err(RuntimeError::Instantiation(InstantiationError::Metadata(_)))
    ));
}

#[test]
fn module_structs_land_in_the_runtime_registry() {
    let rt = ready(&basic_guest(), &no_host());
    let vec3 = rt.registry().lookup("fx_vec3").unwrap();
    assert_eq!(rt.registry().size_of(&vec3), 24);
    assert_eq!(rt.registry().offset_of(&vec3, "z").unwrap(), 16);
}

#[test]
fn failed_instantiation_does_not_register_module_structs() {
    let registry = Arc::new(TypeRegistry::new());
    let broken = GuestBuilder::new()
        .import("missing", &[], &[ValType::I32])
        .func("ok_fn", &[], &[ValType::I32], &[Instruction::I32Const(1)])
        .metadata(
            r#"{ "structs": [{ "name": "pt", "size": 4, "fields": [
                { "name": "x", "type": "f32", "offset": 0 } ] }] }"#,
        )
        .finish();
    let mut first = ProgramRuntime::new(RuntimeConfig::default(), Arc::clone(&registry));
    assert!(matches!(
        first.instantiate(&broken, &no_host()),
        Err(RuntimeError::Instantiation(
            InstantiationError::UnresolvedImport { .. }
        ))
    ));
    assert!(!registry.contains("pt"));

    let fixed = GuestBuilder::new()
        .func("ok_fn", &[], &[ValType::I32], &[Instruction::I32Const(1)])
        .metadata(
            r#"{ "structs": [{ "name": "pt", "size": 8, "fields": [
                { "name": "x", "type": "f32", "offset": 0 },
                { "name": "y", "type": "f32", "offset": 4 } ] }] }"#,
        )
        .finish();
    let mut retry = ProgramRuntime::new(RuntimeConfig::default(), Arc::clone(&registry));
    retry.instantiate(&fixed, &no_host()).unwrap();
    assert_eq!(registry.lookup("pt").unwrap().size(), 8);
}

#[test]
fn trapping_initializer_does_not_register_module_structs() {
    let bytes = GuestBuilder::new()
        .func("_initialize", &[], &[], &[Instruction::Unreachable])
        .metadata(
            r#"{ "structs": [{ "name": "cell", "size": 4, "fields": [
                { "name": "v", "type": "u32", "offset": 0 } ] }],
                "functions": { "peek": { "params": ["cell"], "results": ["u32"] } } }"#,
        )
        .func("peek", &[ValType::I32], &[ValType::I32], &[Instruction::LocalGet(0)])
        .finish();
    let mut rt = runtime(RuntimeConfig::default());
    assert!(rt.instantiate(&bytes, &no_host()).is_err());
    assert!(!rt.registry().contains("cell"));
}

// ══════════════════════════════════════════════════════════════════════════════
// Calls
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn scalar_calls() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert_eq!(rt.call_function("answer", &[]).unwrap().get_i32(), 42);
    assert_eq!(
        rt.call_function("add", &[TypedValue::I32(-5), TypedValue::I32(8)])
            .unwrap(),
        TypedValue::I32(3)
    );
    assert_eq!(
        rt.call_function("mul64", &[TypedValue::I64(1 << 40), TypedValue::I64(3)])
            .unwrap(),
        TypedValue::I64(3 << 40)
    );
    assert_eq!(
        rt.call_function("add_f64", &[TypedValue::F64(0.5), TypedValue::F64(0.25)])
            .unwrap(),
        TypedValue::F64(0.75)
    );
    assert_eq!(
        rt.call_function("mul_f32", &[TypedValue::F32(1.5), TypedValue::F32(2.0)])
            .unwrap(),
        TypedValue::F32(3.0)
    );
}

#[test]
fn missing_function_leaves_runtime_ready() {
    let mut rt = ready(&basic_guest(), &no_host());
    match rt.call_function("missing_fn", &[]).unwrap_err() {
        RuntimeError::NoSuchFunction { name, available } => {
            assert_eq!(name, "missing_fn");
            assert!(available.contains(&"ok_fn".to_owned()));
        }
        other => panic!("expected NoSuchFunction, got {other}"),
    }
    assert_eq!(rt.state(), RuntimeState::Ready);
    assert_eq!(rt.call_function("ok_fn", &[]).unwrap(), TypedValue::I32(1));
}

#[test]
fn trap_does_not_invalidate_runtime() {
    let mut rt = ready(&basic_guest(), &no_host());
    match rt.call_function("boom", &[]).unwrap_err() {
        RuntimeError::Trap { function, message } => {
            assert_eq!(function, "boom");
            assert!(!message.is_empty());
        }
        other => panic!("expected Trap, got {other}"),
    }
    assert_eq!(rt.state(), RuntimeState::Ready);
    assert_eq!(rt.call_function("ok_fn", &[]).unwrap(), TypedValue::I32(1));
}

#[test]
fn arithmetic_and_memory_traps_are_recoverable() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert!(matches!(
        rt.call_function("div", &[TypedValue::I32(1), TypedValue::I32(0)]),
        Err(RuntimeError::Trap { .. })
    ));
    assert!(matches!(
        rt.call_function("oob", &[]),
        Err(RuntimeError::Trap { .. })
    ));
    assert_eq!(
        rt.call_function("div", &[TypedValue::I32(9), TypedValue::I32(3)])
            .unwrap(),
        TypedValue::I32(3)
    );
}

#[test]
fn arity_is_checked_before_the_guest_runs() {
    let mut rt = ready(&basic_guest(), &no_host());
    let err = rt
        .call_function("add", &[TypedValue::I32(1)])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Arity {
            expected: 2,
            actual: 1,
            ..
        }
    ));
    assert!(err.to_string().contains("add"), "{err}");
}

#[test]
fn argument_kinds_are_never_coerced() {
    let mut rt = ready(&basic_guest(), &no_host());
    let err = rt
        .call_function("add", &[TypedValue::I32(1), TypedValue::U32(2)])
        .unwrap_err();
    match err {
        RuntimeError::ArgumentType {
            function,
            index,
            source,
        } => {
            assert_eq!(function, "add");
            assert_eq!(index, 1);
            assert_eq!(source.expected, ValueKind::I32);
            assert_eq!(source.actual, ValueKind::U32);
        }
        other => panic!("expected ArgumentType, got {other}"),
    }
}

#[test]
fn result_count_is_enforced_for_single_value_calls() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert!(matches!(
        rt.call_function("pair", &[]),
        Err(RuntimeError::ResultCount {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    assert!(matches!(
        rt.call_function("nothing", &[]),
        Err(RuntimeError::ResultCount { actual: 0, .. })
    ));
}

#[test]
fn multi_value_results() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert_eq!(
        rt.call_function_multi("pair", &[]).unwrap(),
        vec![TypedValue::I32(7), TypedValue::I32(-7)]
    );
    assert!(rt.call_function_multi("nothing", &[]).unwrap().is_empty());
}

#[test]
fn fuel_exhaustion_is_a_recoverable_trap() {
    let mut rt = runtime(RuntimeConfig::default().with_fuel(10_000));
    rt.instantiate(&basic_guest(), &no_host()).unwrap();
    assert!(matches!(
        rt.call_function_multi("spin", &[]),
        Err(RuntimeError::Trap { .. })
    ));
    assert_eq!(rt.state(), RuntimeState::Ready);
    assert_eq!(rt.call_function("ok_fn", &[]).unwrap(), TypedValue::I32(1));
}

// ══════════════════════════════════════════════════════════════════════════════
// Strings
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn string_result_is_copied_out() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert_eq!(
        rt.call_function("greeting", &[]).unwrap(),
        TypedValue::from("hello")
    );
}

#[test]
fn string_argument_is_copied_in() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert_eq!(
        rt.call_function("strlen", &[TypedValue::from("hello, world")])
            .unwrap(),
        TypedValue::U32(12)
    );
    assert_eq!(
        rt.call_function("first_byte", &[TypedValue::from("A")])
            .unwrap(),
        TypedValue::U32(65)
    );
}

#[test]
fn string_round_trip_keeps_utf8() {
    let mut rt = ready(&basic_guest(), &no_host());
    for text in ["héllo wörld", "", "日本語"] {
        assert_eq!(
            rt.call_function("echo", &[TypedValue::from(text)]).unwrap(),
            TypedValue::from(text)
        );
    }
}

#[test]
fn allocator_trap_fails_the_runtime() {
    let bytes = basic_builder().trapping_alloc().finish();
    let mut rt = ready(&bytes, &no_host());
    let err = rt
        .call_function("strlen", &[TypedValue::from("abc")])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Trap { .. }), "{err}");
    assert_eq!(rt.state(), RuntimeState::Failed);
    assert!(matches!(
        rt.call_function("ok_fn", &[]),
        Err(RuntimeError::RuntimeFailed { ref reason }) if reason.contains("strlen")
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Structs
// ══════════════════════════════════════════════════════════════════════════════

fn vec3(x: f64, y: f64, z: f64) -> StructValue {
    StructValue::new("fx_vec3")
        .with("x", x)
        .with("y", y)
        .with("z", z)
}

#[test]
fn struct_argument_by_address() {
    let mut rt = ready(&basic_guest(), &no_host());
    let addr = rt.write_struct(&vec3(1.0, 2.0, 3.5)).unwrap();
    assert_eq!(
        rt.call_function("vec3_sum", &[TypedValue::U32(addr)])
            .unwrap(),
        TypedValue::F64(6.5)
    );
}

#[test]
fn guest_mutation_is_visible_to_read_struct() {
    let mut rt = ready(&basic_guest(), &no_host());
    let addr = rt.write_struct(&vec3(1.5, 0.0, 0.0)).unwrap();
    rt.call_function_multi("bump_x", &[TypedValue::U32(addr)])
        .unwrap();
    let back = rt.read_struct("fx_vec3", addr).unwrap();
    assert_eq!(back, vec3(3.0, 0.0, 0.0));
}

#[test]
fn struct_with_string_field() {
    let mut rt = ready(&basic_guest(), &no_host());
    let label = StructValue::new("fx_label")
        .with("text", "tag")
        .with("id", 9u32);
    let addr = rt.write_struct(&label).unwrap();
    assert_eq!(
        rt.call_function("label_len", &[TypedValue::U32(addr)])
            .unwrap(),
        TypedValue::U32(3)
    );
    assert_eq!(rt.read_struct("fx_label", addr).unwrap(), label);
}

#[test]
fn struct_errors_leave_runtime_ready() {
    let mut rt = ready(&basic_guest(), &no_host());
    assert!(matches!(
        rt.write_struct(&StructValue::new("nope")),
        Err(RuntimeError::Registry(_))
    ));
    let wrong = StructValue::new("fx_vec3")
        .with("x", 1.0f32)
        .with("y", 0.0)
        .with("z", 0.0);
    assert!(matches!(
        rt.write_struct(&wrong),
        Err(RuntimeError::Layout(_))
    ));
    assert_eq!(rt.state(), RuntimeState::Ready);
}

// ══════════════════════════════════════════════════════════════════════════════
// Teardown and compiler
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn calls_after_close_fail() {
    let mut rt = ready(&basic_guest(), &no_host());
    rt.close();
    assert_eq!(rt.state(), RuntimeState::Closed);
    assert!(matches!(
        rt.call_function("ok_fn", &[]),
        Err(RuntimeError::Closed)
    ));
    assert!(matches!(
        rt.read_struct("fx_vec3", 0),
        Err(RuntimeError::Closed)
    ));
}

#[test]
fn free_instantiate_uses_global_registry() {
    let mut rt = graphl_runtime::instantiate(&basic_guest(), &no_host()).unwrap();
    assert!(rt.registry().contains("fx_vec3"));
    assert_eq!(rt.call_function("ok_fn", &[]).unwrap(), TypedValue::I32(1));
}

#[test]
fn independent_runtimes_run_in_parallel() {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                scope.spawn(move || {
                    let mut rt = graphl_runtime::instantiate(&basic_guest(), &no_host()).unwrap();
                    for i in 0..50 {
                        let sum = rt
                            .call_function("add", &[TypedValue::I32(worker), TypedValue::I32(i)])
                            .unwrap();
                        assert_eq!(sum, TypedValue::I32(worker + i));
                    }
                    // Each runtime keeps its own globals.
                    assert_eq!(rt.call_function("counter", &[]).unwrap(), TypedValue::I32(101));
                    rt.close();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    });
    assert!(TypeRegistry::global().contains("fx_vec3"));
}

#[test]
fn compile_and_instantiate_passes_bytecode_through() {
    let compiler = |name: &str, _source: &str| -> Result<CompiledModule, CompileDiagnostic> {
        Ok(CompiledModule::new(name, basic_guest()))
    };
    let mut rt = compile_and_instantiate(
        &compiler,
        "main.gl",
        "fn answer() -> i32 { 42 }",
        &no_host(),
        RuntimeConfig::default(),
    )
    .unwrap();
    assert_eq!(
        rt.digest(),
        Some(CompiledModule::new("main.gl", basic_guest()).digest().as_str())
    );
    assert_eq!(rt.call_function("answer", &[]).unwrap(), TypedValue::I32(42));
}

#[test]
fn compile_diagnostic_is_surfaced_verbatim() {
    let diagnostic = CompileDiagnostic::new("main.gl", "expected `}`").at(1, 25);
    let expected = diagnostic.clone();
    let compiler = move |_: &str, _: &str| -> Result<CompiledModule, CompileDiagnostic> {
        Err(diagnostic.clone())
    };
    let err = compile_and_instantiate(
        &compiler,
        "main.gl",
        "fn answer() -> i32 { 42",
        &no_host(),
        RuntimeConfig::default(),
    )
    .unwrap_err();
    match err {
        RuntimeError::Compile(d) => assert_eq!(d, expected),
        other => panic!("expected Compile, got {other}"),
    }
}
