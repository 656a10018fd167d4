//! Integration tests for embed-runtime-core.
//!
//! These tests verify the complete embedding pipeline:
//! - WAT compilation and instantiation
//! - Host function registration and materialization
//! - Calls through the export bridge, including error reporting
//! - Exported memory access and context data
//! - Gas metering

use std::error::Error as StdError;

use embed_runtime_common::{
    EngineConfig, ExportError, HostError, InstanceError, MeteringConfig, RegistrationError,
};
use embed_runtime_core::{
    FunctionSignature, ImportObject, Imports, Instance, InstanceContext, OpcodeCosts, Value,
    ValueKind, WasmEngine,
};

const ADD_VIA_IMPORT: &str = r#"
    (module
        (import "env" "sum" (func $sum (param i32 i32) (result i32)))
        (func (export "add_via_import") (param i32 i32) (result i32)
            (call $sum (local.get 0) (local.get 1))
        )
    )
"#;

const ARITHMETIC: &str = r#"
    (module
        (func (export "add") (param i32 i32) (result i32)
            (i32.add (local.get 0) (local.get 1)))
        (func (export "mix") (param i64 f32 f64) (result f64)
            (f64.add
                (f64.add (f64.convert_i64_s (local.get 0)) (f64.promote_f32 (local.get 1)))
                (local.get 2)))
        (func (export "nothing"))
        (func (export "trap") (result i32) unreachable)
        (func (export "pair") (result i32 i32) (i32.const 1) (i32.const 2))
    )
"#;

const ONE: &str = r#"(module (func (export "f") (result i32) (i32.const 1)))"#;

fn engine() -> WasmEngine {
    WasmEngine::new(&EngineConfig::default()).unwrap()
}

fn sum_imports() -> Imports<()> {
    let mut imports = Imports::new();
    imports
        .append("env", "sum", |_: &mut InstanceContext<'_, ()>, a: i32, b: i32| a + b)
        .unwrap();
    imports
}

/// Every message in an error's source chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut messages = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        messages.push(e.to_string());
        source = e.source();
    }
    messages.join(" | ")
}

// ============================================================================
// Test: Imports
// ============================================================================

#[test]
fn test_call_through_import() {
    let engine = engine();
    let mut instance =
        Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), sum_imports()).unwrap();

    let result = instance
        .call("add_via_import", &[Value::I32(3), Value::I32(4)])
        .unwrap();

    assert_eq!(result, Value::I32(7));
}

#[test]
fn test_missing_import_fails_instantiation() {
    let engine = engine();
    let err = Instance::<()>::new(&engine, ADD_VIA_IMPORT.as_bytes()).unwrap_err();

    assert!(matches!(err, InstanceError::Instantiation { .. }));
    assert!(
        err.to_string()
            .starts_with("Failed to instantiate the module:\n    ")
    );
}

#[test]
fn test_duplicate_import_keeps_first() {
    let engine = engine();
    let mut imports = sum_imports();

    let err = imports
        .append("env", "sum", |_: &mut InstanceContext<'_, ()>, a: i32, b: i32| a * b)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Duplicate { .. }));

    let mut instance = Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), imports).unwrap();
    assert_eq!(
        instance
            .call("add_via_import", &[Value::I32(3), Value::I32(4)])
            .unwrap(),
        Value::I32(7)
    );
}

#[test]
fn test_host_error_fails_call() {
    let engine = engine();
    let mut imports = Imports::<()>::new();
    imports
        .append(
            "env",
            "sum",
            |_: &mut InstanceContext<'_, ()>, _a: i32, _b: i32| -> Result<i32, HostError> {
                Err(HostError::new("sum is unavailable"))
            },
        )
        .unwrap();

    let mut instance = Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), imports).unwrap();
    let err = instance
        .call("add_via_import", &[Value::I32(1), Value::I32(2)])
        .unwrap_err();

    assert!(matches!(err, ExportError::CallFailed { .. }));
    assert_eq!(
        err.to_string(),
        "Failed to call the `add_via_import` exported function."
    );
    assert!(error_chain(&err).contains("sum is unavailable"));
}

#[test]
fn test_dynamic_import_output_checked() {
    let engine = engine();
    let signature = FunctionSignature::new(
        vec![ValueKind::I32, ValueKind::I32],
        vec![ValueKind::I32],
    );

    let mut good = Imports::<()>::new();
    good.append_dynamic("env", "sum", signature.clone(), |_, args| {
        let a = args[0].to_i32().unwrap_or_default();
        let b = args[1].to_i32().unwrap_or_default();
        Ok(Value::I32(a - b))
    })
    .unwrap();

    let mut instance = Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), good).unwrap();
    assert_eq!(
        instance
            .call("add_via_import", &[Value::I32(10), Value::I32(4)])
            .unwrap(),
        Value::I32(6)
    );

    let mut bad = Imports::<()>::new();
    bad.append_dynamic("env", "sum", signature, |_, _| Ok(Value::F64(1.0)))
        .unwrap();

    let mut instance = Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), bad).unwrap();
    let err = instance
        .call("add_via_import", &[Value::I32(1), Value::I32(2)])
        .unwrap_err();
    assert!(error_chain(&err).contains("must return `i32`, returned `f64`"));
}

#[test]
fn test_import_object_shared() {
    let engine = engine();
    let import_object = ImportObject::new(&engine, sum_imports()).unwrap();

    let mut first =
        Instance::with_import_object(&engine, ADD_VIA_IMPORT.as_bytes(), &import_object).unwrap();
    let mut second =
        Instance::with_import_object(&engine, ADD_VIA_IMPORT.as_bytes(), &import_object).unwrap();

    assert_eq!(
        first
            .call("add_via_import", &[Value::I32(1), Value::I32(1)])
            .unwrap(),
        Value::I32(2)
    );
    first.close();

    // closing an instance leaves the shared imports intact
    assert_eq!(import_object.records().len(), 1);
    assert_eq!(
        second
            .call("add_via_import", &[Value::I32(20), Value::I32(22)])
            .unwrap(),
        Value::I32(42)
    );
}

#[test]
fn test_closed_import_object_rejected() {
    let engine = engine();
    let mut import_object = ImportObject::new(&engine, sum_imports()).unwrap();
    import_object.close();

    let err = Instance::with_import_object(&engine, ADD_VIA_IMPORT.as_bytes(), &import_object)
        .unwrap_err();
    assert!(
        err.to_string()
            .starts_with("Failed to create cached imports: ")
    );
}

#[test]
fn test_import_object_from_other_engine_rejected() {
    let other = engine();
    let engine = engine();
    let import_object = ImportObject::new(&other, sum_imports()).unwrap();

    let err = Instance::with_import_object(&engine, ADD_VIA_IMPORT.as_bytes(), &import_object)
        .unwrap_err();
    assert!(matches!(err, InstanceError::ImportObject { .. }));
    assert!(err.to_string().contains("different engine"));

    let err = Instance::metered_with_import_object(
        &engine,
        ADD_VIA_IMPORT.as_bytes(),
        &import_object,
        1_000,
        &OpcodeCosts::uniform(1),
    )
    .unwrap_err();
    assert!(matches!(err, InstanceError::ImportObject { .. }));

    // the object still serves instances on its own engine
    let mut instance =
        Instance::with_import_object(&other, ADD_VIA_IMPORT.as_bytes(), &import_object).unwrap();
    assert_eq!(
        instance
            .call("add_via_import", &[Value::I32(2), Value::I32(3)])
            .unwrap(),
        Value::I32(5)
    );
}

// ============================================================================
// Test: Export Bridge
// ============================================================================

#[test]
fn test_argument_count_errors() {
    let engine = engine();
    let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let err = instance.call("add", &[Value::I32(1)]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Missing 1 argument(s) when calling the `add` exported function; Expect 2 argument(s), given 1."
    );

    let err = instance
        .call("add", &[Value::I32(1), Value::I32(2), Value::I32(3)])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Given 1 extra argument(s) when calling the `add` exported function; Expect 2 argument(s), given 3."
    );
    assert!(err.is_argument_error());
}

#[test]
fn test_argument_type_error() {
    let engine = engine();
    let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let err = instance
        .call("add", &[Value::I32(1), Value::I64(2)])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Argument #2 of the `add` exported function must be of type `i32`, given `i64`."
    );

    let err = instance
        .call("add", &[Value::Void, Value::I32(2)])
        .unwrap_err();
    assert!(matches!(err, ExportError::ArgumentType { position: 1, .. }));
}

#[test]
fn test_mixed_kinds_and_void() {
    let engine = engine();
    let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let result = instance
        .call("mix", &[Value::I64(1), Value::F32(0.5), Value::F64(0.25)])
        .unwrap();
    assert_eq!(result, Value::F64(1.75));

    assert_eq!(instance.call("nothing", &[]).unwrap(), Value::Void);
}

#[test]
fn test_trap_fails_call() {
    let engine = engine();
    let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let err = instance.call("trap", &[]).unwrap_err();
    assert!(matches!(err, ExportError::CallFailed { .. }));
    assert_eq!(err.to_string(), "Failed to call the `trap` exported function.");

    // the instance stays usable
    assert_eq!(
        instance.call("add", &[Value::I32(1), Value::I32(1)]).unwrap(),
        Value::I32(2)
    );
}

#[test]
fn test_export_listing() {
    let engine = engine();
    let instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let names: Vec<_> = instance.exports().iter().map(|f| f.name()).collect();
    assert_eq!(names, vec!["add", "mix", "nothing", "trap"]);

    let mix = instance.export("mix").unwrap();
    assert_eq!(mix.input_arity(), 3);
    assert_eq!(mix.signature().to_string(), "(i64, f32, f64) -> (f64)");

    // multi-value results are not callable through the bridge
    assert!(!instance.has_export("pair"));
}

#[test]
fn test_unknown_export() {
    let engine = engine();
    let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();

    let err = instance.call("pair", &[]).unwrap_err();
    assert_eq!(err.to_string(), "Exported function `pair` does not exist.");
}

// ============================================================================
// Test: Lifecycle
// ============================================================================

#[test]
fn test_malformed_module() {
    let engine = engine();
    let err = Instance::<()>::new(&engine, b"\0asm\x01\0\0\0\xff\xff").unwrap_err();

    assert!(
        err.to_string()
            .starts_with("Failed to instantiate the module:\n    ")
    );
    assert!(!err.to_string().ends_with("    "));
}

#[test]
fn test_double_close() {
    let engine = engine();
    let mut instance =
        Instance::with_imports(&engine, ADD_VIA_IMPORT.as_bytes(), sum_imports()).unwrap();

    instance.close();
    instance.close();

    assert!(instance.is_closed());
    assert!(!instance.has_export("add_via_import"));
    assert!(matches!(
        instance.call("add_via_import", &[Value::I32(1), Value::I32(2)]),
        Err(ExportError::Closed)
    ));
}

#[test]
fn test_pooling_engine() {
    let engine = WasmEngine::new(&EngineConfig {
        pooling_allocator: true,
        max_instances: 2,
        instance_memory_mb: 1,
        ..Default::default()
    })
    .unwrap();

    for _ in 0..4 {
        let mut instance = Instance::<()>::new(&engine, ARITHMETIC.as_bytes()).unwrap();
        assert_eq!(
            instance.call("add", &[Value::I32(1), Value::I32(2)]).unwrap(),
            Value::I32(3)
        );
    }
}

// ============================================================================
// Test: Memory and Context Data
// ============================================================================

#[test]
fn test_memory_presence() {
    let engine = engine();

    let none = Instance::<()>::new(&engine, ONE.as_bytes()).unwrap();
    assert!(!none.has_memory());
    assert!(none.memory().is_none());

    let one = Instance::<()>::new(&engine, br#"(module (memory (export "m") 1))"#).unwrap();
    assert!(one.has_memory());
    assert_eq!(one.memory().unwrap().pages(), 1);

    let two = Instance::<()>::new(
        &engine,
        br#"(module (memory (export "a") 1) (memory (export "b") 2))"#,
    )
    .unwrap();
    assert!(two.has_memory());
    // the last exported memory wins
    assert_eq!(two.memory().unwrap().pages(), 2);
}

#[test]
fn test_memory_read_write_grow() {
    let engine = engine();
    let mut instance = Instance::<()>::new(
        &engine,
        br#"(module (memory (export "memory") 1 2) (data (i32.const 8) "wasm"))"#,
    )
    .unwrap();

    assert_eq!(instance.memory().unwrap().read(8, 4).unwrap(), b"wasm");

    let mut memory = instance.memory_mut().unwrap();
    memory.write(0, b"host").unwrap();
    assert!(memory.write(65_534, b"xyz").is_err());
    assert_eq!(memory.grow(1).unwrap(), 1);
    assert!(memory.grow(1).is_err());

    let memory = instance.memory().unwrap();
    assert_eq!(memory.read(0, 4).unwrap(), b"host");
    assert_eq!(memory.data_size(), 2 * 65_536);
}

#[test]
fn test_host_reads_memory_and_context() {
    let wat = r#"
        (module
            (import "env" "record" (func $record (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello")
            (func (export "run")
                (call $record (i32.const 16) (i32.const 5))
                (call $record (i32.const 17) (i32.const 3)))
        )
    "#;

    let engine = engine();
    let mut imports = Imports::<Vec<String>>::new();
    imports
        .append(
            "env",
            "record",
            |ctx: &mut InstanceContext<'_, Vec<String>>,
             ptr: u32,
             len: u32|
             -> Result<(), HostError> {
                let text = {
                    let memory = ctx.memory().ok_or_else(|| HostError::new("no memory"))?;
                    let bytes = memory
                        .read(ptr as usize, len as usize)
                        .map_err(|e| HostError::new(e.to_string()))?;
                    String::from_utf8_lossy(bytes).into_owned()
                };
                ctx.data_mut()
                    .ok_or_else(|| HostError::new("no context data"))?
                    .push(text);
                Ok(())
            },
        )
        .unwrap();

    let mut instance = Instance::with_imports(&engine, wat.as_bytes(), imports).unwrap();

    // without context data the host function fails
    assert!(instance.call("run", &[]).is_err());

    instance.set_context_data(Vec::new()).unwrap();
    instance.call("run", &[]).unwrap();

    assert_eq!(
        instance.context_data().unwrap(),
        &vec!["hello".to_string(), "ell".to_string()]
    );
}

// ============================================================================
// Test: Gas Metering
// ============================================================================

#[test]
fn test_metered_exact_points() {
    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        100,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    assert!(instance.is_metered());
    assert_eq!(instance.points_used(), 0);

    // i32.const + end
    assert_eq!(instance.call("f", &[]).unwrap(), Value::I32(1));
    assert_eq!(instance.points_used(), 2);

    instance.call("f", &[]).unwrap();
    assert_eq!(instance.points_used(), 4);

    instance.set_points_used(0);
    assert_eq!(instance.points_used(), 0);

    // the injected global is not a callable export
    assert_eq!(instance.exports().len(), 1);
}

#[test]
fn test_gas_limit_enforced() {
    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        2,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    instance.call("f", &[]).unwrap();
    let err = instance.call("f", &[]).unwrap_err();
    assert_eq!(err.to_string(), "Failed to call the `f` exported function.");
    assert!(instance.points_used() > 2);

    // resetting the counter restores the budget
    instance.set_points_used(0);
    assert_eq!(instance.call("f", &[]).unwrap(), Value::I32(1));
}

#[test]
fn test_points_counter_never_wraps() {
    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        100,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    instance.set_points_used(u64::MAX);
    assert!(matches!(
        instance.call("f", &[]),
        Err(ExportError::CallFailed { .. })
    ));
    assert_eq!(instance.points_used(), u64::MAX);

    // a charge of 2 on top of u64::MAX - 1 would wrap to 0
    instance.set_points_used(u64::MAX - 1);
    assert!(instance.call("f", &[]).is_err());
    assert_eq!(instance.points_used(), u64::MAX);
}

#[test]
fn test_unlimited_budget_still_traps_on_overflow() {
    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        u64::MAX,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    instance.set_points_used(u64::MAX - 2);
    assert_eq!(instance.call("f", &[]).unwrap(), Value::I32(1));
    assert_eq!(instance.points_used(), u64::MAX);

    assert!(instance.call("f", &[]).is_err());
    assert_eq!(instance.points_used(), u64::MAX);
}

#[test]
fn test_zero_gas_fails_first_call() {
    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        0,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    assert!(matches!(
        instance.call("f", &[]),
        Err(ExportError::CallFailed { .. })
    ));
}

#[test]
fn test_metered_loop_scales_with_work() {
    let wat = r#"
        (module
            (func (export "count") (param $n i32)
                (local $i i32)
                (block $break
                    (loop $continue
                        (br_if $break (i32.ge_u (local.get $i) (local.get $n)))
                        (local.set $i (i32.add (local.get $i) (i32.const 1)))
                        (br $continue))))
        )
    "#;

    let engine = engine();
    let mut instance = Instance::metered_with_imports(
        &engine,
        wat.as_bytes(),
        Imports::<()>::new(),
        u64::MAX,
        &OpcodeCosts::uniform(1),
    )
    .unwrap();

    // block, loop and the three trailing ends cost 5; each iteration runs the
    // 4-instruction exit check and the 5-instruction increment; the final
    // exit check costs 4
    instance.call("count", &[Value::I32(10)]).unwrap();
    assert_eq!(instance.points_used(), 9 * 10 + 7);

    instance.set_points_used(0);
    instance.call("count", &[Value::I32(20)]).unwrap();
    assert_eq!(instance.points_used(), 9 * 20 + 7);
}

#[test]
fn test_metered_import_object() {
    let engine = engine();
    let import_object = ImportObject::new(&engine, sum_imports()).unwrap();
    let costs = OpcodeCosts::uniform(1);

    let mut instance = Instance::metered_with_import_object(
        &engine,
        ADD_VIA_IMPORT.as_bytes(),
        &import_object,
        1_000,
        &costs,
    )
    .unwrap();

    assert_eq!(
        instance
            .call("add_via_import", &[Value::I32(3), Value::I32(4)])
            .unwrap(),
        Value::I32(7)
    );
    // local.get, local.get, call | end
    assert_eq!(instance.points_used(), 4);
}

#[test]
fn test_metering_costs_from_config() {
    let engine = engine();
    let config = MeteringConfig {
        enabled: true,
        gas_limit: 1_000,
        default_cost: 0,
        overrides: vec![embed_runtime_common::OpcodeCostOverride {
            opcode: 0x41, // i32.const
            cost: 5,
        }],
    };
    let costs = OpcodeCosts::from_config(&config).unwrap();

    let mut instance = Instance::metered_with_imports(
        &engine,
        ONE.as_bytes(),
        Imports::<()>::new(),
        config.gas_limit,
        &costs,
    )
    .unwrap();

    instance.call("f", &[]).unwrap();
    assert_eq!(instance.points_used(), 5);
}

#[test]
fn test_unmeterable_module_rejected() {
    let wat = r#"
        (module
            (func (export "s") (result i32)
                (i32x4.extract_lane 0 (v128.const i32x4 1 2 3 4))))
    "#;

    let engine = engine();
    let err = Instance::metered_with_imports(
        &engine,
        wat.as_bytes(),
        Imports::<()>::new(),
        1_000,
        &OpcodeCosts::uniform(1),
    )
    .unwrap_err();

    assert!(
        err.to_string()
            .starts_with("Failed to instantiate the module:\n    ")
    );
    assert!(err.to_string().contains("cannot be metered"));
}
