//! Tier-up, deoptimization, and cross-tier observational equivalence.

#![cfg(feature = "jit")]

use std::sync::Arc;

use marten_compiler::ast::build::*;
use marten_compiler::ast::{BinaryOp, BindingKind, Expr, Stmt};
use marten_compiler::compile_program;
use marten_core::{Engine, EngineConfig, Value};
use marten_jit::tiering::Tier;

/// `function add(a, b) { return a + b; } add`
fn add_program() -> marten_compiler::ast::Program {
    let add = function(
        Some("add"),
        &["a", "b"],
        vec![],
        vec![ret(binary(BinaryOp::Add, ident("a"), ident("b")))],
    );
    program(
        vec![decl("add", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "add".to_string(),
                func: Box::new(add),
            },
            expr(ident("add")),
        ],
    )
}

/// `function sum(n) { var s = 0; for (var i = 0; i < n; i++) s = s + i; return s; } sum`
fn sum_program() -> marten_compiler::ast::Program {
    let sum = function(
        Some("sum"),
        &["n"],
        vec![decl("s", BindingKind::Var), decl("i", BindingKind::Var)],
        vec![
            var("s", num(0.0)),
            Stmt::For {
                init: Some(Box::new(var("i", num(0.0)))),
                cond: Some(binary(BinaryOp::Lt, ident("i"), ident("n"))),
                update: Some(Expr::Update {
                    increment: true,
                    prefix: false,
                    target: "i".to_string(),
                }),
                body: vec![expr(assign(
                    "s",
                    binary(BinaryOp::Add, ident("s"), ident("i")),
                ))],
            },
            ret(ident("s")),
        ],
    );
    program(
        vec![decl("sum", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "sum".to_string(),
                func: Box::new(sum),
            },
            expr(ident("sum")),
        ],
    )
}

struct Harness {
    engine: Arc<Engine>,
    module: Arc<marten_bytecode::Module>,
    callee: Value,
    function_index: u32,
}

fn load(program: &marten_compiler::ast::Program, name: &str, config: EngineConfig) -> Harness {
    let module = Arc::new(compile_program(program, "tiers.js").unwrap());
    let engine = Engine::with_config(config);
    let mut ctx = marten_core::VmContext::new();
    let callee = marten_core::Interpreter::new()
        .run_module(&engine, &mut ctx, &module)
        .unwrap();
    let function_index = module
        .functions
        .iter()
        .position(|f| f.name.as_deref() == Some(name))
        .unwrap() as u32;
    Harness {
        engine,
        module,
        callee,
        function_index,
    }
}

impl Harness {
    fn call(&self, args: &[Value]) -> Value {
        self.engine
            .call(&self.callee, &Value::undefined(), args)
            .unwrap()
    }

    fn drain_compiles(&self) {
        self.engine
            .tier_controller()
            .drain_queue_now(self.engine.shapes().proto_epoch());
    }

    fn published_tier(&self) -> Option<Tier> {
        self.engine
            .tier_controller()
            .published((self.module.module_id, self.function_index))
            .map(|code| code.artifact.tier())
    }
}

#[test]
fn baseline_tier_publishes_and_agrees_with_interpreter() {
    let h = load(&add_program(), "add", EngineConfig::default());
    for _ in 0..marten_jit::BASELINE_CALL_THRESHOLD + 1 {
        assert_eq!(h.call(&[Value::int32(2), Value::int32(3)]).as_int32(), Some(5));
    }
    h.drain_compiles();
    assert!(h.published_tier().is_some());
    // Same answers through compiled code.
    assert_eq!(h.call(&[Value::int32(20), Value::int32(22)]).as_int32(), Some(42));
    assert_eq!(
        h.call(&[h.engine.string_value("foo"), h.engine.string_value("bar")])
            .as_string()
            .unwrap()
            .as_str(),
        "foobar"
    );
}

#[test]
fn s6_deopt_on_failed_speculation() {
    let h = load(&add_program(), "add", EngineConfig::default());

    // Warm with SMI operands far past the optimizing threshold.
    for _ in 0..marten_jit::OPTIMIZE_CALL_THRESHOLD + 8 {
        h.call(&[Value::int32(1), Value::int32(2)]);
    }
    h.drain_compiles();
    assert_eq!(h.published_tier(), Some(Tier::Optimized));

    // The speculation (SMI + SMI) fails: the call bails out and completes
    // in the interpreter with the string result.
    let result = h.call(&[h.engine.string_value("x"), h.engine.string_value("y")]);
    assert_eq!(result.as_string().unwrap().as_str(), "xy");

    // The site was penalized and the optimized code torn down.
    let function = h.module.function(h.function_index).unwrap();
    let feedback = function.feedback.read();
    assert!(
        feedback.iter().any(|slot| slot.speculation_failures > 0),
        "deopt must tick the per-site exit counter"
    );
    drop(feedback);
    assert_ne!(h.published_tier(), Some(Tier::Optimized));

    // SMI calls still work (and may reoptimize generically later).
    assert_eq!(h.call(&[Value::int32(1), Value::int32(2)]).as_int32(), Some(3));
}

#[test]
fn tier_up_is_observationally_equivalent() {
    // Property 8: a pure function returns identical results at every tier.
    let reference = load(
        &sum_program(),
        "sum",
        EngineConfig {
            interpreter_only: true,
            ..EngineConfig::default()
        },
    );
    let tiered = load(&sum_program(), "sum", EngineConfig::default());

    let inputs = [0, 1, 2, 7, 50, 100];
    let expected: Vec<Option<i32>> = inputs
        .iter()
        .map(|&n| reference.call(&[Value::int32(n)]).as_int32())
        .collect();

    // Interpreter phase.
    for (i, &n) in inputs.iter().enumerate() {
        assert_eq!(tiered.call(&[Value::int32(n)]).as_int32(), expected[i]);
    }
    // Baseline phase.
    for _ in 0..marten_jit::BASELINE_CALL_THRESHOLD {
        tiered.call(&[Value::int32(10)]);
    }
    tiered.drain_compiles();
    for (i, &n) in inputs.iter().enumerate() {
        assert_eq!(tiered.call(&[Value::int32(n)]).as_int32(), expected[i]);
    }
    // Optimizing phase.
    for _ in 0..marten_jit::OPTIMIZE_CALL_THRESHOLD {
        tiered.call(&[Value::int32(10)]);
    }
    tiered.drain_compiles();
    for (i, &n) in inputs.iter().enumerate() {
        assert_eq!(tiered.call(&[Value::int32(n)]).as_int32(), expected[i]);
    }
}

#[test]
fn deopt_preserves_program_results_mid_stream() {
    // Property 9 (spot check): a workload that flips operand types midway
    // produces the same outputs tiered as interpreted, deopts included.
    let reference = load(
        &add_program(),
        "add",
        EngineConfig {
            interpreter_only: true,
            ..EngineConfig::default()
        },
    );
    let tiered = load(&add_program(), "add", EngineConfig::default());

    let mut expected = Vec::new();
    let mut actual = Vec::new();
    for i in 0..(marten_jit::OPTIMIZE_CALL_THRESHOLD + 64) {
        let args: Vec<Value> = if i % 700 == 699 {
            vec![
                reference.engine.string_value("a"),
                reference.engine.string_value("b"),
            ]
        } else {
            vec![Value::int32(i as i32), Value::int32(1)]
        };
        expected.push(format!("{:?}", reference.call(&args)));
        let args: Vec<Value> = if i % 700 == 699 {
            vec![
                tiered.engine.string_value("a"),
                tiered.engine.string_value("b"),
            ]
        } else {
            vec![Value::int32(i as i32), Value::int32(1)]
        };
        actual.push(format!("{:?}", tiered.call(&args)));
        if i == marten_jit::BASELINE_CALL_THRESHOLD || i == marten_jit::OPTIMIZE_CALL_THRESHOLD {
            tiered.drain_compiles();
        }
    }
    assert_eq!(expected, actual);
}
