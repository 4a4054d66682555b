//! Numeric-loop throughput: the SMI fast path under the interpreter, and
//! with tier-up enabled.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use marten_compiler::ast::build::*;
use marten_compiler::ast::{BinaryOp, BindingKind, Expr, Stmt};
use marten_compiler::compile_program;
use marten_core::{Engine, EngineConfig, Value};

/// `function sum(n) { var s = 0; for (var i = 0; i < n; i++) s = s + i; return s; }`
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

fn load(config: EngineConfig) -> (Arc<Engine>, Value) {
    let module = Arc::new(compile_program(&sum_program(), "loop-bench.js").unwrap());
    let engine = Engine::with_config(config);
    let mut ctx = marten_core::VmContext::new();
    let sum = marten_core::Interpreter::new()
        .run_module(&engine, &mut ctx, &module)
        .unwrap();
    (engine, sum)
}

fn bench_sum_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_loop");

    let (engine, sum) = load(EngineConfig {
        interpreter_only: true,
        ..EngineConfig::default()
    });
    group.bench_function("interpreter", |b| {
        b.iter(|| engine.call(&sum, &Value::undefined(), &[Value::int32(1000)]).unwrap());
    });

    #[cfg(feature = "jit")]
    {
        let (engine, sum) = load(EngineConfig::default());
        // Warm past both tiers and compile synchronously.
        for _ in 0..600 {
            engine
                .call(&sum, &Value::undefined(), &[Value::int32(100)])
                .unwrap();
        }
        engine
            .tier_controller()
            .drain_queue_now(engine.shapes().proto_epoch());
        group.bench_function("tiered", |b| {
            b.iter(|| engine.call(&sum, &Value::undefined(), &[Value::int32(1000)]).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sum_loop);
criterion_main!(benches);
