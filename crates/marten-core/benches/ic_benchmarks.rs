//! Inline-cache hit-rate benchmarks: monomorphic vs polymorphic vs
//! megamorphic property access through the interpreter.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use marten_compiler::ast::build::*;
use marten_compiler::ast::{BinaryOp, BindingKind, Expr, Stmt};
use marten_compiler::compile_program;
use marten_core::{Engine, EngineConfig, Interpreter, VmContext};

/// `function f(o) { return o.x; }` driven over `shapes` distinct layouts.
fn property_access_program(shapes: usize, iterations: f64) -> marten_compiler::ast::Program {
    let f = function(Some("f"), &["o"], vec![], vec![ret(member(ident("o"), "x"))]);
    // Receivers with increasingly long prefixes so each gets its own shape.
    let receivers: Vec<Expr> = (0..shapes)
        .map(|n| {
            let mut props: Vec<(String, Expr)> =
                (0..n).map(|i| (format!("p{i}"), num(0.0))).collect();
            props.push(("x".to_string(), num(1.0)));
            Expr::Object(props)
        })
        .collect();
    let mut body = vec![
        Stmt::FunctionDecl {
            name: "f".to_string(),
            func: Box::new(f),
        },
        var("r", num(0.0)),
    ];
    body.push(Stmt::For {
        init: Some(Box::new(var("i", num(0.0)))),
        cond: Some(binary(BinaryOp::Lt, ident("i"), num(iterations))),
        update: Some(Expr::Update {
            increment: true,
            prefix: false,
            target: "i".to_string(),
        }),
        body: receivers
            .iter()
            .map(|receiver| expr(assign("r", call(ident("f"), vec![receiver.clone()]))))
            .collect(),
    });
    body.push(expr(ident("r")));
    program(
        vec![
            decl("f", BindingKind::Function),
            decl("r", BindingKind::Var),
            decl("i", BindingKind::Var),
        ],
        body,
    )
}

fn bench_ic_states(c: &mut Criterion) {
    let mut group = c.benchmark_group("property_ic");
    for (name, shapes) in [("monomorphic", 1), ("polymorphic", 3), ("megamorphic", 8)] {
        let program = property_access_program(shapes, 200.0);
        let module = Arc::new(compile_program(&program, "ic-bench.js").unwrap());
        group.bench_function(name, |b| {
            b.iter(|| {
                let engine = Engine::with_config(EngineConfig {
                    interpreter_only: true,
                    ..EngineConfig::default()
                });
                let mut ctx = VmContext::new();
                Interpreter::new()
                    .run_module(&engine, &mut ctx, &module)
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ic_states);
criterion_main!(benches);
