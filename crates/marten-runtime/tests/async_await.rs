//! Async functions: synchronous start, suspension at await, resumption
//! through the microtask queue, promise settlement.

use std::sync::Arc;

use parking_lot::Mutex;

use marten_compiler::ast::build::*;
use marten_compiler::ast::{BinaryOp, BindingKind, Expr, Stmt};
use marten_core::{PromiseState, Value};
use marten_runtime::{Runtime, RuntimeConfig};

fn interpreter_runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig {
        engine: marten_core::EngineConfig {
            interpreter_only: true,
            ..Default::default()
        },
    })
}

#[test]
fn async_function_resolves_through_the_loop() {
    // async function f(x) { var y = await x; return y + 1; }
    // f(41); pending until the loop drains, then fulfilled with 42.
    let mut f = function(
        Some("f"),
        &["x"],
        vec![decl("y", BindingKind::Var)],
        vec![
            var("y", Expr::Await(Box::new(ident("x")))),
            ret(binary(BinaryOp::Add, ident("y"), num(1.0))),
        ],
    );
    f.is_async = true;
    let program = program(
        vec![decl("f", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            },
            expr(call(ident("f"), vec![num(41.0)])),
        ],
    );

    let runtime = interpreter_runtime();
    let result = runtime.eval_program(&program, "async.js").unwrap();
    let promise = result.as_promise().expect("async call returns a promise");
    assert_eq!(promise.state(), PromiseState::Pending);

    runtime.run_until_empty();
    assert_eq!(promise.state(), PromiseState::Fulfilled);
    assert_eq!(promise.result().as_int32(), Some(42));
}

#[test]
fn async_body_runs_synchronously_until_first_await() {
    // async function f() { effect(); await 0; effect(); }
    // The first effect happens during the call; the second after drain.
    let calls = Arc::new(Mutex::new(0usize));
    let runtime = interpreter_runtime();
    let counter = Arc::clone(&calls);
    runtime.engine().register_builtin(
        "effect",
        Arc::new(move |_this, _args, _ncx| {
            *counter.lock() += 1;
            Ok(Value::undefined())
        }),
    );

    let mut f = function(
        Some("f"),
        &[],
        vec![],
        vec![
            expr(call(ident("effect"), vec![])),
            expr(Expr::Await(Box::new(num(0.0)))),
            expr(call(ident("effect"), vec![])),
        ],
    );
    f.is_async = true;
    let program = program(
        vec![decl("f", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            },
            expr(call(ident("f"), vec![])),
        ],
    );

    runtime.eval_program(&program, "sync-start.js").unwrap();
    assert_eq!(*calls.lock(), 1, "body runs to the first await eagerly");
    runtime.run_until_empty();
    assert_eq!(*calls.lock(), 2, "resumption runs after the checkpoint");
}

#[test]
fn async_throw_rejects_the_result_promise() {
    // async function f() { throw "nope"; }
    let mut f = function(Some("f"), &[], vec![], vec![Stmt::Throw(str("nope"))]);
    f.is_async = true;
    let program = program(
        vec![decl("f", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            },
            expr(call(ident("f"), vec![])),
        ],
    );

    let runtime = interpreter_runtime();
    let result = runtime.eval_program(&program, "reject.js").unwrap();
    let promise = result.as_promise().unwrap();
    assert_eq!(promise.state(), PromiseState::Rejected);
    assert_eq!(promise.result().as_string().unwrap().as_str(), "nope");
    // It never got a handler: the loop reports it as unhandled.
    let reported = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&reported);
    runtime.set_unhandled_rejection_hook(Box::new(move |_rt, _v| {
        *flag.lock() = true;
    }));
    runtime.run_until_empty();
    assert!(*reported.lock());
}

#[test]
fn await_adopts_a_pending_promise() {
    // async function f(p) { return (await p) * 2; }
    // Settling p later drives f's promise through the loop.
    let mut f = function(
        Some("f"),
        &["p"],
        vec![],
        vec![ret(binary(
            BinaryOp::Mul,
            Expr::Await(Box::new(ident("p"))),
            num(2.0),
        ))],
    );
    f.is_async = true;
    let program = program(
        vec![decl("f", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            },
            expr(ident("f")),
        ],
    );

    let runtime = interpreter_runtime();
    let f_value = runtime.eval_program(&program, "adopt.js").unwrap();

    let pending = marten_core::JsPromise::new_pending(runtime.engine());
    let result = runtime
        .call(&f_value, &Value::undefined(), &[Value::promise(pending)])
        .unwrap();
    let result_promise = result.as_promise().unwrap();

    runtime.run_until_empty();
    assert_eq!(result_promise.state(), PromiseState::Pending);

    marten_core::JsPromise::resolve(pending, runtime.engine(), Value::int32(21));
    runtime.run_until_empty();
    assert_eq!(result_promise.state(), PromiseState::Fulfilled);
    assert_eq!(result_promise.result().as_int32(), Some(42));
}
