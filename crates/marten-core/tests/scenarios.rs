//! End-to-end execution scenarios over hand-built ASTs.

use std::sync::Arc;

use marten_bytecode::InlineCacheState;
use marten_compiler::ast::build::*;
use marten_compiler::ast::{BindingKind, Expr, MemberKey, Stmt};
use marten_compiler::compile_program;
use marten_core::{Engine, EngineConfig, Interpreter, Value, VmContext};

fn interpreter_engine() -> Arc<Engine> {
    Engine::with_config(EngineConfig {
        interpreter_only: true,
        ..EngineConfig::default()
    })
}

fn run(engine: &Arc<Engine>, program: &marten_compiler::ast::Program) -> Value {
    let module = Arc::new(compile_program(program, "scenario.js").unwrap());
    let mut ctx = VmContext::new();
    Interpreter::new()
        .run_module(engine, &mut ctx, &module)
        .unwrap()
}

#[test]
fn s1_arithmetic_and_scoping() {
    // var s = 0; for (var i = 1; i <= 10; i++) s = s + i; s
    let program = program(
        vec![decl("s", BindingKind::Var), decl("i", BindingKind::Var)],
        vec![
            var("s", num(0.0)),
            Stmt::For {
                init: Some(Box::new(var("i", num(1.0)))),
                cond: Some(binary(
                    marten_compiler::ast::BinaryOp::Le,
                    ident("i"),
                    num(10.0),
                )),
                update: Some(Expr::Update {
                    increment: true,
                    prefix: false,
                    target: "i".to_string(),
                }),
                body: vec![expr(assign(
                    "s",
                    binary(marten_compiler::ast::BinaryOp::Add, ident("s"), ident("i")),
                ))],
            },
            expr(ident("s")),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(55));
}

#[test]
fn s2_closure_capture() {
    // function mk(x) { return function (y) { return x + y; }; }
    // var f = mk(10); f(5)
    let inner = function(
        None,
        &["y"],
        vec![],
        vec![ret(binary(
            marten_compiler::ast::BinaryOp::Add,
            ident("x"),
            ident("y"),
        ))],
    );
    let mk = function(
        Some("mk"),
        &["x"],
        vec![captured_decl("x", BindingKind::Var)],
        vec![ret(Expr::Function(Box::new(inner)))],
    );
    let program = program(
        vec![decl("mk", BindingKind::Function), decl("f", BindingKind::Var)],
        vec![
            Stmt::FunctionDecl {
                name: "mk".to_string(),
                func: Box::new(mk),
            },
            var("f", call(ident("mk"), vec![num(10.0)])),
            expr(call(ident("f"), vec![num(5.0)])),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(15));
}

#[test]
fn s3_shape_sharing_and_dictionary_split() {
    // Objects built by the same literal share one shape; deleting a
    // property moves the mutated cohort to a shared dictionary shape while
    // the untouched cohort keeps the original.
    let engine = interpreter_engine();
    let make = |_: usize| {
        let program = program(
            vec![],
            vec![expr(Expr::Object(vec![
                ("a".to_string(), num(1.0)),
                ("b".to_string(), num(2.0)),
                ("c".to_string(), num(3.0)),
            ]))],
        );
        run(&engine, &program)
    };

    let objects: Vec<_> = (0..100).map(make).collect();
    let first_shape = objects[0].as_object().unwrap().shape();
    for value in &objects {
        assert_eq!(value.as_object().unwrap().shape(), first_shape);
    }

    // Mutate half of them.
    for value in objects.iter().take(50) {
        let object = value.as_object().unwrap();
        assert!(marten_core::JsObject::delete_property(
            object,
            &engine,
            &engine.key("b")
        ));
    }
    let dict_shape = objects[0].as_object().unwrap().shape();
    assert_ne!(dict_shape, first_shape);
    for value in objects.iter().take(50) {
        let object = value.as_object().unwrap();
        assert!(object.is_dictionary());
        assert_eq!(object.shape(), dict_shape);
    }
    for value in objects.iter().skip(50) {
        let object = value.as_object().unwrap();
        assert!(!object.is_dictionary());
        assert_eq!(object.shape(), first_shape);
    }
}

#[test]
fn s4_inline_cache_progression() {
    // function f(o) { return o.x; }
    // warm with one shape, then hit it with a second shape.
    let f = function(
        Some("f"),
        &["o"],
        vec![],
        vec![ret(member(ident("o"), "x"))],
    );
    let program = program(
        vec![
            decl("f", BindingKind::Function),
            decl("i", BindingKind::Var),
            decl("r", BindingKind::Var),
        ],
        vec![
            Stmt::FunctionDecl {
                name: "f".to_string(),
                func: Box::new(f),
            },
            Stmt::For {
                init: Some(Box::new(var("i", num(0.0)))),
                cond: Some(binary(
                    marten_compiler::ast::BinaryOp::Lt,
                    ident("i"),
                    num(200.0),
                )),
                update: Some(Expr::Update {
                    increment: true,
                    prefix: false,
                    target: "i".to_string(),
                }),
                body: vec![expr(assign(
                    "r",
                    call(ident("f"), vec![Expr::Object(vec![("x".to_string(), num(1.0))])]),
                ))],
            },
            expr(call(
                ident("f"),
                vec![Expr::Object(vec![
                    ("y".to_string(), num(2.0)),
                    ("x".to_string(), num(3.0)),
                ])],
            )),
        ],
    );
    let module = Arc::new(compile_program(&program, "s4.js").unwrap());
    let engine = interpreter_engine();
    let mut ctx = VmContext::new();
    let result = Interpreter::new()
        .run_module(&engine, &mut ctx, &module)
        .unwrap();
    assert_eq!(result.as_int32(), Some(3));

    // The o.x site inside f went uninitialized → monomorphic → polymorphic.
    let f_fn = module
        .functions
        .iter()
        .find(|f| f.name.as_deref() == Some("f"))
        .unwrap();
    let feedback = f_fn.feedback.read();
    let site = feedback
        .iter()
        .find(|slot| !matches!(slot.ic.state, InlineCacheState::Uninitialized))
        .expect("property site must have warmed up");
    assert!(
        matches!(site.ic.state, InlineCacheState::Polymorphic { ref entries } if entries.len() == 2),
        "expected polymorphic cache, got {:?}",
        site.ic.state
    );
}

#[test]
fn exceptions_catch_and_finally() {
    // var log = 0;
    // try { throw 7; } catch (e) { log = e; } finally { log = log + 100; }
    let program = program(
        vec![decl("log", BindingKind::Var)],
        vec![
            var("log", num(0.0)),
            Stmt::Try {
                block: vec![Stmt::Throw(num(7.0))],
                catch: Some((
                    Some("e".to_string()),
                    vec![expr(assign("log", ident("e")))],
                )),
                finally: Some(vec![expr(assign(
                    "log",
                    binary(
                        marten_compiler::ast::BinaryOp::Add,
                        ident("log"),
                        num(100.0),
                    ),
                ))]),
            },
            expr(ident("log")),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(107));
}

#[test]
fn uncaught_throw_surfaces_with_value() {
    let program = program(vec![], vec![Stmt::Throw(str("boom"))]);
    let module = Arc::new(compile_program(&program, "throw.js").unwrap());
    let engine = interpreter_engine();
    let mut ctx = VmContext::new();
    let error = Interpreter::new()
        .run_module(&engine, &mut ctx, &module)
        .unwrap_err();
    let value = error.exception_value().expect("a thrown value");
    assert_eq!(value.as_string().unwrap().as_str(), "boom");
}

#[test]
fn stack_overflow_is_catchable() {
    // function loop() { return loop(); }
    // try { loop(); } catch (e) { 1 }
    let looper = function(Some("loop"), &[], vec![], vec![ret(call(ident("loop"), vec![]))]);
    let program = program(
        vec![decl("loop", BindingKind::Function)],
        vec![
            Stmt::FunctionDecl {
                name: "loop".to_string(),
                func: Box::new(looper),
            },
            Stmt::Try {
                block: vec![expr(call(ident("loop"), vec![]))],
                catch: Some((None, vec![expr(num(1.0))])),
                finally: None,
            },
            expr(num(1.0)),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(1));
}

#[test]
fn generators_yield_and_resume() {
    // function* gen() { yield 1; yield 2; }
    // var g = gen(); g.next().value + g.next().value + (g.next().done ? 100 : 0)
    let mut r#gen = function(Some("gen"), &[], vec![], vec![
        expr(Expr::Yield(Some(Box::new(num(1.0))))),
        expr(Expr::Yield(Some(Box::new(num(2.0))))),
    ]);
    r#gen.is_generator = true;
    let program = program(
        vec![
            decl("gen", BindingKind::Function),
            decl("g", BindingKind::Var),
            decl("total", BindingKind::Var),
        ],
        vec![
            Stmt::FunctionDecl {
                name: "gen".to_string(),
                func: Box::new(r#gen),
            },
            var("g", call(ident("gen"), vec![])),
            var(
                "total",
                binary(
                    marten_compiler::ast::BinaryOp::Add,
                    member(call(member(ident("g"), "next"), vec![]), "value"),
                    member(call(member(ident("g"), "next"), vec![]), "value"),
                ),
            ),
            Stmt::If {
                cond: member(call(member(ident("g"), "next"), vec![]), "done"),
                then: vec![expr(assign(
                    "total",
                    binary(
                        marten_compiler::ast::BinaryOp::Add,
                        ident("total"),
                        num(100.0),
                    ),
                ))],
                otherwise: None,
            },
            expr(ident("total")),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(103));
}

#[test]
fn for_of_over_array_literal() {
    // var sum = 0; for (x of [1,2,3,4]) sum = sum + x; sum
    let program = program(
        vec![decl("sum", BindingKind::Var)],
        vec![
            var("sum", num(0.0)),
            Stmt::ForOf {
                binding: "x".to_string(),
                iterable: Expr::Array(vec![num(1.0), num(2.0), num(3.0), num(4.0)]),
                body: vec![expr(assign(
                    "sum",
                    binary(marten_compiler::ast::BinaryOp::Add, ident("sum"), ident("x")),
                ))],
            },
            expr(ident("sum")),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(10));
}

#[test]
fn s7_nursery_churn_promotes_retained_objects() {
    // Allocate many short-lived objects, retaining every 1000th in a
    // rooted array; retained survivors end up in the old generation and
    // the nursery drains to (near) zero.
    let engine = interpreter_engine();
    let ctx = VmContext::new();
    let retained = engine.alloc_array(0);
    engine.add_persistent_root(Value::object(retained));

    for i in 0..100_000u32 {
        let object = engine.alloc_object();
        marten_core::JsObject::set_property(
            object,
            &engine,
            engine.key("n"),
            Value::int32(i as i32),
        );
        if i % 1000 == 0 {
            marten_core::JsObject::array_push(retained, &engine, Value::object(object));
        }
        if engine.heap().should_collect_minor() {
            engine.collect_minor(&ctx);
        }
    }
    engine.collect_minor(&ctx);
    engine.collect_minor(&ctx);

    assert_eq!(retained.array_length(), 100);
    for i in 0..retained.array_length() {
        let object = retained.element(i).unwrap().as_object().unwrap();
        assert!(!object.header().is_young(), "survivor {i} must be promoted");
        let n = engine
            .get_property(object, "n")
            .and_then(|v| v.as_int32())
            .unwrap();
        assert_eq!(n as u32, i * 1000);
    }
    assert_eq!(engine.heap().young_bytes(), 0);
}

#[test]
fn member_access_via_element_keys() {
    // var o = {k: 9}; o["k"]
    let program = program(
        vec![decl("o", BindingKind::Var)],
        vec![
            var("o", Expr::Object(vec![("k".to_string(), num(9.0))])),
            expr(Expr::Member {
                obj: Box::new(ident("o")),
                key: MemberKey::Computed(Box::new(str("k"))),
            }),
        ],
    );
    let engine = interpreter_engine();
    let result = run(&engine, &program);
    assert_eq!(result.as_int32(), Some(9));
}
