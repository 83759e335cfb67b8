//! This module contains common utilities for simplifying the writing of
//! integration tests for this library.

#![cfg(test)]

use std::sync::Arc;

use symbolic_test_generator::{
    generator,
    instrumentation::Instrumenter,
    program::{
        builder::ProgramBuilder,
        instruction::BinaryOp,
        types::{ConcreteValue, MethodId, Type},
        Program,
        ProgramRepresentation,
    },
    sandbox,
    sandbox::{protocol::Invocation, Sandbox},
};

/// Gets a sandbox configuration that spawns the sandbox binary built
/// alongside the tests.
#[allow(unused)] // It is actually
pub fn sandbox_config() -> sandbox::Config {
    sandbox::Config::default().with_executable(env!("CARGO_BIN_EXE_stg-sandbox"))
}

/// Gets a generator configuration that runs its concrete executions in the
/// sandbox binary built alongside the tests.
#[allow(unused)] // It is actually
pub fn generator_config() -> generator::Config {
    generator::Config::default().with_sandbox(sandbox_config())
}

/// Instruments `program` and spawns a sandbox running it.
#[allow(unused)] // It is actually
pub fn spawn_sandbox(program: &Program) -> anyhow::Result<Sandbox> {
    let instrumented = Instrumenter::default().instrument(program)?;
    Ok(Sandbox::spawn(sandbox_config(), Arc::new(instrumented))?)
}

/// Builds an invocation of the static `method` with `arguments` and a budget
/// of `timeout_ms`.
#[allow(unused)] // It is actually
pub fn invocation(
    program: &Program,
    method: MethodId,
    arguments: Vec<ConcreteValue>,
    timeout_ms: u64,
) -> anyhow::Result<Invocation> {
    Ok(Invocation {
        method: program.signature(method)?,
        receiver: None,
        arguments,
        statics: vec![],
        timeout_ms,
        replay: None,
    })
}

/// The methods of the program built by [`demo_program`].
#[allow(unused)] // It is actually
#[derive(Clone, Copy, Debug)]
pub struct Demo {
    /// `int reciprocal(int x) { return 1 / x; }`
    pub reciprocal: MethodId,

    /// `int lucky() { return new Random().nextInt(10) < 5 ? 1 : 0; }`
    pub lucky: MethodId,

    /// `void spin() { while (true) {} }`
    pub spin: MethodId,

    /// `void quit() { System.exit(3); }`
    pub quit: MethodId,

    /// `int open()`, which drops an object whose finalizer throws.
    pub open: MethodId,

    /// `int twice(int x) { return reciprocal(x) + reciprocal(x); }`
    pub twice: MethodId,
}

/// Builds a small program with one method for each behaviour the tests look
/// at.
#[allow(unused)] // It is actually
pub fn demo_program() -> (Program, Demo) {
    let mut builder = ProgramBuilder::new();
    let runtime = builder.runtime().clone();

    let maths = builder.class("demo.Maths");
    let reciprocal = builder
        .method(maths, "reciprocal", &[Type::Int], Type::Int)
        .statik()
        .build(|code| {
            let x = code.parameter(0, Type::Int);
            let result = code.binary(BinaryOp::Div, 1, x, Type::Int);
            code.ret_value(result);
        });
    let twice = builder
        .method(maths, "twice", &[Type::Int], Type::Int)
        .statik()
        .build(|code| {
            let x = code.parameter(0, Type::Int);
            let first = code.invoke_static(reciprocal, &[x.into()]).unwrap_or_default();
            let second = code.invoke_static(reciprocal, &[x.into()]).unwrap_or_default();
            let sum = code.binary(BinaryOp::Add, first, second, Type::Int);
            code.ret_value(sum);
        });

    let dice = builder.class("demo.Dice");
    let lucky = builder
        .method(dice, "lucky", &[], Type::Int)
        .statik()
        .build(|code| {
            let random = code.construct(runtime.random, runtime.random_init, &[]);
            let draw = code
                .invoke_virtual(runtime.random_next_int_bounded, random, &[10.into()])
                .unwrap_or_default();
            let low = code.binary(BinaryOp::Lt, draw, 5, Type::Bool);
            let won = code.label();
            code.branch_if(low, won);
            code.ret_value(0);
            code.bind(won);
            code.ret_value(1);
        });

    let process = builder.class("demo.Process");
    let spin = builder
        .method(process, "spin", &[], Type::Void)
        .statik()
        .build(|code| {
            let top = code.label();
            code.bind(top);
            code.nop();
            code.goto(top);
        });
    let quit = builder
        .method(process, "quit", &[], Type::Void)
        .statik()
        .build(|code| code.exit(3));

    let resource = builder.class("demo.Resource");
    builder
        .method(resource, "finalize", &[], Type::Void)
        .build(|code| {
            let error = code.construct(runtime.runtime_exception, runtime.throwable_init, &[]);
            code.throw(error);
        });
    let open = builder
        .method(resource, "open", &[], Type::Int)
        .statik()
        .build(|code| {
            code.construct(resource, runtime.object_init, &[]);
            code.ret_value(1);
        });

    let methods = Demo {
        reciprocal,
        lucky,
        spin,
        quit,
        open,
        twice,
    };
    (builder.finish(), methods)
}
