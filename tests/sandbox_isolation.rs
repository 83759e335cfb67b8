//! This module is an integration test for the isolation the sandbox provides:
//! a method that exits, one that throws from a finalizer and one that never
//! returns all produce an outcome, and the sandbox keeps serving requests
//! afterwards.
#![cfg(test)]

use std::time::{Duration, Instant};

use symbolic_test_generator::{
    program::types::ConcreteValue,
    sandbox::protocol::Outcome,
};

mod common;

#[test_log::test]
fn forced_exits_crash_the_process_but_not_the_caller() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let mut sandbox = common::spawn_sandbox(&program)?;

    let response = sandbox.invoke(common::invocation(&program, demo.quit, vec![], 1_000)?)?;
    assert_eq!(response.outcome, Outcome::SandboxCrashed { exit_code: Some(3) });
    assert!(!sandbox.is_running());

    let response = sandbox.invoke(common::invocation(
        &program,
        demo.reciprocal,
        vec![ConcreteValue::Int(1)],
        1_000,
    )?)?;
    assert_eq!(response.outcome, Outcome::Success {
        value: ConcreteValue::Int(1),
    });
    assert!(sandbox.is_running());

    Ok(())
}

#[test_log::test]
fn throwing_finalizers_are_implicit_exceptions() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let mut sandbox = common::spawn_sandbox(&program)?;

    let response = sandbox.invoke(common::invocation(&program, demo.open, vec![], 1_000)?)?;
    assert_eq!(response.outcome, Outcome::ImplicitlyThrown {
        class: "java.lang.RuntimeException".to_string(),
    });

    let response = sandbox.invoke(common::invocation(
        &program,
        demo.reciprocal,
        vec![ConcreteValue::Int(0)],
        1_000,
    )?)?;
    assert_eq!(response.outcome, Outcome::ImplicitlyThrown {
        class: "java.lang.ArithmeticException".to_string(),
    });

    Ok(())
}

#[test_log::test]
fn infinite_loops_time_out_within_their_budget() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let mut sandbox = common::spawn_sandbox(&program)?;
    sandbox.warmup()?;

    let started = Instant::now();
    let response = sandbox.invoke(common::invocation(&program, demo.spin, vec![], 1_000)?)?;
    let elapsed = started.elapsed();

    assert_eq!(response.outcome, Outcome::Timeout);
    assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_000), "{elapsed:?}");
    assert!(!sandbox.is_running());

    let response = sandbox.invoke(common::invocation(
        &program,
        demo.reciprocal,
        vec![ConcreteValue::Int(2)],
        1_000,
    )?)?;
    assert_eq!(response.outcome, Outcome::Success {
        value: ConcreteValue::Int(0),
    });

    Ok(())
}

#[test_log::test]
fn retries_get_a_fresh_process_for_each_attempt() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let mut sandbox = common::spawn_sandbox(&program)?;

    let response = sandbox.invoke_with_retry(common::invocation(&program, demo.spin, vec![], 200)?)?;
    assert_eq!(response.outcome, Outcome::Timeout);

    let response = sandbox.invoke_with_retry(common::invocation(&program, demo.open, vec![], 1_000)?)?;
    assert!(matches!(response.outcome, Outcome::ImplicitlyThrown { .. }));

    Ok(())
}

#[test_log::test]
fn expected_exits_are_not_run_twice() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let mut sandbox = common::spawn_sandbox(&program)?;
    let exits_with_3 = |outcome: &Outcome| *outcome == Outcome::SandboxCrashed { exit_code: Some(3) };

    let invocation = common::invocation(&program, demo.quit, vec![], 1_000)?;
    let response = sandbox.invoke_with_retry_unless(invocation.clone(), exits_with_3)?;
    assert_eq!(response.outcome, Outcome::SandboxCrashed { exit_code: Some(3) });
    assert_eq!(sandbox.invocations(), 1);

    let response = sandbox.invoke_with_retry(invocation)?;
    assert_eq!(response.outcome, Outcome::SandboxCrashed { exit_code: Some(3) });
    assert_eq!(sandbox.invocations(), 3);

    Ok(())
}
