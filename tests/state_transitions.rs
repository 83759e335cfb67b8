//! This module is an integration test for the bookkeeping of execution states
//! across calls, returns and exceptions, both when driven by hand and when
//! produced by exploring a program.
#![cfg(test)]

use std::sync::Arc;

use symbolic_test_generator::{
    constant::{CALL_DECISION, RETURN_DECISION},
    explorer::{Config, ExplorationResult, Explorer},
    instrumentation::registry::NdRegistry,
    program::types::{ClassId, InstructionId, LocalId, MethodId},
    state::{
        edge::{Decision, Edge},
        frame::CallArguments,
        ExecutionState,
        MethodResult,
        StateLabel,
        SymbolicFailure,
    },
    symbolic::{
        memory::{Reference, SymbolicValue},
        update::SymbolicStateUpdate,
        SymbolicState,
    },
    watchdog::LazyWatchdog,
};

mod common;

fn explore(method: fn(&common::Demo) -> MethodId) -> anyhow::Result<ExplorationResult> {
    let (program, demo) = common::demo_program();
    let explorer = Explorer::new(
        Arc::new(program),
        method(&demo),
        NdRegistry::default(),
        Config::default(),
        LazyWatchdog.in_arc(),
    );
    Ok(explorer.explore()?)
}

/// A state two instructions into method 0, about to call method 1.
fn caller() -> anyhow::Result<ExecutionState> {
    let root = ExecutionState::initial(
        MethodId(0),
        CallArguments::new(None, vec![SymbolicValue::int(7)]),
        SymbolicState::new(),
    );
    let update = SymbolicStateUpdate::new().with_local(LocalId(0), SymbolicValue::int(7));
    Ok(root.update(
        Edge::new(
            InstructionId::entry(MethodId(0)),
            InstructionId::new(MethodId(0), 1),
            Decision::Branch(0),
        ),
        &update,
        false,
    )?)
}

#[test]
fn explored_paths_keep_their_histories_aligned() -> anyhow::Result<()> {
    let result = explore(|demo| demo.twice)?;
    assert!(!result.terminal_states.is_empty());

    for state in &result.terminal_states {
        state.check_invariants()?;
        assert_eq!(state.path().len(), state.path_length());
        assert_eq!(state.decision_path().len(), state.path_length());
        assert_eq!(state.edges().len(), state.path_length());
        assert!(state.stack().is_empty());
        assert_eq!(state.label(), StateLabel::Terminal);

        let calls = state.decision_path().iter().filter(|&&d| d == CALL_DECISION).count();
        let returns = state.decision_path().iter().filter(|&&d| d == RETURN_DECISION).count();
        assert_eq!(returns, calls + 1);
    }

    Ok(())
}

#[test]
fn exploration_is_reproducible() -> anyhow::Result<()> {
    let histories = |result: &ExplorationResult| {
        let mut histories: Vec<_> = result
            .terminal_states
            .iter()
            .map(|s| (s.decision_path().clone(), s.path().clone(), s.fingerprint()))
            .collect();
        histories.sort();
        histories
    };

    let first = explore(|demo| demo.twice)?;
    let second = explore(|demo| demo.twice)?;
    assert_eq!(histories(&first), histories(&second));

    Ok(())
}

#[test]
fn returning_restores_the_calling_frame() -> anyhow::Result<()> {
    let caller = caller()?;
    let callee = caller.push(
        InstructionId::entry(MethodId(1)),
        CallArguments::new(None, vec![SymbolicValue::int(7)]),
        &SymbolicStateUpdate::new(),
        MethodId(1),
    )?;
    assert_eq!(callee.stack().len(), caller.stack().len() + 1);
    assert_eq!(*callee.decision_path().back().unwrap(), CALL_DECISION);

    let returned = callee.pop(MethodResult::Success(Some(SymbolicValue::int(1))))?;
    assert_eq!(returned.stack().len(), caller.stack().len());
    assert_eq!(returned.stmt(), caller.stmt());
    assert_eq!(returned.frame(), caller.frame());
    assert_eq!(*returned.decision_path().back().unwrap(), RETURN_DECISION);
    returned.check_invariants()?;

    Ok(())
}

#[test]
fn an_exception_returned_from_a_callee_resumes_the_caller() -> anyhow::Result<()> {
    let caller = caller()?;
    let callee = caller.push(
        InstructionId::entry(MethodId(1)),
        CallArguments::default(),
        &SymbolicStateUpdate::new(),
        MethodId(1),
    )?;
    let failure = SymbolicFailure {
        class:     ClassId(3),
        object:    Reference::Null,
        explicit:  false,
        raised_at: callee.stmt(),
    };

    let resumed = callee.pop(MethodResult::Failure(failure.clone()))?;
    assert_eq!(resumed.stmt(), caller.stmt());
    assert_eq!(resumed.stack().len(), callee.stack().len() - 1);
    assert_eq!(resumed.method_result(), Some(&MethodResult::Failure(failure)));
    assert_eq!(resumed.label(), StateLabel::Intermediate);
    assert_eq!(resumed.path_length(), caller.path_length() + 2);

    Ok(())
}
