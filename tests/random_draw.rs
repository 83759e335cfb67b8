//! This module is an integration test for a method whose result depends on a
//! random draw, checking that every generated test case pins down the value
//! that was actually drawn.
#![cfg(test)]

use std::collections::BTreeSet;

use symbolic_test_generator as stg;
use symbolic_test_generator::{
    instrumentation::storage::NdTarget,
    program::types::ConcreteValue,
    sandbox::protocol::Outcome,
    watchdog::LazyWatchdog,
    TestCase,
};

mod common;

/// Gets the drawn value and the returned value of `test_case`.
fn draw_and_result(test_case: &TestCase) -> (i64, i64) {
    assert_eq!(test_case.nd_values.len(), 1, "{test_case:?}");
    let record = &test_case.nd_values.records[0];
    assert_eq!(record.signature, "java.util.Random.nextInt(int)");
    assert_eq!(record.occurrence, 0);
    assert!(matches!(record.target, NdTarget::Instance(_)));

    let ConcreteValue::Int(draw) = record.value else {
        panic!("expected an integer draw, found {:?}", record.value);
    };
    let Outcome::Success {
        value: ConcreteValue::Int(result),
    } = test_case.expected
    else {
        panic!("expected an integer result, found {:?}", test_case.expected);
    };
    (draw, result)
}

#[test_log::test]
fn both_sides_of_the_draw_are_covered() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let report = stg::new(program, demo.lucky, common::generator_config(), LazyWatchdog.in_arc())
        .generate()?;

    assert_eq!(report.test_cases.len(), 2);
    assert_eq!(report.stats.diverged, 0);

    let mut results = BTreeSet::new();
    for test_case in &report.test_cases {
        let (draw, result) = draw_and_result(test_case);
        assert!((0..10).contains(&draw));
        assert_eq!(result, i64::from(draw < 5));
        results.insert(result);
    }
    assert_eq!(results, BTreeSet::from([0, 1]));

    Ok(())
}

#[test_log::test]
fn unreplayed_draws_record_what_the_run_produced() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let config = common::generator_config().with_replay_assumptions(false);
    let report = stg::new(program, demo.lucky, config, LazyWatchdog.in_arc()).generate()?;

    assert_eq!(report.test_cases.len(), 2);
    assert!(report.rejected.is_empty());
    for test_case in &report.test_cases {
        let (draw, result) = draw_and_result(test_case);
        assert_eq!(result, i64::from(draw < 5));

        let replay = test_case.replay_invocation(1_000);
        assert_eq!(replay.replay.as_ref(), Some(&test_case.nd_values));
    }

    Ok(())
}
