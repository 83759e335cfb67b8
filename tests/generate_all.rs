//! This module is an integration test that generates tests for several methods
//! of one program at once, sharing a pool of sandboxes between them.
#![cfg(test)]

use symbolic_test_generator as stg;
use symbolic_test_generator::{sandbox::protocol::Outcome, watchdog::LazyWatchdog};

mod common;

#[test_log::test]
fn every_method_gets_its_own_report() -> anyhow::Result<()> {
    let (program, demo) = common::demo_program();
    let methods = [demo.reciprocal, demo.lucky, demo.twice];
    let config = common::generator_config().with_pool_size(2);

    let reports = stg::generate_all(program, &methods, config, LazyWatchdog.in_arc())?;

    let names: Vec<_> = reports.iter().map(|r| r.method.as_str()).collect();
    assert_eq!(names, vec![
        "demo.Maths.reciprocal(int)",
        "demo.Dice.lucky()",
        "demo.Maths.twice(int)",
    ]);
    for report in &reports {
        assert_eq!(report.test_cases.len(), 2, "{}", report.method);
        assert!(report
            .test_cases
            .iter()
            .all(|t| !t.expected.is_undetermined() && t.method == report.method));
    }
    assert!(reports[1]
        .test_cases
        .iter()
        .all(|t| matches!(t.expected, Outcome::Success { .. })));

    Ok(())
}
