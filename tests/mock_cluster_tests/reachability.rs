//! Integration tests for probing and truth-table comparison
//!
//! These tests tell the story of what a policy author sees once a step has
//! been applied: agreement, a policy that fails to block traffic, a flaky
//! probe that must not be mistaken for a policy defect, and loopback cells.

use std::sync::Arc;

use netcheck::config::InterpreterConfig;
use netcheck::interpreter::{Interpreter, TestCase, Verdict};
use netcheck::mock::StaticProbeExecutor;
use netcheck::truthtable::{CellVerdict, ProbeOutcome};

use super::helpers::*;

/// Story: every pod reaches every other pod and that is what was expected
#[tokio::test]
async fn all_reachable_matches_expectation() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let case = TestCase::new(
        "allow all",
        vec![step(vec![create("x", "allow-all")], expected(&inventory, true))],
    );

    let interpreter = Interpreter::new(
        cluster.clone(),
        Arc::new(StaticProbeExecutor::allow_all()),
        inventory,
        config(),
    )
    .unwrap();
    let result = interpreter.execute_test_case(&case).await.unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    let step = &result.steps[0];
    assert!(step.diff.mismatches.is_empty());
    assert!(step.diff.warnings.is_empty());
    assert_eq!(step.diff.compared, 9);
    assert_eq!(step.observed.counts().reachable, 9);
}

/// Story: a deny policy that the enforcement layer ignores shows up as
/// exactly one mismatched cell
#[tokio::test]
async fn ignored_deny_is_reported_as_single_mismatch() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let mut table = expected(&inventory, true);
    deny(&mut table, &xa(), &yb());
    let case = TestCase::new(
        "deny x/a -> y/b",
        vec![step(vec![create("y", "deny-from-x")], table)],
    );

    let interpreter = Interpreter::new(
        cluster.clone(),
        Arc::new(StaticProbeExecutor::allow_all()),
        inventory,
        config(),
    )
    .unwrap();
    let result = interpreter.execute_test_case(&case).await.unwrap();

    assert_eq!(result.verdict(), Verdict::Failed);
    let mismatches = &result.steps[0].diff.mismatches;
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].key.source, pod(&xa()));
    assert_eq!(mismatches[0].key.destination, pod(&yb()));
    assert_eq!(mismatches[0].key.tuple, tcp80());
    assert!(!mismatches[0].expected);
    assert_eq!(mismatches[0].observed, ProbeOutcome::Reachable);
}

/// Story: an enforced deny agrees with the expectation
#[tokio::test]
async fn enforced_deny_agrees() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let mut table = expected(&inventory, true);
    deny(&mut table, &xa(), &yb());

    let executor = StaticProbeExecutor::allow_all().deny(&xa(), &yb(), None);
    let interpreter =
        Interpreter::new(cluster.clone(), Arc::new(executor), inventory, config()).unwrap();
    let result = interpreter
        .execute_test_case(&TestCase::new(
            "deny enforced",
            vec![step(vec![create("y", "deny-from-x")], table)],
        ))
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    assert_eq!(result.steps[0].observed.counts().unreachable, 1);
}

/// Story: one probe keeps failing to execute; after retries+1 attempts the
/// cell is indeterminate, reported as a warning, and the case still passes
#[tokio::test]
async fn flaky_probe_degrades_to_warning() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let executor = Arc::new(StaticProbeExecutor::allow_all().fail(&xa(), &yb(), None));

    let config = InterpreterConfig {
        probe_retries: 2,
        ..config()
    };
    let interpreter =
        Interpreter::new(cluster.clone(), executor.clone(), inventory.clone(), config).unwrap();
    let result = interpreter
        .execute_test_case(&TestCase::new(
            "flaky",
            vec![step(vec![create("x", "p")], expected(&inventory, true))],
        ))
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::PassedWithWarnings);
    let diff = &result.steps[0].diff;
    assert!(diff.mismatches.is_empty());
    assert_eq!(diff.warnings.len(), 1);
    assert_eq!(diff.warnings[0].observed, ProbeOutcome::Indeterminate);
    // 8 healthy cells once each, the flaky cell three times
    assert_eq!(executor.attempts(), 8 + 3);
}

/// Story: loopback cells are excluded when asked, even if they disagree
#[tokio::test]
async fn loopback_mismatch_is_ignored_when_configured() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let mut table = expected(&inventory, true);
    for id in [xa(), yb(), zc()] {
        deny(&mut table, &id, &id);
    }

    let config = InterpreterConfig {
        ignore_loopback: true,
        ..config()
    };
    let interpreter = Interpreter::new(
        cluster.clone(),
        Arc::new(StaticProbeExecutor::allow_all()),
        inventory,
        config,
    )
    .unwrap();
    let result = interpreter
        .execute_test_case(&TestCase::new(
            "loopback",
            vec![step(vec![create("x", "p")], table)],
        ))
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    let diff = &result.steps[0].diff;
    assert_eq!(diff.ignored, 3);
    assert_eq!(diff.compared, 6);
    let verdicts = diff.verdicts();
    assert_eq!(
        verdicts.get(&pod(&xa()), &pod(&xa()), &tcp80()),
        Some(&CellVerdict::Ignored)
    );
}

/// Story: batching changes scheduling only, never the observed table
#[tokio::test]
async fn batch_and_serial_modes_observe_the_same_table() {
    let run = |batch_jobs: bool| async move {
        let cluster = three_pod_cluster();
        let inventory = snapshot(&cluster).await;
        let executor = StaticProbeExecutor::allow_all()
            .deny(&zc(), &xa(), None)
            .fail(&yb(), &zc(), None);
        let config = InterpreterConfig {
            batch_jobs,
            batch_size: 2,
            ..config()
        };
        let interpreter =
            Interpreter::new(cluster.clone(), Arc::new(executor), inventory.clone(), config)
                .unwrap();
        let result = interpreter
            .execute_test_case(&TestCase::new(
                "mode",
                vec![step(vec![create("x", "p")], expected(&inventory, true))],
            ))
            .await
            .unwrap();
        result.steps[0].observed.clone()
    };

    let serial = run(false).await;
    let batched = run(true).await;
    assert_eq!(serial, batched);
    assert_eq!(serial.counts().unreachable, 1);
    assert_eq!(serial.counts().indeterminate, 1);
}
