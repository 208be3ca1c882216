//! Integration tests for YAML test case files
//!
//! These tests tell the story of a user writing a suite file, checking it
//! with a dry run, and running it against the in-memory backend.

use std::io::Write;
use std::sync::Arc;

use netcheck::interpreter::{Interpreter, Verdict};
use netcheck::inventory::{PodRef, PortProtocol, Protocol};
use netcheck::mock::{InMemoryCluster, StaticProbeExecutor};
use netcheck::testcase::{count_by_tag, load_test_cases};

use super::helpers::*;

const SUITE: &str = r#"
testCases:
  - description: deny all ingress to namespace x
    tags: [ingress, deny-all]
    steps:
      - description: install deny-all
        actions:
          - createPolicy:
              policy:
                apiVersion: networking.k8s.io/v1
                kind: NetworkPolicy
                metadata:
                  name: deny-all
                  namespace: x
                spec:
                  podSelector: {}
                  policyTypes: [Ingress]
        expected:
          default: true
          rules:
            - from: "*"
              to: "x/*"
              reachable: false
            - from: "x/*"
              to: "x/*"
              reachable: false
      - description: remove it again
        actions:
          - deletePolicy:
              namespace: x
              name: deny-all
        expected:
          default: true
  - description: relabel namespace y
    tags: [labels]
    steps:
      - actions:
          - setNamespaceLabels:
              namespace: y
              labels:
                team: blue
        expected:
          default: true
"#;

fn suite_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", SUITE).unwrap();
    file
}

fn cluster() -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::with_pods(
        &["x".to_string(), "y".to_string()],
        &["a".to_string(), "b".to_string()],
    ))
}

/// Story: a dry run lists the suite and counts tags without touching the cluster
#[tokio::test]
async fn suite_loads_and_counts_tags() {
    let cluster = cluster();
    let inventory = snapshot(&cluster).await;
    let file = suite_file();

    let cases = load_test_cases(file.path(), &inventory).unwrap();
    assert_eq!(cases.len(), 2);
    assert_eq!(cases[0].steps.len(), 2);

    let counts = count_by_tag(&cases);
    assert_eq!(counts.get("ingress"), Some(&1));
    assert_eq!(counts.get("labels"), Some(&1));
    assert!(cluster.mutations().is_empty());

    let expected = &cases[0].steps[0].expected;
    let tcp80 = PortProtocol::new(80, Protocol::Tcp);
    assert_eq!(
        expected.get(&PodRef::new("y", "a"), &PodRef::new("x", "b"), &tcp80),
        Some(&false)
    );
    assert_eq!(
        expected.get(&PodRef::new("x", "a"), &PodRef::new("y", "b"), &tcp80),
        Some(&true)
    );
}

/// Story: on a cluster that ignores policies, the deny-all case fails with
/// one mismatch per blocked cell and the labels case still passes
#[tokio::test]
async fn unenforced_suite_reports_the_gap() {
    let cluster = cluster();
    let inventory = snapshot(&cluster).await;
    let cases = load_test_cases(suite_file().path(), &inventory).unwrap();

    let interpreter = Interpreter::new(
        cluster.clone(),
        Arc::new(StaticProbeExecutor::allow_all()),
        inventory,
        config(),
    )
    .unwrap();
    let mut reporter = Collect::default();
    let summary = interpreter.run(cases, &mut reporter).await.unwrap();

    assert_eq!(
        reporter.verdicts,
        vec![(0, Verdict::Failed), (1, Verdict::Passed)]
    );
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.exit_code(), 1);
}

/// Story: where the deny-all is enforced, its step agrees cell for cell
#[tokio::test]
async fn enforced_deny_all_passes() {
    let cluster = cluster();
    let inventory = snapshot(&cluster).await;
    let cases = load_test_cases(suite_file().path(), &inventory).unwrap();

    let identities = inventory.identities().to_vec();
    let mut executor = StaticProbeExecutor::allow_all();
    for source in &identities {
        for destination in identities.iter().filter(|d| d.pod.namespace == "x") {
            executor = executor.deny(source, destination, None);
        }
    }

    // Static deny rules cannot follow the policy's removal, so only the
    // install step is run.
    let mut install = cases[0].clone();
    install.steps.truncate(1);

    let interpreter =
        Interpreter::new(cluster.clone(), Arc::new(executor), inventory, config()).unwrap();
    let result = interpreter.execute_test_case(&install).await.unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    assert_eq!(result.steps[0].observed.counts().unreachable, 8);
    assert_eq!(result.steps[0].description.as_deref(), Some("install deny-all"));
}
