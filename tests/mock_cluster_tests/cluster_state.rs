//! Integration tests for cluster perturbation
//!
//! These tests tell the story of how the interpreter treats the cluster
//! between probe rounds: what a reset restores, what read-back verification
//! catches, and how a failed mutation ends a test case without ending the
//! run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::networking::v1::{NetworkPolicyIngressRule, NetworkPolicyPort};
use tokio_util::sync::CancellationToken;

use netcheck::config::InterpreterConfig;
use netcheck::interpreter::{Interpreter, StepPhase, TestCase, Verdict};
use netcheck::inventory::{Inventory, Labels, ResourceRef};
use netcheck::mock::{InMemoryCluster, StaticProbeExecutor};
use netcheck::perturbation::{Action, NAMESPACE_NAME_LABEL};
use netcheck::provisioner::ResourceProvisioner;
use netcheck::Error;

use super::helpers::*;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn interpreter(cluster: Arc<InMemoryCluster>, inventory: Inventory) -> Interpreter {
    Interpreter::new(
        cluster,
        Arc::new(StaticProbeExecutor::allow_all()),
        inventory,
        config(),
    )
    .unwrap()
}

/// Story: leftovers from an earlier case are wiped before the next one
#[tokio::test]
async fn reset_clears_policies_and_restores_labels() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let pod_ref = ResourceRef::Pod(pod(&xa()));
    let original_pod_labels = cluster.labels(&pod_ref).unwrap();

    // State left behind by someone else
    cluster
        .apply_policy(&ingress_policy("z", "leftover"))
        .await
        .unwrap();
    cluster
        .relabel_resource(&pod_ref, &labels(&[("pod", "renamed")]))
        .await
        .unwrap();

    let case = TestCase::new(
        "fresh",
        vec![step(vec![create("x", "fresh")], expected(&inventory, true))],
    );
    let result = interpreter(cluster.clone(), inventory)
        .execute_test_case(&case)
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    assert_eq!(result.steps[0].phases[1], StepPhase::Resetting);
    let names: Vec<_> = cluster
        .policies()
        .into_iter()
        .filter_map(|p| p.metadata.name)
        .collect();
    assert_eq!(names, vec!["fresh".to_string()]);
    assert_eq!(cluster.labels(&pod_ref).unwrap(), original_pod_labels);
}

/// Story: relabel actions are applied and read back before probing
#[tokio::test]
async fn relabelled_resources_pass_verification() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let case = TestCase::new(
        "relabel",
        vec![step(
            vec![
                Action::SetNamespaceLabels {
                    namespace: "y".to_string(),
                    labels: labels(&[("team", "blue")]),
                },
                Action::SetPodLabels {
                    namespace: "z".to_string(),
                    pod: "c".to_string(),
                    labels: labels(&[("pod", "c"), ("tier", "db")]),
                },
            ],
            expected(&inventory, true),
        )],
    );

    let result = interpreter(cluster.clone(), inventory)
        .execute_test_case(&case)
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    assert!(result.steps[0].phases.contains(&StepPhase::Verifying));
    let ns = cluster
        .labels(&ResourceRef::Namespace("y".to_string()))
        .unwrap();
    assert_eq!(ns.get("team").map(String::as_str), Some("blue"));
    assert_eq!(ns.get(NAMESPACE_NAME_LABEL).map(String::as_str), Some("y"));
}

/// Story: the API server fills in defaults; verification is not fooled
#[tokio::test]
async fn server_defaulting_passes_verification() {
    let cluster = Arc::new(
        InMemoryCluster::new(vec![xa(), yb(), zc()]).on_apply(|p| {
            if let Some(spec) = p.spec.as_mut() {
                for rule in spec.ingress.iter_mut().flatten() {
                    for port in rule.ports.iter_mut().flatten() {
                        port.protocol.get_or_insert_with(|| "TCP".to_string());
                    }
                }
            }
        }),
    );
    let inventory = snapshot(&cluster).await;

    let mut policy = ingress_policy("x", "ports");
    if let Some(spec) = policy.spec.as_mut() {
        spec.ingress = Some(vec![NetworkPolicyIngressRule {
            ports: Some(vec![NetworkPolicyPort::default()]),
            ..Default::default()
        }]);
    }
    let case = TestCase::new(
        "defaulted",
        vec![step(
            vec![Action::CreatePolicy { policy }],
            expected(&inventory, true),
        )],
    );

    let result = interpreter(cluster, inventory)
        .execute_test_case(&case)
        .await
        .unwrap();
    assert_eq!(result.verdict(), Verdict::Passed);
}

/// Story: a mutating webhook rewrites the policy; the case fails before
/// any probe is trusted
#[tokio::test]
async fn mutated_policy_fails_verification() {
    let cluster = Arc::new(
        InMemoryCluster::new(vec![xa(), yb(), zc()]).on_apply(|p| {
            if let Some(spec) = p.spec.as_mut() {
                spec.ingress = Some(vec![NetworkPolicyIngressRule::default()]);
            }
        }),
    );
    let inventory = snapshot(&cluster).await;
    let executor = Arc::new(StaticProbeExecutor::allow_all());
    let interpreter =
        Interpreter::new(cluster, executor.clone(), inventory.clone(), config()).unwrap();

    let result = interpreter
        .execute_test_case(&TestCase::new(
            "mutated",
            vec![step(vec![create("x", "deny")], expected(&inventory, true))],
        ))
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Errored);
    let failure = result.failure.unwrap();
    assert_eq!(failure.phase, StepPhase::Verifying);
    assert!(matches!(failure.error, Error::Verification(_)));
    assert_eq!(executor.attempts(), 0);
}

/// Story: updating a policy that was never created is a provisioning error
#[tokio::test]
async fn update_of_missing_policy_errors() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let case = TestCase::new(
        "update missing",
        vec![step(
            vec![Action::UpdatePolicy {
                policy: ingress_policy("x", "ghost"),
            }],
            expected(&inventory, true),
        )],
    );

    let result = interpreter(cluster.clone(), inventory)
        .execute_test_case(&case)
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Errored);
    assert_eq!(result.failure.unwrap().phase, StepPhase::Perturbing);
    assert!(cluster.policies().is_empty());
}

/// Story: create, update and delete across steps, each verified
#[tokio::test]
async fn policy_lifecycle_across_steps() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let mut updated = ingress_policy("x", "p");
    updated.metadata.labels = Some(BTreeMap::from([("rev".to_string(), "2".to_string())]));

    let case = TestCase::new(
        "lifecycle",
        vec![
            step(vec![create("x", "p")], expected(&inventory, true)),
            step(
                vec![Action::UpdatePolicy { policy: updated }],
                expected(&inventory, true),
            ),
            step(
                vec![Action::DeletePolicy {
                    namespace: "x".to_string(),
                    name: "p".to_string(),
                }],
                expected(&inventory, true),
            ),
        ],
    );

    let result = interpreter(cluster.clone(), inventory)
        .execute_test_case(&case)
        .await
        .unwrap();

    assert_eq!(result.verdict(), Verdict::Passed);
    assert_eq!(result.steps.len(), 3);
    assert!(cluster.policies().is_empty());
    let policy_mutations: Vec<String> = cluster
        .mutations()
        .into_iter()
        .filter(|m| !m.starts_with("relabel"))
        .collect();
    assert_eq!(
        policy_mutations,
        vec![
            "apply x/p".to_string(),
            "apply x/p".to_string(),
            "delete x/p".to_string(),
        ]
    );
}

/// Story: a rejected policy in step one means step two is never applied,
/// and the next test case still runs
#[tokio::test]
async fn rejected_step_fails_fast_and_run_continues() {
    let cluster = Arc::new(InMemoryCluster::new(vec![xa(), yb(), zc()]).reject_policy("blocked"));
    let inventory = snapshot(&cluster).await;
    let cases = vec![
        TestCase::new(
            "blocked first",
            vec![
                step(vec![create("x", "blocked")], expected(&inventory, true)),
                step(vec![create("x", "second")], expected(&inventory, true)),
            ],
        ),
        TestCase::new(
            "next",
            vec![step(vec![create("y", "next")], expected(&inventory, true))],
        ),
    ];

    let mut reporter = Collect::default();
    let summary = interpreter(cluster.clone(), inventory)
        .run(cases, &mut reporter)
        .await
        .unwrap();

    assert_eq!(reporter.verdicts, vec![(0, Verdict::Errored), (1, Verdict::Passed)]);
    assert!(!cluster
        .mutations()
        .iter()
        .any(|m| m.contains("second")));
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.exit_code(), 1);
}

/// Story: an interrupt during a long settle wait ends the run promptly
#[tokio::test(start_paused = true)]
async fn cancellation_during_settle_aborts_run() {
    let cluster = three_pod_cluster();
    let inventory = snapshot(&cluster).await;
    let cancel = CancellationToken::new();
    let config = InterpreterConfig {
        perturbation_wait_seconds: 3600,
        ..config()
    };
    let executor = Arc::new(StaticProbeExecutor::allow_all());
    let interpreter = Interpreter::new(cluster, executor.clone(), inventory.clone(), config)
        .unwrap()
        .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let mut reporter = Collect::default();
    let err = interpreter
        .run(
            vec![TestCase::new(
                "slow settle",
                vec![step(vec![create("x", "p")], expected(&inventory, true))],
            )],
            &mut reporter,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3600));
    assert!(reporter.verdicts.is_empty());
    assert_eq!(executor.attempts(), 0);
}
