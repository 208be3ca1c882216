//! Shared fixtures for the in-memory integration tests

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use netcheck::config::InterpreterConfig;
use netcheck::interpreter::{TestCaseResult, Verdict};
use netcheck::inventory::{Identity, Inventory, PodRef, PortProtocol, Protocol};
use netcheck::mock::InMemoryCluster;
use netcheck::perturbation::{Action, Step};
use netcheck::report::Reporter;
use netcheck::truthtable::{ExpectedTable, TruthTable};

pub fn xa() -> Identity {
    Identity::new("x", "a", IpAddr::from([10, 0, 0, 1]))
}

pub fn yb() -> Identity {
    Identity::new("y", "b", IpAddr::from([10, 0, 1, 2]))
}

pub fn zc() -> Identity {
    Identity::new("z", "c", IpAddr::from([10, 0, 2, 3]))
}

pub fn tcp80() -> PortProtocol {
    PortProtocol::new(80, Protocol::Tcp)
}

/// x/a, y/b and z/c in three namespaces
pub fn three_pod_cluster() -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::new(vec![xa(), yb(), zc()]))
}

/// Snapshot the cluster with 80/TCP as the only tuple
pub async fn snapshot(cluster: &InMemoryCluster) -> Inventory {
    Inventory::snapshot(cluster, vec![tcp80()])
        .await
        .expect("snapshot of in-memory cluster")
}

pub fn expected(inventory: &Inventory, default: bool) -> ExpectedTable {
    TruthTable::filled(inventory.pods(), inventory.tuples().to_vec(), default)
        .expect("inventory has no duplicates")
}

pub fn deny(table: &mut ExpectedTable, source: &Identity, destination: &Identity) {
    table
        .set(&source.pod, &destination.pod, &tcp80(), false)
        .expect("cell in table");
}

/// No settle wait; reset and verification on
pub fn config() -> InterpreterConfig {
    InterpreterConfig {
        perturbation_wait_seconds: 0,
        ..Default::default()
    }
}

pub fn ingress_policy(namespace: &str, name: &str) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
    }
}

pub fn step(actions: Vec<Action>, expected: ExpectedTable) -> Step {
    Step {
        description: None,
        actions,
        expected,
        tags: BTreeSet::new(),
    }
}

pub fn create(namespace: &str, name: &str) -> Action {
    Action::CreatePolicy {
        policy: ingress_policy(namespace, name),
    }
}

pub fn pod(identity: &Identity) -> PodRef {
    identity.pod.clone()
}

/// Collects verdicts in report order
#[derive(Default)]
pub struct Collect {
    pub verdicts: Vec<(usize, Verdict)>,
    pub descriptions: Vec<String>,
}

impl Reporter for Collect {
    fn report(&mut self, index: usize, result: &TestCaseResult) {
        self.verdicts.push((index, result.verdict()));
        self.descriptions.push(result.description.clone());
    }
}
