//! Cluster perturbation steps
//!
//! A [`Step`] mutates policy or label state through the provisioner, then
//! the cluster is given a settle period for the enforcement layer to
//! converge. Optionally the resulting state is read back and compared with
//! what was requested, which catches silent API-server rejections and
//! mutating webhooks before any probe runs.
//!
//! Provisioner errors are never retried here; they become the test case's
//! terminal error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPort, NetworkPolicySpec};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::inventory::{Inventory, Labels, PodRef, ResourceRef};
use crate::provisioner::{policy_key, ResourceProvisioner};
use crate::truthtable::ExpectedTable;
use crate::{Error, Result};

/// Label the API server adds to every namespace and keeps in sync with its name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// One cluster mutation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Create a policy that must not already exist
    CreatePolicy {
        /// Policy to create
        policy: NetworkPolicy,
    },
    /// Replace a policy that must already exist
    UpdatePolicy {
        /// New policy contents
        policy: NetworkPolicy,
    },
    /// Delete a policy
    DeletePolicy {
        /// Policy namespace
        namespace: String,
        /// Policy name
        name: String,
    },
    /// Replace the labels of a namespace
    SetNamespaceLabels {
        /// Namespace
        namespace: String,
        /// New label set
        labels: Labels,
    },
    /// Replace the labels of a pod
    SetPodLabels {
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// New label set
        labels: Labels,
    },
}

impl Action {
    /// Short human-readable description for logs
    pub fn describe(&self) -> String {
        match self {
            Self::CreatePolicy { policy } => format!("create policy {}", policy_display(policy)),
            Self::UpdatePolicy { policy } => format!("update policy {}", policy_display(policy)),
            Self::DeletePolicy { namespace, name } => {
                format!("delete policy {}/{}", namespace, name)
            }
            Self::SetNamespaceLabels { namespace, labels } => {
                format!("set namespace {} labels {:?}", namespace, labels)
            }
            Self::SetPodLabels {
                namespace,
                pod,
                labels,
            } => format!("set pod {}/{} labels {:?}", namespace, pod, labels),
        }
    }
}

fn policy_display(policy: &NetworkPolicy) -> String {
    format!(
        "{}/{}",
        policy.metadata.namespace.as_deref().unwrap_or("<none>"),
        policy.metadata.name.as_deref().unwrap_or("<none>")
    )
}

/// One perturbation plus the reachability expected after it
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    /// Optional description
    pub description: Option<String>,
    /// Mutations, applied in order
    pub actions: Vec<Action>,
    /// Expected reachability once the mutations have converged
    pub expected: ExpectedTable,
    /// Tags for filtering/reporting; never inspected by the interpreter
    pub tags: BTreeSet<String>,
}

/// Applies steps to the cluster through a provisioner
pub struct Perturber {
    provisioner: Arc<dyn ResourceProvisioner>,
    settle: Duration,
}

impl Perturber {
    /// Create a perturber waiting `settle` after each step
    pub fn new(provisioner: Arc<dyn ResourceProvisioner>, settle: Duration) -> Self {
        Self {
            provisioner,
            settle,
        }
    }

    /// Delete every policy and restore the labels captured in the inventory
    #[instrument(skip_all)]
    pub async fn reset(&self, inventory: &Inventory) -> Result<()> {
        let deleted = self.provisioner.clear_policies().await?;
        debug!(deleted = ?deleted, "cleared policies");

        for (resource, labels) in inventory.original_labels() {
            self.provisioner.relabel_resource(resource, labels).await?;
        }
        info!(
            policies = deleted.len(),
            resources = inventory.original_labels().len(),
            "cluster reset to inventory state"
        );
        Ok(())
    }

    /// Apply each action in order, stopping at the first failure
    pub async fn apply(&self, actions: &[Action]) -> Result<()> {
        for action in actions {
            info!(action = %action.describe(), "applying perturbation");
            self.apply_one(action).await?;
        }
        Ok(())
    }

    async fn apply_one(&self, action: &Action) -> Result<()> {
        match action {
            Action::CreatePolicy { policy } => {
                let (namespace, name) = policy_key(policy)?;
                if self.provisioner.read_policy(&namespace, &name).await?.is_some() {
                    return Err(Error::provisioning(format!(
                        "cannot create policy {}/{}: it already exists",
                        namespace, name
                    )));
                }
                self.provisioner.apply_policy(policy).await
            }
            Action::UpdatePolicy { policy } => {
                let (namespace, name) = policy_key(policy)?;
                if self.provisioner.read_policy(&namespace, &name).await?.is_none() {
                    return Err(Error::provisioning(format!(
                        "cannot update policy {}/{}: it does not exist",
                        namespace, name
                    )));
                }
                self.provisioner.apply_policy(policy).await
            }
            Action::DeletePolicy { namespace, name } => {
                self.provisioner.delete_policy(namespace, name).await
            }
            Action::SetNamespaceLabels { namespace, labels } => {
                self.provisioner
                    .relabel_resource(&ResourceRef::Namespace(namespace.clone()), labels)
                    .await
            }
            Action::SetPodLabels {
                namespace,
                pod,
                labels,
            } => {
                self.provisioner
                    .relabel_resource(&ResourceRef::Pod(PodRef::new(namespace, pod)), labels)
                    .await
            }
        }
    }

    /// Wait out the settle period, returning early with `Cancelled`
    pub async fn settle(&self, cancel: &CancellationToken) -> Result<()> {
        if self.settle.is_zero() {
            return Ok(());
        }
        debug!(
            seconds = self.settle.as_secs_f64(),
            "waiting for policy enforcement to settle"
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(self.settle) => Ok(()),
        }
    }

    /// Read back every object the actions touched and compare with the
    /// state they should have produced.
    pub async fn verify(&self, actions: &[Action]) -> Result<()> {
        let intended = IntendedState::from_actions(actions)?;

        for ((namespace, name), want) in &intended.policies {
            let actual = self.provisioner.read_policy(namespace, name).await?;
            match (want, actual) {
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(Error::verification(format!(
                        "policy {}/{} still exists after delete",
                        namespace, name
                    )))
                }
                (Some(_), None) => {
                    return Err(Error::verification(format!(
                        "policy {}/{} is missing after apply",
                        namespace, name
                    )))
                }
                (Some(want), Some(actual)) => {
                    if !policies_match(want, &actual) {
                        return Err(Error::verification(format!(
                            "policy {}/{} read back differs from applied policy",
                            namespace, name
                        )));
                    }
                }
            }
        }

        for (resource, want) in &intended.labels {
            let actual = self.provisioner.read_labels(resource).await?;
            if !labels_match(resource, want, &actual) {
                return Err(Error::verification(format!(
                    "{} has labels {:?}, expected {:?}",
                    resource, actual, want
                )));
            }
        }

        debug!(
            policies = intended.policies.len(),
            labelled = intended.labels.len(),
            "cluster state verified"
        );
        Ok(())
    }
}

/// Final state a sequence of actions should leave behind; later actions win
#[derive(Debug, Default)]
struct IntendedState {
    policies: BTreeMap<(String, String), Option<NetworkPolicy>>,
    labels: BTreeMap<ResourceRef, Labels>,
}

impl IntendedState {
    fn from_actions(actions: &[Action]) -> Result<Self> {
        let mut state = Self::default();
        for action in actions {
            match action {
                Action::CreatePolicy { policy } | Action::UpdatePolicy { policy } => {
                    state.policies.insert(policy_key(policy)?, Some(policy.clone()));
                }
                Action::DeletePolicy { namespace, name } => {
                    state
                        .policies
                        .insert((namespace.clone(), name.clone()), None);
                }
                Action::SetNamespaceLabels { namespace, labels } => {
                    state
                        .labels
                        .insert(ResourceRef::Namespace(namespace.clone()), labels.clone());
                }
                Action::SetPodLabels {
                    namespace,
                    pod,
                    labels,
                } => {
                    state
                        .labels
                        .insert(ResourceRef::Pod(PodRef::new(namespace, pod)), labels.clone());
                }
            }
        }
        Ok(state)
    }
}

fn labels_match(resource: &ResourceRef, want: &Labels, actual: &Labels) -> bool {
    match resource {
        ResourceRef::Namespace(_) => {
            let strip = |labels: &Labels| -> Labels {
                labels
                    .iter()
                    .filter(|(k, _)| k.as_str() != NAMESPACE_NAME_LABEL)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            };
            strip(want) == strip(actual)
        }
        ResourceRef::Pod(_) => want == actual,
    }
}

/// Compare an applied policy with what the API server returned.
///
/// Server-populated metadata is ignored, and the spec is compared after
/// filling in the fields the API server defaults.
pub fn policies_match(applied: &NetworkPolicy, actual: &NetworkPolicy) -> bool {
    applied.metadata.name == actual.metadata.name
        && applied.metadata.namespace == actual.metadata.namespace
        && applied.metadata.labels.clone().unwrap_or_default()
            == actual.metadata.labels.clone().unwrap_or_default()
        && normalized_spec(applied) == normalized_spec(actual)
}

fn normalized_spec(policy: &NetworkPolicy) -> NetworkPolicySpec {
    let mut spec = policy.spec.clone().unwrap_or_default();

    if spec.policy_types.as_ref().map_or(true, Vec::is_empty) {
        let mut types = vec!["Ingress".to_string()];
        if spec.egress.as_ref().is_some_and(|e| !e.is_empty()) {
            types.push("Egress".to_string());
        }
        spec.policy_types = Some(types);
    }

    for rule in spec.ingress.iter_mut().flatten() {
        default_port_protocols(&mut rule.ports);
        if rule.from.as_ref().is_some_and(Vec::is_empty) {
            rule.from = None;
        }
    }
    for rule in spec.egress.iter_mut().flatten() {
        default_port_protocols(&mut rule.ports);
        if rule.to.as_ref().is_some_and(Vec::is_empty) {
            rule.to = None;
        }
    }
    if spec.ingress.as_ref().is_some_and(Vec::is_empty) {
        spec.ingress = None;
    }
    if spec.egress.as_ref().is_some_and(Vec::is_empty) {
        spec.egress = None;
    }
    spec
}

fn default_port_protocols(ports: &mut Option<Vec<NetworkPolicyPort>>) {
    for port in ports.iter_mut().flatten() {
        port.protocol.get_or_insert_with(|| "TCP".to_string());
    }
    if ports.as_ref().is_some_and(Vec::is_empty) {
        *ports = None;
    }
}
