//! Deterministic in-memory backend
//!
//! [`InMemoryCluster`] stands in for the API server: it stores policies and
//! labels, records every mutation, and can be told to reject or rewrite
//! policies to simulate admission webhooks. [`StaticProbeExecutor`] answers
//! probes from a fixed rule list instead of opening connections.
//!
//! Both back the `--mock` CLI mode and the integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use tracing::debug;

use crate::inventory::{Identity, Labels, PodRef, PortProtocol, Protocol, ResourceRef};
use crate::perturbation::NAMESPACE_NAME_LABEL;
use crate::probe::ProbeExecutor;
use crate::provisioner::{policy_key, ResourceProvisioner};
use crate::Error;

/// Label every mock pod starts with, keyed to its name
pub const POD_LABEL: &str = "pod";

type ApplyHook = Box<dyn Fn(&mut NetworkPolicy) + Send + Sync>;

#[derive(Default)]
struct ClusterState {
    identities: Vec<Identity>,
    policies: BTreeMap<(String, String), NetworkPolicy>,
    labels: BTreeMap<ResourceRef, Labels>,
    mutations: Vec<String>,
}

/// In-memory [`ResourceProvisioner`]
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    rejected: BTreeSet<String>,
    on_apply: Option<ApplyHook>,
}

impl InMemoryCluster {
    /// A cluster holding exactly `identities`, each pod and namespace labelled
    /// the way a fresh provisioner would label them
    pub fn new(identities: Vec<Identity>) -> Self {
        let mut labels = BTreeMap::new();
        for identity in &identities {
            let ns = identity.pod.namespace.clone();
            labels
                .entry(ResourceRef::Namespace(ns.clone()))
                .or_insert_with(|| Labels::from([(NAMESPACE_NAME_LABEL.to_string(), ns)]));
            labels.insert(
                ResourceRef::Pod(identity.pod.clone()),
                Labels::from([(POD_LABEL.to_string(), identity.pod.name.clone())]),
            );
        }

        Self {
            state: Mutex::new(ClusterState {
                identities,
                labels,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Every pod name in every namespace, with IP `10.0.<ns index>.<pod index + 1>`
    pub fn with_pods(namespaces: &[String], pods: &[String]) -> Self {
        let identities = namespaces
            .iter()
            .enumerate()
            .flat_map(|(i, ns)| {
                pods.iter().enumerate().map(move |(j, pod)| {
                    let ip = IpAddr::from([10, 0, (i % 256) as u8, ((j + 1) % 256) as u8]);
                    Identity::new(ns.clone(), pod.clone(), ip)
                })
            })
            .collect();
        Self::new(identities)
    }

    /// Fail every apply of a policy with this name
    pub fn reject_policy(mut self, name: impl Into<String>) -> Self {
        self.rejected.insert(name.into());
        self
    }

    /// Rewrite policies as they are stored, like a mutating webhook
    pub fn on_apply<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut NetworkPolicy) + Send + Sync + 'static,
    {
        self.on_apply = Some(Box::new(hook));
        self
    }

    /// Stored policies, ordered by namespace then name
    pub fn policies(&self) -> Vec<NetworkPolicy> {
        self.state().policies.values().cloned().collect()
    }

    /// Current labels of a resource
    pub fn labels(&self, resource: &ResourceRef) -> Option<Labels> {
        self.state().labels.get(resource).cloned()
    }

    /// Every successful mutation, in order
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResourceProvisioner for InMemoryCluster {
    async fn list_identities(&self) -> Result<Vec<Identity>, Error> {
        Ok(self.state().identities.clone())
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<(), Error> {
        let (namespace, name) = policy_key(policy)?;
        if self.rejected.contains(&name) {
            return Err(Error::provisioning(format!(
                "admission webhook denied network policy {}/{}",
                namespace, name
            )));
        }

        let mut stored = policy.clone();
        if let Some(hook) = &self.on_apply {
            hook(&mut stored);
        }

        let mut state = self.state();
        state.mutations.push(format!("apply {}/{}", namespace, name));
        state.policies.insert((namespace, name), stored);
        Ok(())
    }

    async fn delete_policy(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state();
        if state
            .policies
            .remove(&(namespace.to_string(), name.to_string()))
            .is_none()
        {
            return Err(Error::provisioning(format!(
                "network policy {}/{} not found",
                namespace, name
            )));
        }
        state.mutations.push(format!("delete {}/{}", namespace, name));
        Ok(())
    }

    async fn read_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, Error> {
        Ok(self
            .state()
            .policies
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn relabel_resource(&self, resource: &ResourceRef, labels: &Labels) -> Result<(), Error> {
        let mut state = self.state();
        let Some(current) = state.labels.get_mut(resource) else {
            return Err(Error::provisioning(format!("{} not found", resource)));
        };

        *current = labels.clone();
        // The API server keeps the name label on namespaces no matter what.
        if let ResourceRef::Namespace(ns) = resource {
            current.insert(NAMESPACE_NAME_LABEL.to_string(), ns.clone());
        }
        state.mutations.push(format!("relabel {}", resource));
        Ok(())
    }

    async fn read_labels(&self, resource: &ResourceRef) -> Result<Labels, Error> {
        self.state()
            .labels
            .get(resource)
            .cloned()
            .ok_or_else(|| Error::provisioning(format!("{} not found", resource)))
    }

    async fn clear_policies(&self) -> Result<Vec<String>, Error> {
        let mut state = self.state();
        let deleted: Vec<String> = state
            .policies
            .keys()
            .map(|(ns, name)| format!("{}/{}", ns, name))
            .collect();
        state.policies.clear();
        if !deleted.is_empty() {
            state.mutations.push("clear policies".to_string());
        }
        Ok(deleted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    Refuse,
    Fail,
}

#[derive(Clone, Debug)]
struct ProbeRule {
    source: PodRef,
    destination: IpAddr,
    tuple: Option<PortProtocol>,
    behavior: Behavior,
}

impl ProbeRule {
    fn matches(&self, source: &PodRef, destination: IpAddr, port: u16, protocol: Protocol) -> bool {
        &self.source == source
            && self.destination == destination
            && self
                .tuple
                .map_or(true, |t| t == PortProtocol::new(port, protocol))
    }
}

/// [`ProbeExecutor`] answering from a fixed rule list.
///
/// Every probe connects unless a rule says otherwise; the first matching
/// rule wins.
#[derive(Debug, Default)]
pub struct StaticProbeExecutor {
    rules: Vec<ProbeRule>,
    attempts: AtomicUsize,
}

impl StaticProbeExecutor {
    /// Every probe connects
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Refuse probes from `source` to `destination`, on one tuple or all
    pub fn deny(mut self, source: &Identity, destination: &Identity, tuple: Option<PortProtocol>) -> Self {
        self.rules.push(ProbeRule {
            source: source.pod.clone(),
            destination: destination.ip,
            tuple,
            behavior: Behavior::Refuse,
        });
        self
    }

    /// Fail probes from `source` to `destination` with an execution error
    pub fn fail(mut self, source: &Identity, destination: &Identity, tuple: Option<PortProtocol>) -> Self {
        self.rules.push(ProbeRule {
            source: source.pod.clone(),
            destination: destination.ip,
            tuple,
            behavior: Behavior::Fail,
        });
        self
    }

    /// Total execution attempts so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeExecutor for StaticProbeExecutor {
    async fn execute(
        &self,
        source: &Identity,
        destination: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .rules
            .iter()
            .find(|r| r.matches(&source.pod, destination, port, protocol))
            .map(|r| r.behavior);
        debug!(source = %source.pod, destination = %destination, port, protocol = %protocol, ?behavior, "static probe");

        match behavior {
            None => Ok(true),
            Some(Behavior::Refuse) => Ok(false),
            Some(Behavior::Fail) => Err(Error::probe(format!(
                "simulated exec failure from {} to {}:{}",
                source.pod, destination, port
            ))),
        }
    }
}
