//! kube-rs backed provisioner

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use super::{policy_key, ResourceProvisioner};
use crate::inventory::{Identity, Labels, ResourceRef};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

const FIELD_MANAGER: &str = "netcheck";

/// Provisioner talking to a live cluster through kube-rs
pub struct KubeProvisioner {
    client: Client,
    namespaces: Vec<String>,
    pods: Vec<String>,
    pod_ip_timeout: Duration,
}

impl KubeProvisioner {
    /// Create a provisioner for the given namespaces and pod names.
    ///
    /// Every pod name is expected to exist in every namespace.
    pub fn new(
        client: Client,
        namespaces: Vec<String>,
        pods: Vec<String>,
        pod_ip_timeout: Duration,
    ) -> Self {
        Self {
            client,
            namespaces,
            pods,
            pod_ip_timeout,
        }
    }

    async fn pod_ip(&self, namespace: &str, name: &str) -> Result<IpAddr, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get(name).await?;
        let ip = pod
            .status
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::provisioning(format!("pod {}/{} has no IP yet", namespace, name)))?;
        ip.parse().map_err(|e| {
            Error::provisioning(format!(
                "pod {}/{} has unparseable IP '{}': {}",
                namespace, name, ip, e
            ))
        })
    }

    async fn wait_for_pod_ip(&self, namespace: &str, name: &str) -> Result<IpAddr, Error> {
        // Bounded by the outer timeout instead of an attempt count.
        let config = RetryConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            ..RetryConfig::infinite()
        };
        let operation = format!("wait for pod {}/{} IP", namespace, name);
        tokio::time::timeout(
            self.pod_ip_timeout,
            retry_with_backoff(&config, &operation, || self.pod_ip(namespace, name)),
        )
        .await
        .map_err(|_| {
            Error::provisioning(format!(
                "pod {}/{} did not get an IP within {}s",
                namespace,
                name,
                self.pod_ip_timeout.as_secs()
            ))
        })?
    }
}

#[async_trait]
impl ResourceProvisioner for KubeProvisioner {
    async fn list_identities(&self) -> Result<Vec<Identity>, Error> {
        let mut identities = Vec::with_capacity(self.namespaces.len() * self.pods.len());
        for namespace in &self.namespaces {
            for pod in &self.pods {
                let ip = self.wait_for_pod_ip(namespace, pod).await?;
                debug!(namespace = %namespace, pod = %pod, ip = %ip, "resolved pod IP");
                identities.push(Identity::new(namespace.clone(), pod.clone(), ip));
            }
        }
        Ok(identities)
    }

    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<(), Error> {
        let (namespace, name) = policy_key(policy)?;
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);

        let mut manifest = policy.clone();
        manifest.metadata.resource_version = None;
        manifest.metadata.managed_fields = None;

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&manifest),
        )
        .await?;
        info!(namespace = %namespace, name = %name, "applied network policy");
        Ok(())
    }

    async fn delete_policy(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        info!(namespace = %namespace, name = %name, "deleted network policy");
        Ok(())
    }

    async fn read_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn relabel_resource(&self, resource: &ResourceRef, labels: &Labels) -> Result<(), Error> {
        // Replace rather than merge so labels absent from `labels` are removed.
        match resource {
            ResourceRef::Namespace(name) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                let mut ns = api.get(name).await?;
                ns.metadata.labels = Some(labels.clone());
                api.replace(name, &PostParams::default(), &ns).await?;
            }
            ResourceRef::Pod(pod) => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
                let mut current = api.get(&pod.name).await?;
                current.metadata.labels = Some(labels.clone());
                api.replace(&pod.name, &PostParams::default(), &current)
                    .await?;
            }
        }
        info!(resource = %resource, labels = ?labels, "relabelled resource");
        Ok(())
    }

    async fn read_labels(&self, resource: &ResourceRef) -> Result<Labels, Error> {
        let labels = match resource {
            ResourceRef::Namespace(name) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.get(name).await?.metadata.labels
            }
            ResourceRef::Pod(pod) => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
                api.get(&pod.name).await?.metadata.labels
            }
        };
        Ok(labels.unwrap_or_default())
    }

    async fn clear_policies(&self) -> Result<Vec<String>, Error> {
        let mut deleted = Vec::new();
        for namespace in &self.namespaces {
            let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
            let policies = api.list(&ListParams::default()).await?;
            for policy in policies.items {
                let Some(name) = policy.metadata.name else {
                    continue;
                };
                api.delete(&name, &DeleteParams::default()).await?;
                deleted.push(format!("{}/{}", namespace, name));
            }
        }
        if !deleted.is_empty() {
            info!(count = deleted.len(), "cleared network policies");
        }
        Ok(deleted)
    }
}
