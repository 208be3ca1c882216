//! Resource provisioning collaborator
//!
//! The core never creates namespaces or pods. It reads the identities an
//! external provisioner already created, and mutates only NetworkPolicies
//! and labels. [`ResourceProvisioner`] is the seam: [`KubeProvisioner`] talks
//! to a real cluster, [`crate::mock::InMemoryCluster`] is the deterministic
//! stand-in.

mod cluster;

pub use cluster::KubeProvisioner;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::NetworkPolicy;

#[cfg(test)]
use mockall::automock;

use crate::inventory::{Identity, Labels, ResourceRef};
use crate::Error;

/// Trait abstracting cluster state reads and mutations.
///
/// Implementations must not retry failed mutations; a failure is the test
/// case's terminal error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// List every provisioned pod with its IP
    async fn list_identities(&self) -> Result<Vec<Identity>, Error>;

    /// Create or update a NetworkPolicy (namespace taken from its metadata)
    async fn apply_policy(&self, policy: &NetworkPolicy) -> Result<(), Error>;

    /// Delete a NetworkPolicy
    async fn delete_policy(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read a NetworkPolicy back; `None` if it does not exist
    async fn read_policy(&self, namespace: &str, name: &str)
        -> Result<Option<NetworkPolicy>, Error>;

    /// Replace the full label set of a namespace or pod
    async fn relabel_resource(&self, resource: &ResourceRef, labels: &Labels)
        -> Result<(), Error>;

    /// Read the current label set of a namespace or pod
    async fn read_labels(&self, resource: &ResourceRef) -> Result<Labels, Error>;

    /// Delete every NetworkPolicy in the namespaces under test.
    ///
    /// Returns the `namespace/name` of each deleted policy.
    async fn clear_policies(&self) -> Result<Vec<String>, Error>;
}

/// Namespace and name of a policy, or a validation error if either is missing
pub fn policy_key(policy: &NetworkPolicy) -> Result<(String, String), Error> {
    let namespace = policy
        .metadata
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::validation("network policy has no metadata.namespace"))?;
    let name = policy
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::validation("network policy has no metadata.name"))?;
    Ok((namespace, name))
}
