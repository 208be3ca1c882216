//! Resource inventory: the pods, ports and protocols under test
//!
//! The inventory is a read-only snapshot taken once per run, after the
//! external provisioner has created every namespace and pod. It fixes the
//! identity ordering used by every truth table in the run and remembers the
//! original namespace/pod labels so the cluster can be reset between test
//! cases.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provisioner::ResourceProvisioner;
use crate::{Error, Result};

/// Kubernetes label set
pub type Labels = BTreeMap<String, String>;

/// Transport protocol a server container listens on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP
    #[serde(rename = "UDP")]
    Udp,
    /// SCTP
    #[serde(rename = "SCTP")]
    Sctp,
}

impl Protocol {
    /// All protocols, in canonical order
    pub const ALL: [Protocol; 3] = [Protocol::Tcp, Protocol::Udp, Protocol::Sctp];

    /// Protocol name as used in Kubernetes objects
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "SCTP" => Ok(Self::Sctp),
            other => Err(Error::validation(format!(
                "unknown protocol '{}': expected one of TCP, UDP, SCTP",
                other
            ))),
        }
    }
}

/// One configured (port, protocol) combination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortProtocol {
    /// Server port
    pub port: u16,
    /// Server protocol
    pub protocol: Protocol,
}

impl PortProtocol {
    /// Create a port/protocol tuple
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (port, protocol) = s
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("expected <port>/<protocol>, got '{}'", s)))?;
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::validation(format!("invalid port in '{}': {}", s, e)))?;
        Ok(Self::new(port, protocol.trim().parse()?))
    }
}

impl TryFrom<String> for PortProtocol {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortProtocol> for String {
    fn from(value: PortProtocol) -> Self {
        value.to_string()
    }
}

/// A pod addressed by namespace and name, rendered as `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodRef {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodRef {
    /// Create a pod reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::validation(format!(
                "expected <namespace>/<pod>, got '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for PodRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PodRef> for String {
    fn from(value: PodRef) -> Self {
        value.to_string()
    }
}

/// A provisioned pod with its resolved IP; immutable for the run
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Namespace and pod name
    pub pod: PodRef,
    /// Pod IP
    pub ip: IpAddr,
}

impl Identity {
    /// Create an identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            pod: PodRef::new(namespace, name),
            ip,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pod, self.ip)
    }
}

/// A labelled cluster object a perturbation can target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceRef {
    /// A namespace, by name
    Namespace(String),
    /// A pod
    Pod(PodRef),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(ns) => write!(f, "namespace {}", ns),
            Self::Pod(pod) => write!(f, "pod {}", pod),
        }
    }
}

/// Read-only snapshot of everything probed during a run
#[derive(Clone, Debug, PartialEq)]
pub struct Inventory {
    identities: Vec<Identity>,
    tuples: Vec<PortProtocol>,
    original_labels: BTreeMap<ResourceRef, Labels>,
}

impl Inventory {
    /// Build an inventory from identities and port/protocol tuples.
    ///
    /// Identities are sorted by `namespace/name` so that every table in the
    /// run shares one deterministic ordering.
    pub fn new(mut identities: Vec<Identity>, tuples: Vec<PortProtocol>) -> Result<Self> {
        if identities.is_empty() {
            return Err(Error::validation("inventory has no identities"));
        }
        if tuples.is_empty() {
            return Err(Error::validation("inventory has no port/protocol tuples"));
        }

        identities.sort_by(|a, b| a.pod.cmp(&b.pod));
        if let Some(dup) = identities.windows(2).find(|w| w[0].pod == w[1].pod) {
            return Err(Error::validation(format!(
                "duplicate identity {} in inventory",
                dup[0].pod
            )));
        }

        let mut seen = BTreeSet::new();
        let tuples: Vec<PortProtocol> = tuples.into_iter().filter(|t| seen.insert(*t)).collect();

        Ok(Self {
            identities,
            tuples,
            original_labels: BTreeMap::new(),
        })
    }

    /// Attach the labels each namespace/pod had when the snapshot was taken
    pub fn with_original_labels(mut self, labels: BTreeMap<ResourceRef, Labels>) -> Self {
        self.original_labels = labels;
        self
    }

    /// Snapshot the cluster through a provisioner.
    ///
    /// Lists identities, then reads back the current labels of every
    /// namespace and pod so a reset can restore them later.
    pub async fn snapshot(
        provisioner: &dyn ResourceProvisioner,
        tuples: Vec<PortProtocol>,
    ) -> Result<Self> {
        let identities = provisioner.list_identities().await?;
        let inventory = Self::new(identities, tuples)?;

        let mut labels = BTreeMap::new();
        for resource in inventory.labelled_resources() {
            let current = provisioner.read_labels(&resource).await?;
            debug!(resource = %resource, labels = ?current, "captured original labels");
            labels.insert(resource, current);
        }

        Ok(inventory.with_original_labels(labels))
    }

    /// Identities in table order
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Pod references in table order
    pub fn pods(&self) -> Vec<PodRef> {
        self.identities.iter().map(|i| i.pod.clone()).collect()
    }

    /// Port/protocol tuples under test
    pub fn tuples(&self) -> &[PortProtocol] {
        &self.tuples
    }

    /// Look up the identity of a pod
    pub fn identity(&self, pod: &PodRef) -> Option<&Identity> {
        self.identities
            .binary_search_by(|i| i.pod.cmp(pod))
            .ok()
            .map(|idx| &self.identities[idx])
    }

    /// Distinct namespaces, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .identities
            .iter()
            .map(|i| i.pod.namespace.as_str())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    /// Every namespace and pod that carries labels relevant to policy selection
    pub fn labelled_resources(&self) -> Vec<ResourceRef> {
        self.namespaces()
            .into_iter()
            .map(ResourceRef::Namespace)
            .chain(self.identities.iter().map(|i| ResourceRef::Pod(i.pod.clone())))
            .collect()
    }

    /// Labels captured when the snapshot was taken
    pub fn original_labels(&self) -> &BTreeMap<ResourceRef, Labels> {
        &self.original_labels
    }
}
