//! Run configuration
//!
//! [`InterpreterConfig`] is the immutable value object threaded into the
//! interpreter; [`InventoryConfig`] describes which namespaces, pods, ports
//! and protocols the external provisioner created. Both can be built from
//! CLI flags or loaded from YAML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inventory::{PortProtocol, Protocol};
use crate::{
    Error, Result, DEFAULT_BATCH_SIZE, DEFAULT_PERTURBATION_WAIT_SECONDS,
    DEFAULT_POD_CREATION_TIMEOUT_SECONDS, DEFAULT_PROBE_RETRIES,
};

/// Interpreter settings, fixed for the whole run.
///
/// Retry count and settle duration are unsigned, so the "≥ 0" requirement on
/// both holds by construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterpreterConfig {
    /// Delete all policies and restore original labels before each test case
    pub reset_cluster_before_test_case: bool,
    /// Read cluster state back after each perturbation and compare
    pub verify_cluster_state_before_test_case: bool,
    /// Extra attempts per probe after an execution failure
    pub probe_retries: u32,
    /// Seconds to wait after a perturbation before probing
    pub perturbation_wait_seconds: u64,
    /// Probe in bounded concurrent batches instead of one at a time
    pub batch_jobs: bool,
    /// Exclude source == destination cells from comparison
    pub ignore_loopback: bool,
    /// Probes per batch when `batch_jobs` is set
    pub batch_size: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            reset_cluster_before_test_case: true,
            verify_cluster_state_before_test_case: true,
            probe_retries: DEFAULT_PROBE_RETRIES,
            perturbation_wait_seconds: DEFAULT_PERTURBATION_WAIT_SECONDS,
            batch_jobs: false,
            ignore_loopback: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl InterpreterConfig {
    /// Validate invariants not enforced by the field types
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::validation("batchSize must be greater than zero"));
        }
        Ok(())
    }

    /// Settle wait after each perturbation
    pub fn settle_duration(&self) -> Duration {
        Duration::from_secs(self.perturbation_wait_seconds)
    }

    /// Load and validate a config from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| {
            Error::serialization(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// What the external provisioner created for this run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryConfig {
    /// Namespaces holding test pods
    pub namespaces: Vec<String>,
    /// Pod names, created in every namespace
    pub pods: Vec<String>,
    /// Server ports
    pub ports: Vec<u16>,
    /// Server protocols
    pub protocols: Vec<Protocol>,
    /// How long to wait for every pod to get an IP
    pub pod_creation_timeout_seconds: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            namespaces: vec!["x".to_string(), "y".to_string(), "z".to_string()],
            pods: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ports: vec![80, 81],
            protocols: Protocol::ALL.to_vec(),
            pod_creation_timeout_seconds: DEFAULT_POD_CREATION_TIMEOUT_SECONDS,
        }
    }
}

impl InventoryConfig {
    /// Validate that every list is non-empty
    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(Error::validation("at least one namespace is required"));
        }
        if self.pods.is_empty() {
            return Err(Error::validation("at least one pod is required"));
        }
        if self.ports.is_empty() {
            return Err(Error::validation("at least one server port is required"));
        }
        if self.protocols.is_empty() {
            return Err(Error::validation("at least one server protocol is required"));
        }
        Ok(())
    }

    /// Cross product of ports and protocols, ports outermost
    pub fn tuples(&self) -> Vec<PortProtocol> {
        self.ports
            .iter()
            .flat_map(|port| {
                self.protocols
                    .iter()
                    .map(move |protocol| PortProtocol::new(*port, *protocol))
            })
            .collect()
    }

    /// Pod IP wait bound
    pub fn pod_creation_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_creation_timeout_seconds)
    }
}
