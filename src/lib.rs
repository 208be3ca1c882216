//! Netcheck - validates Kubernetes network-policy enforcement
//!
//! Netcheck compares what a set of NetworkPolicies should allow against what
//! the cluster actually allows. Each test case mutates cluster state, waits
//! for enforcement to converge, probes every (source pod, destination pod,
//! port, protocol) combination, and diffs the observed reachability matrix
//! against the expected one.
//!
//! # Architecture
//!
//! The interpreter owns no cluster state. It talks to the cluster through two
//! collaborator traits, each with a real and a deterministic implementation:
//! - [`provisioner::ResourceProvisioner`] reads identities and mutates
//!   policies and labels
//! - [`probe::ProbeExecutor`] performs one raw connection attempt
//!
//! # Modules
//!
//! - [`inventory`] - Identities and port/protocol tuples under test
//! - [`truthtable`] - Reachability matrices, diffing and rendering
//! - [`probe`] - Probe execution and retry
//! - [`provisioner`] - Cluster state reads and mutations
//! - [`perturbation`] - Step actions, settle wait, read-back verification
//! - [`scheduler`] - Serial and batched probe scheduling
//! - [`interpreter`] - Per-step state machine and test case results
//! - [`report`] - Result reporting and run summary
//! - [`testcase`] - YAML test case source
//! - [`mock`] - In-memory backend
//! - [`config`] - Interpreter and inventory configuration
//! - [`retry`] - Retry with backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod interpreter;
pub mod inventory;
pub mod mock;
pub mod perturbation;
pub mod probe;
pub mod provisioner;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod testcase;
pub mod truthtable;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Extra probe attempts after an execution failure
pub const DEFAULT_PROBE_RETRIES: u32 = 1;

/// Seconds to wait after a perturbation before probing
pub const DEFAULT_PERTURBATION_WAIT_SECONDS: u64 = 5;

/// Seconds to wait for every test pod to get an IP
pub const DEFAULT_POD_CREATION_TIMEOUT_SECONDS: u64 = 60;

/// Probes issued concurrently per batch in batch mode
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// In-pod timeout for a single `agnhost connect` attempt
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u32 = 1;
