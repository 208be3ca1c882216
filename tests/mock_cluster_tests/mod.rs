//! Integration tests for the netcheck interpreter
//!
//! # Test Organization
//!
//! Tests are organized by the story they tell:
//!
//! - `reachability`: Stories about probing and comparing truth tables
//!   (agreement, unexpected reachability, flaky probes, loopback cells,
//!   batch scheduling)
//!
//! - `cluster_state`: Stories about perturbing the cluster (resets,
//!   read-back verification, rejected mutations, fail-fast steps,
//!   cancellation)
//!
//! - `test_case_files`: Stories about loading YAML test cases and running
//!   them end to end

mod cluster_state;
mod helpers;
mod reachability;
mod test_case_files;
