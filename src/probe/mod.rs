//! Connectivity probes
//!
//! [`ProbeExecutor`] performs one raw connection attempt. [`ProbeRunner`]
//! layers the retry policy on top and resolves each probe to a
//! [`ProbeOutcome`]:
//!
//! - `Ok(true)` from the executor: Reachable
//! - `Ok(false)` (refused / timed out): Unreachable, never retried
//! - `Err(_)` (exec or transport failure): retried immediately, up to the
//!   configured retry count, then Indeterminate

mod exec;

pub use exec::{classify_connect_output, KubeProbeExecutor};

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::inventory::{Identity, PortProtocol, Protocol};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::truthtable::ProbeOutcome;
use crate::Error;

/// Trait abstracting a single connection attempt from inside a pod.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Attempt to connect from `source` to `destination:port` over `protocol`.
    ///
    /// Returns `Ok(false)` when the connection was definitively refused or
    /// timed out, and `Err` when the attempt itself could not be carried out.
    async fn execute(
        &self,
        source: &Identity,
        destination: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool, Error>;
}

/// Resolves probes to outcomes with a bounded number of retries
#[derive(Clone)]
pub struct ProbeRunner {
    executor: Arc<dyn ProbeExecutor>,
    retry: RetryConfig,
}

impl ProbeRunner {
    /// Create a runner making at most `retries + 1` attempts per probe
    pub fn new(executor: Arc<dyn ProbeExecutor>, retries: u32) -> Self {
        Self {
            executor,
            retry: RetryConfig::immediate(retries),
        }
    }

    /// Probe `destination` from `source` on `tuple`.
    ///
    /// Never fails: exhausting retries yields [`ProbeOutcome::Indeterminate`].
    pub async fn probe(
        &self,
        source: &Identity,
        destination: &Identity,
        tuple: PortProtocol,
    ) -> ProbeOutcome {
        let operation = format!("probe {} -> {} {}", source.pod, destination.pod, tuple);
        let result = retry_with_backoff(&self.retry, &operation, || {
            self.executor
                .execute(source, destination.ip, tuple.port, tuple.protocol)
        })
        .await;

        match result {
            Ok(connected) => {
                trace!(operation = %operation, connected, "probe resolved");
                ProbeOutcome::from(connected)
            }
            Err(e) => {
                warn!(
                    operation = %operation,
                    attempts = self.retry.max_attempts,
                    error = %e,
                    "probe retries exhausted, marking cell indeterminate"
                );
                ProbeOutcome::Indeterminate
            }
        }
    }
}
