//! Probe executor that execs agnhost inside the source pod
//!
//! Each server pod runs one container per port/protocol, named
//! `cont-<port>-<protocol>`, from the agnhost image. A probe execs
//! `agnhost connect` in the source pod's container for the probed tuple and
//! interprets the exit status: success means connected, a `REFUSED` or
//! `TIMEOUT` report means blocked, anything else is an execution failure.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::ProbeExecutor;
use crate::inventory::{Identity, Protocol};
use crate::Error;

const AGNHOST_BINARY: &str = "/agnhost";

/// Executes probes through the Kubernetes exec subresource
pub struct KubeProbeExecutor {
    client: Client,
    connect_timeout_seconds: u32,
}

impl KubeProbeExecutor {
    /// Create an executor; `connect_timeout_seconds` bounds each attempt in-pod
    pub fn new(client: Client, connect_timeout_seconds: u32) -> Self {
        Self {
            client,
            connect_timeout_seconds: connect_timeout_seconds.max(1),
        }
    }

    /// Container serving `port`/`protocol` in every test pod
    pub fn container_name(port: u16, protocol: Protocol) -> String {
        format!("cont-{}-{}", port, protocol.as_str().to_ascii_lowercase())
    }

    fn command(&self, destination: IpAddr, port: u16, protocol: Protocol) -> Vec<String> {
        vec![
            AGNHOST_BINARY.to_string(),
            "connect".to_string(),
            SocketAddr::new(destination, port).to_string(),
            format!("--timeout={}s", self.connect_timeout_seconds),
            format!("--protocol={}", protocol.as_str().to_ascii_lowercase()),
        ]
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        // A truncated stream still leaves whatever was read for classification.
        let _ = reader.read_to_string(&mut out).await;
    }
    out
}

/// Interpret the result of an `agnhost connect` exec.
///
/// Returns `Ok(true)` on a successful exit, `Ok(false)` when agnhost reports
/// the connection as refused or timed out, and `Err` for anything else
/// (DNS failures, missing container, exec errors).
pub fn classify_connect_output(
    status: Option<&Status>,
    stdout: &str,
    stderr: &str,
) -> Result<bool, Error> {
    if status.and_then(|s| s.status.as_deref()) == Some("Success") {
        return Ok(true);
    }

    let combined = format!("{}\n{}", stdout, stderr);
    if combined.contains("REFUSED") || combined.contains("TIMEOUT") {
        return Ok(false);
    }

    let message = status
        .and_then(|s| s.message.clone())
        .unwrap_or_else(|| "no exit status".to_string());
    Err(Error::probe(format!(
        "agnhost connect failed: {} (stdout: {:?}, stderr: {:?})",
        message,
        stdout.trim(),
        stderr.trim()
    )))
}

#[async_trait]
impl ProbeExecutor for KubeProbeExecutor {
    async fn execute(
        &self,
        source: &Identity,
        destination: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &source.pod.namespace);
        let container = Self::container_name(port, protocol);
        let params = AttachParams::default()
            .container(container.clone())
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(&source.pod.name, self.command(destination, port, protocol), &params)
            .await
            .map_err(|e| {
                Error::probe(format!(
                    "exec into {} container {} failed: {}",
                    source.pod, container, e
                ))
            })?;

        let status_future = attached.take_status();
        let (stdout, stderr) = tokio::join!(
            read_all(attached.stdout()),
            read_all(attached.stderr())
        );
        let status = match status_future {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(|e| {
            Error::probe(format!("exec session into {} failed: {}", source.pod, e))
        })?;

        debug!(
            source = %source.pod,
            destination = %destination,
            port,
            protocol = %protocol,
            status = ?status.as_ref().and_then(|s| s.status.clone()),
            "agnhost connect finished"
        );

        classify_connect_output(status.as_ref(), &stdout, &stderr)
    }
}
