//! Probe scheduling
//!
//! The full cross product of (source, destination, tuple) is turned into
//! [`ProbeJob`]s, one per observed-table slot. In batched mode the jobs are
//! partitioned into fixed-size batches; every probe of a batch runs on its
//! own task and the next batch starts only once every probe of the
//! previous one has resolved. Serial mode issues one probe at a time.
//!
//! Each job owns exactly one slot, so results are written back by the
//! scheduler as tasks join and no cell is ever contended.

use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InterpreterConfig;
use crate::inventory::{Identity, Inventory, PortProtocol};
use crate::probe::ProbeRunner;
use crate::truthtable::{ObservedTable, ProbeOutcome, TruthTable};
use crate::{Error, Result};

/// One probe to run and the table slot it fills
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeJob {
    /// Observed-table slot index
    pub slot: usize,
    /// Probing pod
    pub source: Identity,
    /// Probed pod
    pub destination: Identity,
    /// Port/protocol
    pub tuple: PortProtocol,
}

/// How probes are issued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleMode {
    /// One probe at a time
    Serial,
    /// Concurrent batches of at most this many probes
    Batched(usize),
}

/// Drives a [`ProbeRunner`] over every cell of the inventory
#[derive(Clone, Debug)]
pub struct BatchScheduler {
    mode: ScheduleMode,
}

impl BatchScheduler {
    /// Probe one at a time
    pub fn serial() -> Self {
        Self {
            mode: ScheduleMode::Serial,
        }
    }

    /// Probe in concurrent batches of `size`; a zero size is treated as one
    pub fn batched(size: usize) -> Self {
        Self {
            mode: ScheduleMode::Batched(size.max(1)),
        }
    }

    /// Mode selected by the interpreter config
    pub fn from_config(config: &InterpreterConfig) -> Self {
        if config.batch_jobs {
            Self::batched(config.batch_size)
        } else {
            Self::serial()
        }
    }

    /// Scheduling mode
    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// One job per slot of `table`, in slot order
    pub fn jobs(inventory: &Inventory, table: &ObservedTable) -> Vec<ProbeJob> {
        table
            .keys()
            .filter_map(|(slot, key)| {
                match (inventory.identity(&key.source), inventory.identity(&key.destination)) {
                    (Some(source), Some(destination)) => Some(ProbeJob {
                        slot,
                        source: source.clone(),
                        destination: destination.clone(),
                        tuple: key.tuple,
                    }),
                    _ => {
                        warn!(cell = %key, "cell references a pod outside the inventory");
                        None
                    }
                }
            })
            .collect()
    }

    /// Partition jobs according to the mode
    pub fn partition<'a>(&self, jobs: &'a [ProbeJob]) -> Vec<&'a [ProbeJob]> {
        let size = match self.mode {
            ScheduleMode::Serial => 1,
            ScheduleMode::Batched(size) => size,
        };
        jobs.chunks(size).collect()
    }

    /// Probe every cell and return the populated observed table.
    ///
    /// Cancellation is checked before each batch; a cancelled run discards
    /// everything probed so far.
    pub async fn run(
        &self,
        runner: &ProbeRunner,
        inventory: &Inventory,
        cancel: &CancellationToken,
    ) -> Result<ObservedTable> {
        let mut table: ObservedTable = TruthTable::for_inventory(inventory);
        let jobs = Self::jobs(inventory, &table);
        let batches = self.partition(&jobs);
        let started = Instant::now();

        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(batch = index, "probing cancelled");
                return Err(Error::Cancelled);
            }

            let mut tasks = JoinSet::new();
            for job in batch.iter().cloned() {
                let runner = runner.clone();
                tasks.spawn(async move {
                    let outcome = runner.probe(&job.source, &job.destination, job.tuple).await;
                    (job.slot, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (slot, outcome): (usize, ProbeOutcome) =
                    joined.map_err(|e| Error::probe(format!("probe task failed: {}", e)))?;
                table.set_at(slot, outcome);
            }
            debug!(batch = index, size = batch.len(), "probe batch complete");
        }

        info!(
            probes = jobs.len(),
            batches = batches.len(),
            mode = ?self.mode,
            elapsed_ms = started.elapsed().as_millis(),
            counts = %table.counts(),
            "probing complete"
        );
        Ok(table)
    }
}
