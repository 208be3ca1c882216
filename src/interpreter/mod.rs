//! Test-case interpreter
//!
//! Drives each [`Step`] of a [`TestCase`] through a fixed state machine:
//!
//! ```text
//! Idle -> Resetting -> Perturbing -> Settling -> Verifying -> Probing -> Diffing -> Done
//! ```
//!
//! `Resetting` only happens before the first step and only when enabled;
//! `Verifying` only when enabled. Any collaborator error moves the step to
//! `Failed` and the remaining steps of the case are skipped, since later
//! steps assume the cluster state earlier ones left behind. Cancellation is
//! checked at every transition and is the only error that escapes a case.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::InterpreterConfig;
use crate::inventory::Inventory;
use crate::perturbation::{Perturber, Step};
use crate::probe::{ProbeExecutor, ProbeRunner};
use crate::provisioner::ResourceProvisioner;
use crate::report::{Reporter, RunSummary};
use crate::scheduler::BatchScheduler;
use crate::truthtable::{diff, Diff, ObservedTable, TruthTable};
use crate::{Error, Result};

/// State of one step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepPhase {
    /// Not started
    #[default]
    Idle,
    /// Clearing policies and restoring labels
    Resetting,
    /// Applying the step's actions
    Perturbing,
    /// Waiting for enforcement to converge
    Settling,
    /// Reading state back from the cluster
    Verifying,
    /// Running connectivity probes
    Probing,
    /// Comparing observed against expected
    Diffing,
    /// Step finished with a result
    Done,
    /// Step aborted by a collaborator error
    Failed,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Perturbing => write!(f, "Perturbing"),
            Self::Settling => write!(f, "Settling"),
            Self::Verifying => write!(f, "Verifying"),
            Self::Probing => write!(f, "Probing"),
            Self::Diffing => write!(f, "Diffing"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// An ordered sequence of steps executed against one cluster state history
#[derive(Clone, Debug, PartialEq)]
pub struct TestCase {
    /// Human-readable description
    pub description: String,
    /// Tags assigned by the generator; never inspected here
    pub tags: BTreeSet<String>,
    /// Steps, executed in order
    pub steps: Vec<Step>,
}

impl TestCase {
    /// Create an untagged test case
    pub fn new(description: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            description: description.into(),
            tags: BTreeSet::new(),
            steps,
        }
    }

    /// Attach tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Outcome of one completed step
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    /// Zero-based step index
    pub index: usize,
    /// Step description, if any
    pub description: Option<String>,
    /// What probing observed
    pub observed: ObservedTable,
    /// Observed compared against expected
    pub diff: Diff,
    /// Phases visited, in order
    pub phases: Vec<StepPhase>,
}

/// Why a test case stopped early
#[derive(Debug)]
pub struct StepFailure {
    /// Zero-based index of the failed step
    pub step: usize,
    /// Phase the step was in when it failed
    pub phase: StepPhase,
    /// The collaborator error
    pub error: Error,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} failed while {}: {}", self.step, self.phase, self.error)
    }
}

/// Overall outcome of a test case
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every step's diff was empty
    Passed,
    /// No mismatch, but some cells were indeterminate
    PassedWithWarnings,
    /// At least one step found a mismatch
    Failed,
    /// A step hit a provisioning or verification error
    Errored,
}

impl Verdict {
    /// Whether the verdict counts as success for the run
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed | Self::PassedWithWarnings)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::PassedWithWarnings => write!(f, "passed with warnings"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Everything produced by one test case
#[derive(Debug)]
pub struct TestCaseResult {
    /// Test case description
    pub description: String,
    /// Test case tags
    pub tags: BTreeSet<String>,
    /// Results of the steps that completed
    pub steps: Vec<StepResult>,
    /// Terminal error, if a step failed
    pub failure: Option<StepFailure>,
    /// Wall-clock time spent on the case
    pub elapsed: Duration,
}

impl TestCaseResult {
    fn new(case: &TestCase) -> Self {
        Self {
            description: case.description.clone(),
            tags: case.tags.clone(),
            steps: Vec::with_capacity(case.steps.len()),
            failure: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Derive the verdict; an error outranks a mismatch, which outranks a warning
    pub fn verdict(&self) -> Verdict {
        if self.failure.is_some() {
            Verdict::Errored
        } else if self.steps.iter().any(|s| !s.diff.is_clean()) {
            Verdict::Failed
        } else if self.steps.iter().any(|s| s.diff.has_warnings()) {
            Verdict::PassedWithWarnings
        } else {
            Verdict::Passed
        }
    }
}

/// Records phase transitions of a single step
struct PhaseTracker<'a> {
    step: usize,
    current: StepPhase,
    visited: Vec<StepPhase>,
    cancel: &'a CancellationToken,
}

impl<'a> PhaseTracker<'a> {
    fn new(step: usize, cancel: &'a CancellationToken) -> Self {
        Self {
            step,
            current: StepPhase::Idle,
            visited: vec![StepPhase::Idle],
            cancel,
        }
    }

    fn enter(&mut self, next: StepPhase) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(step = self.step, phase = %self.current, "cancelled at transition");
            return Err(Error::Cancelled);
        }
        debug!(step = self.step, from = %self.current, to = %next, "step transition");
        self.current = next;
        self.visited.push(next);
        Ok(())
    }

    fn fail(self, error: Error) -> StepFailure {
        debug!(step = self.step, from = %self.current, to = %StepPhase::Failed, "step transition");
        StepFailure {
            step: self.step,
            phase: self.current,
            error,
        }
    }
}

/// Executes test cases against a provisioner and probe executor
pub struct Interpreter {
    perturber: Perturber,
    runner: ProbeRunner,
    scheduler: BatchScheduler,
    inventory: Inventory,
    config: InterpreterConfig,
    cancel: CancellationToken,
}

impl Interpreter {
    /// Build an interpreter; fails if the configuration is invalid
    pub fn new(
        provisioner: Arc<dyn ResourceProvisioner>,
        executor: Arc<dyn ProbeExecutor>,
        inventory: Inventory,
        config: InterpreterConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            perturber: Perturber::new(provisioner, config.settle_duration()),
            runner: ProbeRunner::new(executor, config.probe_retries),
            scheduler: BatchScheduler::from_config(&config),
            inventory,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Observe `cancel` at every transition, between batches and during settle waits
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Inventory under test
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Execute every test case in order, reporting each result as it completes.
    ///
    /// Only cancellation aborts the run; every other failure is recorded in
    /// the affected case's result.
    #[instrument(skip_all)]
    pub async fn run<I>(&self, cases: I, reporter: &mut dyn Reporter) -> Result<RunSummary>
    where
        I: IntoIterator<Item = TestCase>,
    {
        let mut summary = RunSummary::default();
        for (index, case) in cases.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let result = self.execute_test_case(&case).await?;
            summary.record(result.verdict());
            reporter.report(index, &result);
        }
        info!(%summary, "run complete");
        Ok(summary)
    }

    /// Execute one test case.
    ///
    /// Returns `Err` only when the run is cancelled; collaborator errors end
    /// up in [`TestCaseResult::failure`].
    #[instrument(skip_all, fields(case = %case.description))]
    pub async fn execute_test_case(&self, case: &TestCase) -> Result<TestCaseResult> {
        let started = Instant::now();
        let mut result = TestCaseResult::new(case);
        info!(steps = case.steps.len(), "executing test case");

        if let Err(failure) = self.validate_steps(case) {
            warn!(%failure, "test case rejected");
            result.failure = Some(failure);
            result.elapsed = started.elapsed();
            return Ok(result);
        }

        for (index, step) in case.steps.iter().enumerate() {
            match self.execute_step(index, step).await {
                Ok(step_result) => {
                    info!(step = index, diff = %step_result.diff.summary(), "step complete");
                    result.steps.push(step_result);
                }
                Err(failure) if failure.error.is_fatal_to_run() => return Err(failure.error),
                Err(failure) => {
                    warn!(
                        step = failure.step,
                        phase = %failure.phase,
                        error = %failure.error,
                        skipped = case.steps.len() - index - 1,
                        "step failed, skipping remaining steps"
                    );
                    result.failure = Some(failure);
                    break;
                }
            }
        }

        result.elapsed = started.elapsed();
        info!(verdict = %result.verdict(), elapsed_ms = result.elapsed.as_millis(), "test case finished");
        Ok(result)
    }

    /// Every expected table must be complete and shaped like the inventory
    fn validate_steps(&self, case: &TestCase) -> std::result::Result<(), StepFailure> {
        let shape: ObservedTable = TruthTable::for_inventory(&self.inventory);
        for (index, step) in case.steps.iter().enumerate() {
            let problem = if !step.expected.same_shape(&shape) {
                Some("expected truth table does not cover the inventory's pods and tuples".to_string())
            } else {
                step.expected
                    .unset_cells()
                    .first()
                    .map(|cell| format!("expected truth table has no value for {}", cell))
            };
            if let Some(problem) = problem {
                return Err(StepFailure {
                    step: index,
                    phase: StepPhase::Idle,
                    error: Error::validation(problem),
                });
            }
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        index: usize,
        step: &Step,
    ) -> std::result::Result<StepResult, StepFailure> {
        let mut tracker = PhaseTracker::new(index, &self.cancel);
        let outcome = self.drive_step(index, step, &mut tracker).await;
        match outcome {
            Ok((observed, diff)) => {
                if let Err(error) = tracker.enter(StepPhase::Done) {
                    return Err(tracker.fail(error));
                }
                Ok(StepResult {
                    index,
                    description: step.description.clone(),
                    observed,
                    diff,
                    phases: tracker.visited,
                })
            }
            Err(error) => Err(tracker.fail(error)),
        }
    }

    async fn drive_step(
        &self,
        index: usize,
        step: &Step,
        tracker: &mut PhaseTracker<'_>,
    ) -> Result<(ObservedTable, Diff)> {
        if index == 0 && self.config.reset_cluster_before_test_case {
            tracker.enter(StepPhase::Resetting)?;
            self.perturber.reset(&self.inventory).await?;
        }

        tracker.enter(StepPhase::Perturbing)?;
        self.perturber.apply(&step.actions).await?;

        tracker.enter(StepPhase::Settling)?;
        self.perturber.settle(&self.cancel).await?;

        if self.config.verify_cluster_state_before_test_case {
            tracker.enter(StepPhase::Verifying)?;
            self.perturber.verify(&step.actions).await?;
        }

        tracker.enter(StepPhase::Probing)?;
        let observed = self
            .scheduler
            .run(&self.runner, &self.inventory, &self.cancel)
            .await?;

        tracker.enter(StepPhase::Diffing)?;
        let diff = diff(&step.expected, &observed, self.config.ignore_loopback)?;
        Ok((observed, diff))
    }
}
