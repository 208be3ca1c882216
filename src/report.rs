//! Result reporting
//!
//! The interpreter hands each finalized [`TestCaseResult`] to a [`Reporter`]
//! as soon as the case completes and keeps nothing afterwards. The run as a
//! whole is summarized in a [`RunSummary`], which also decides the process
//! exit status.

use std::fmt;

use tracing::{error, info, warn};

use crate::interpreter::{TestCaseResult, Verdict};

/// Receives test case results in completion order
pub trait Reporter: Send {
    /// Called once per test case, `index` counting from zero
    fn report(&mut self, index: usize, result: &TestCaseResult);
}

/// Reports through `tracing`; with `noisy` every grid is logged, otherwise
/// only grids of steps that found something
#[derive(Clone, Debug, Default)]
pub struct LogReporter {
    noisy: bool,
}

impl LogReporter {
    /// Create a reporter
    pub fn new(noisy: bool) -> Self {
        Self { noisy }
    }
}

impl Reporter for LogReporter {
    fn report(&mut self, index: usize, result: &TestCaseResult) {
        let verdict = result.verdict();
        let tags = result.tags.iter().cloned().collect::<Vec<_>>().join(",");

        for step in &result.steps {
            if self.noisy {
                info!(
                    case = index,
                    step = step.index,
                    "observed reachability:\n{}",
                    step.observed.render()
                );
            }
            if self.noisy || !step.diff.is_clean() || step.diff.has_warnings() {
                info!(
                    case = index,
                    step = step.index,
                    summary = %step.diff.summary(),
                    "comparison (. agree, X mismatch, ? indeterminate, - ignored):\n{}",
                    step.diff.render()
                );
            }
            for mismatch in &step.diff.mismatches {
                warn!(case = index, step = step.index, "mismatch: {}", mismatch);
            }
            for warning in &step.diff.warnings {
                warn!(case = index, step = step.index, "indeterminate: {}", warning);
            }
        }

        match verdict {
            Verdict::Passed | Verdict::PassedWithWarnings => info!(
                case = index,
                description = %result.description,
                tags = %tags,
                %verdict,
                elapsed_ms = result.elapsed.as_millis(),
                "test case finished"
            ),
            Verdict::Failed => warn!(
                case = index,
                description = %result.description,
                tags = %tags,
                %verdict,
                elapsed_ms = result.elapsed.as_millis(),
                "test case finished"
            ),
            Verdict::Errored => error!(
                case = index,
                description = %result.description,
                tags = %tags,
                %verdict,
                failure = %result
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                "test case finished"
            ),
        }
    }
}

/// Verdict counts across a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Cases with clean diffs
    pub passed: usize,
    /// Cases with no mismatch but some indeterminate cells
    pub passed_with_warnings: usize,
    /// Cases with at least one mismatch
    pub failed: usize,
    /// Cases ended by a provisioning or verification error
    pub errored: usize,
}

impl RunSummary {
    /// Count one verdict
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Passed => self.passed += 1,
            Verdict::PassedWithWarnings => self.passed_with_warnings += 1,
            Verdict::Failed => self.failed += 1,
            Verdict::Errored => self.errored += 1,
        }
    }

    /// Number of cases recorded
    pub fn total(&self) -> usize {
        self.passed + self.passed_with_warnings + self.failed + self.errored
    }

    /// No mismatches and no errors
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    /// Process exit status for the run
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} test cases: {} passed, {} passed with warnings, {} failed, {} errored",
            self.total(),
            self.passed,
            self.passed_with_warnings,
            self.failed,
            self.errored
        )
    }
}
