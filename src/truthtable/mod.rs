//! Reachability truth tables
//!
//! A [`TruthTable`] is a square matrix over an ordered set of pods, with one
//! layer per port/protocol tuple. Storage is pre-allocated for every cell so
//! each (source, destination, tuple) has a fixed slot that exactly one probe
//! writes. Two instantiations are used:
//!
//! - [`ExpectedTable`] (`bool`): what the policy set should allow
//! - [`ObservedTable`] ([`ProbeOutcome`]): what the probes measured
//!
//! [`diff`] compares the two into a [`Diff`], the run's defect signal.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::inventory::{Inventory, PodRef, PortProtocol};
use crate::{Error, Result};

/// Result of probing one cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeOutcome {
    /// The connection succeeded
    Reachable,
    /// The connection was refused or timed out
    Unreachable,
    /// Every attempt failed for reasons unrelated to policy
    Indeterminate,
}

impl From<bool> for ProbeOutcome {
    fn from(connected: bool) -> Self {
        if connected {
            Self::Reachable
        } else {
            Self::Unreachable
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reachable => write!(f, "Reachable"),
            Self::Unreachable => write!(f, "Unreachable"),
            Self::Indeterminate => write!(f, "Indeterminate"),
        }
    }
}

/// Single-character rendering of a cell value
pub trait CellGlyph {
    /// Glyph for this value
    fn glyph(&self) -> char;
}

impl CellGlyph for bool {
    fn glyph(&self) -> char {
        if *self {
            '.'
        } else {
            'X'
        }
    }
}

impl CellGlyph for ProbeOutcome {
    fn glyph(&self) -> char {
        match self {
            Self::Reachable => '.',
            Self::Unreachable => 'X',
            Self::Indeterminate => '?',
        }
    }
}

/// What a write did to a cell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellWrite {
    /// The cell was unset and now holds the value
    Inserted,
    /// The cell already held the same value
    Unchanged,
    /// The cell held a different value, which was replaced
    Overwritten,
}

/// Address of a single cell
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    /// Probing pod
    pub source: PodRef,
    /// Probed pod
    pub destination: PodRef,
    /// Port/protocol probed
    pub tuple: PortProtocol,
}

impl CellKey {
    /// Whether source and destination are the same pod
    pub fn is_loopback(&self) -> bool {
        self.source == self.destination
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} {}", self.source, self.destination, self.tuple)
    }
}

/// Square reachability matrix over a fixed pod ordering and tuple set
#[derive(Clone, Debug, PartialEq)]
pub struct TruthTable<T> {
    pods: Vec<PodRef>,
    tuples: Vec<PortProtocol>,
    pod_index: HashMap<PodRef, usize>,
    tuple_index: HashMap<PortProtocol, usize>,
    cells: Vec<Option<T>>,
}

/// Expected reachability, derived from policy semantics
pub type ExpectedTable = TruthTable<bool>;

/// Observed reachability, populated by probing
pub type ObservedTable = TruthTable<ProbeOutcome>;

impl<T: Clone + PartialEq> TruthTable<T> {
    /// Create a table with every cell unset.
    ///
    /// Pod order is preserved as given; it drives rendering order.
    pub fn new(pods: Vec<PodRef>, tuples: Vec<PortProtocol>) -> Result<Self> {
        let mut pod_index = HashMap::with_capacity(pods.len());
        for (i, pod) in pods.iter().enumerate() {
            if pod_index.insert(pod.clone(), i).is_some() {
                return Err(Error::validation(format!(
                    "duplicate pod {} in truth table",
                    pod
                )));
            }
        }
        let mut tuple_index = HashMap::with_capacity(tuples.len());
        for (i, tuple) in tuples.iter().enumerate() {
            if tuple_index.insert(*tuple, i).is_some() {
                return Err(Error::validation(format!(
                    "duplicate port/protocol {} in truth table",
                    tuple
                )));
            }
        }

        let len = pods.len() * pods.len() * tuples.len();
        Ok(Self {
            pods,
            tuples,
            pod_index,
            tuple_index,
            cells: vec![None; len],
        })
    }

    /// Create an unset table shaped like the inventory
    pub fn for_inventory(inventory: &Inventory) -> Self {
        // Inventory construction already rejects duplicate pods and tuples.
        let pods = inventory.pods();
        let tuples = inventory.tuples().to_vec();
        Self {
            pod_index: pods.iter().cloned().enumerate().map(|(i, p)| (p, i)).collect(),
            tuple_index: tuples.iter().enumerate().map(|(i, t)| (*t, i)).collect(),
            cells: vec![None; pods.len() * pods.len() * tuples.len()],
            pods,
            tuples,
        }
    }

    /// Create a table with every cell set to `value`
    pub fn filled(pods: Vec<PodRef>, tuples: Vec<PortProtocol>, value: T) -> Result<Self> {
        let mut table = Self::new(pods, tuples)?;
        table.cells.iter_mut().for_each(|c| *c = Some(value.clone()));
        Ok(table)
    }

    /// Pods in table order
    pub fn pods(&self) -> &[PodRef] {
        &self.pods
    }

    /// Port/protocol tuples
    pub fn tuples(&self) -> &[PortProtocol] {
        &self.tuples
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the table has no cells
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether two tables address the same cells in the same order
    pub fn same_shape<U>(&self, other: &TruthTable<U>) -> bool {
        self.pods == other.pods && self.tuples == other.tuples
    }

    /// Flat slot index of a cell
    pub fn index_of(
        &self,
        source: &PodRef,
        destination: &PodRef,
        tuple: &PortProtocol,
    ) -> Option<usize> {
        let s = *self.pod_index.get(source)?;
        let d = *self.pod_index.get(destination)?;
        let t = *self.tuple_index.get(tuple)?;
        Some(self.slot(s, d, t))
    }

    fn slot(&self, s: usize, d: usize, t: usize) -> usize {
        (s * self.pods.len() + d) * self.tuples.len() + t
    }

    fn key_at(&self, idx: usize) -> CellKey {
        let t = idx % self.tuples.len();
        let sd = idx / self.tuples.len();
        CellKey {
            source: self.pods[sd / self.pods.len()].clone(),
            destination: self.pods[sd % self.pods.len()].clone(),
            tuple: self.tuples[t],
        }
    }

    /// Read a cell; `None` if it is unset or not addressable
    pub fn get(&self, source: &PodRef, destination: &PodRef, tuple: &PortProtocol) -> Option<&T> {
        self.index_of(source, destination, tuple)
            .and_then(|idx| self.cells[idx].as_ref())
    }

    /// Write a cell, last write wins
    pub fn set(
        &mut self,
        source: &PodRef,
        destination: &PodRef,
        tuple: &PortProtocol,
        value: T,
    ) -> Result<CellWrite> {
        let idx = self.index_of(source, destination, tuple).ok_or_else(|| {
            Error::validation(format!(
                "cell {} -> {} {} is not in the truth table",
                source, destination, tuple
            ))
        })?;
        Ok(self.set_at(idx, value))
    }

    /// Write a cell by slot index
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a slot of this table.
    pub fn set_at(&mut self, idx: usize, value: T) -> CellWrite {
        let cell = &mut self.cells[idx];
        let write = match cell {
            None => CellWrite::Inserted,
            Some(existing) if *existing == value => CellWrite::Unchanged,
            Some(_) => CellWrite::Overwritten,
        };
        if write != CellWrite::Unchanged {
            *cell = Some(value);
        }
        write
    }

    /// Every addressable cell key, in slot order
    pub fn keys(&self) -> impl Iterator<Item = (usize, CellKey)> + '_ {
        (0..self.cells.len()).map(|idx| (idx, self.key_at(idx)))
    }

    /// Whether every cell has been written
    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    /// Keys of cells that were never written
    pub fn unset_cells(&self) -> Vec<CellKey> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(idx, _)| self.key_at(idx))
            .collect()
    }
}

impl<T: Clone + PartialEq + CellGlyph> TruthTable<T> {
    /// Render one grid per tuple, rows are sources and columns destinations.
    ///
    /// Output depends only on pod/tuple ordering and cell values, so the same
    /// table always renders byte-for-byte identically. Unset cells render as
    /// a blank.
    pub fn render(&self) -> String {
        let width = self
            .pods
            .iter()
            .map(|p| p.to_string().len())
            .max()
            .unwrap_or(0)
            + 1;

        let mut out = String::new();
        for (t, tuple) in self.tuples.iter().enumerate() {
            let _ = writeln!(out, "{}", tuple);
            let _ = write!(out, "{:width$}", "", width = width);
            for pod in &self.pods {
                let _ = write!(out, "{:<width$}", pod.to_string(), width = width);
            }
            out.truncate(out.trim_end().len());
            out.push('\n');

            for (s, source) in self.pods.iter().enumerate() {
                let _ = write!(out, "{:<width$}", source.to_string(), width = width);
                for d in 0..self.pods.len() {
                    let glyph = self.cells[self.slot(s, d, t)]
                        .as_ref()
                        .map(CellGlyph::glyph)
                        .unwrap_or(' ');
                    let _ = write!(out, "{:<width$}", glyph, width = width);
                }
                out.truncate(out.trim_end().len());
                out.push('\n');
            }
        }
        out
    }
}

/// Per-outcome cell counts of an observed table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Reachable cells
    pub reachable: usize,
    /// Unreachable cells
    pub unreachable: usize,
    /// Indeterminate cells
    pub indeterminate: usize,
    /// Unset cells
    pub unset: usize,
}

impl ObservedTable {
    /// Count cells by outcome
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for cell in &self.cells {
            match cell {
                Some(ProbeOutcome::Reachable) => counts.reachable += 1,
                Some(ProbeOutcome::Unreachable) => counts.unreachable += 1,
                Some(ProbeOutcome::Indeterminate) => counts.indeterminate += 1,
                None => counts.unset += 1,
            }
        }
        counts
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reachable, {} unreachable, {} indeterminate",
            self.reachable, self.unreachable, self.indeterminate
        )?;
        if self.unset > 0 {
            write!(f, ", {} unset", self.unset)?;
        }
        Ok(())
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Comparison result for one cell
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellVerdict {
    /// Observed matches expected
    Agree,
    /// Observed contradicts expected
    Mismatch,
    /// Observation inconclusive; reported as a warning
    Indeterminate,
    /// Loopback cell excluded from comparison
    Ignored,
}

impl CellGlyph for CellVerdict {
    fn glyph(&self) -> char {
        match self {
            Self::Agree => '.',
            Self::Mismatch => 'X',
            Self::Indeterminate => '?',
            Self::Ignored => '-',
        }
    }
}

/// One disagreeing or inconclusive cell
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDiff {
    /// Cell address
    #[serde(flatten)]
    pub key: CellKey,
    /// Expected reachability
    pub expected: bool,
    /// Observed outcome
    pub observed: ProbeOutcome,
}

impl fmt::Display for CellDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {}",
            self.key,
            if self.expected { "Reachable" } else { "Unreachable" },
            self.observed
        )
    }
}

/// Sparse comparison of an expected and an observed table
#[derive(Clone, Debug, PartialEq)]
pub struct Diff {
    /// Cells where a definitive observation contradicts the expectation
    pub mismatches: Vec<CellDiff>,
    /// Cells that could not be observed definitively
    pub warnings: Vec<CellDiff>,
    /// Number of loopback cells excluded from comparison
    pub ignored: usize,
    /// Number of cells compared
    pub compared: usize,
    grid: TruthTable<CellVerdict>,
}

impl Diff {
    /// No definitive mismatch; warnings do not count
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Whether any cell was inconclusive
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Per-cell verdicts, shaped like the compared tables
    pub fn verdicts(&self) -> &TruthTable<CellVerdict> {
        &self.grid
    }

    /// Render the verdict grid
    pub fn render(&self) -> String {
        self.grid.render()
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        format!(
            "{} compared, {} mismatched, {} indeterminate, {} ignored",
            self.compared,
            self.mismatches.len(),
            self.warnings.len(),
            self.ignored
        )
    }
}

/// Compare expected against observed.
///
/// Both tables must have the same shape and `expected` must be complete.
/// An unset observed cell counts as indeterminate. With `ignore_loopback`,
/// cells whose source and destination are the same pod are excluded.
pub fn diff(
    expected: &ExpectedTable,
    observed: &ObservedTable,
    ignore_loopback: bool,
) -> Result<Diff> {
    if !expected.same_shape(observed) {
        return Err(Error::validation(
            "expected and observed truth tables have different pods or tuples",
        ));
    }
    if let Some(missing) = expected.unset_cells().first() {
        return Err(Error::validation(format!(
            "expected truth table has no value for {}",
            missing
        )));
    }

    let mut grid = TruthTable::<CellVerdict>::new(expected.pods.clone(), expected.tuples.clone())?;
    let mut mismatches = Vec::new();
    let mut warnings = Vec::new();
    let mut ignored = 0;
    let mut compared = 0;

    for (idx, key) in expected.keys() {
        if ignore_loopback && key.is_loopback() {
            grid.set_at(idx, CellVerdict::Ignored);
            ignored += 1;
            continue;
        }

        // Completeness was checked above.
        let want = expected.cells[idx].unwrap_or_default();
        let got = observed.cells[idx].unwrap_or(ProbeOutcome::Indeterminate);
        compared += 1;

        let verdict = match got {
            ProbeOutcome::Indeterminate => CellVerdict::Indeterminate,
            outcome if ProbeOutcome::from(want) == outcome => CellVerdict::Agree,
            _ => CellVerdict::Mismatch,
        };
        grid.set_at(idx, verdict);

        let entry = || CellDiff {
            key: key.clone(),
            expected: want,
            observed: got,
        };
        match verdict {
            CellVerdict::Mismatch => mismatches.push(entry()),
            CellVerdict::Indeterminate => warnings.push(entry()),
            _ => {}
        }
    }

    Ok(Diff {
        mismatches,
        warnings,
        ignored,
        compared,
        grid,
    })
}
