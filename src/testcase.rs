//! YAML test-case source
//!
//! Test cases arrive already generated. Each step lists its actions and
//! describes the expected table compactly: a default verdict plus rules
//! that override it for matching (source, destination, tuple) cells. Later
//! rules win.
//!
//! ```yaml
//! testCases:
//!   - description: deny ingress to x
//!     tags: [ingress, deny-all]
//!     steps:
//!       - actions:
//!           - createPolicy:
//!               policy: { ... NetworkPolicy ... }
//!         expected:
//!           default: true
//!           rules:
//!             - from: "*"
//!               to: "x/*"
//!               reachable: false
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::interpreter::TestCase;
use crate::inventory::{Inventory, PodRef, PortProtocol};
use crate::perturbation::{Action, Step};
use crate::truthtable::{ExpectedTable, TruthTable};
use crate::{Error, Result};

/// Matches pods by `*`, `<namespace>/*` or `<namespace>/<pod>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PodSelector {
    /// Every pod
    Any,
    /// Every pod in a namespace
    Namespace(String),
    /// One pod
    Pod(PodRef),
}

impl PodSelector {
    /// Whether `pod` is selected
    pub fn matches(&self, pod: &PodRef) -> bool {
        match self {
            Self::Any => true,
            Self::Namespace(ns) => &pod.namespace == ns,
            Self::Pod(p) => p == pod,
        }
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Namespace(ns) => write!(f, "{}/*", ns),
            Self::Pod(pod) => write!(f, "{}", pod),
        }
    }
}

impl FromStr for PodSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::Any);
        }
        match s.split_once('/') {
            Some((ns, "*")) if !ns.is_empty() => Ok(Self::Namespace(ns.to_string())),
            Some(_) => s.parse().map(Self::Pod),
            None => Err(Error::validation(format!(
                "invalid pod selector {:?}: expected *, <namespace>/* or <namespace>/<pod>",
                s
            ))),
        }
    }
}

impl TryFrom<String> for PodSelector {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PodSelector> for String {
    fn from(value: PodSelector) -> Self {
        value.to_string()
    }
}

/// Override of the default verdict for matching cells
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityRule {
    /// Source pods
    pub from: PodSelector,
    /// Destination pods
    pub to: PodSelector,
    /// Tuples; every tuple when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortProtocol>>,
    /// Verdict for matching cells
    pub reachable: bool,
}

/// Compact description of an expected table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedSpec {
    /// Verdict for cells no rule matches
    pub default: bool,
    /// Overrides, applied in order
    #[serde(default)]
    pub rules: Vec<ReachabilityRule>,
}

impl ExpectedSpec {
    /// Expand into a complete table over the inventory
    pub fn build(&self, inventory: &Inventory) -> Result<ExpectedTable> {
        let pods = inventory.pods();
        let tuples = inventory.tuples().to_vec();
        let mut table = TruthTable::filled(pods.clone(), tuples.clone(), self.default)?;

        for rule in &self.rules {
            check_selector(&rule.from, &pods)?;
            check_selector(&rule.to, &pods)?;
            let rule_tuples = match &rule.ports {
                Some(ports) => {
                    if let Some(unknown) = ports.iter().find(|p| !tuples.contains(p)) {
                        return Err(Error::validation(format!(
                            "rule references {} which is not under test",
                            unknown
                        )));
                    }
                    ports.clone()
                }
                None => tuples.clone(),
            };

            for source in pods.iter().filter(|p| rule.from.matches(p)) {
                for destination in pods.iter().filter(|p| rule.to.matches(p)) {
                    for tuple in &rule_tuples {
                        table.set(source, destination, tuple, rule.reachable)?;
                    }
                }
            }
        }
        Ok(table)
    }
}

fn check_selector(selector: &PodSelector, pods: &[PodRef]) -> Result<()> {
    if pods.iter().any(|p| selector.matches(p)) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "selector {} matches no pod in the inventory",
            selector
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepFile {
    #[serde(default)]
    description: Option<String>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    actions: Vec<Action>,
    expected: ExpectedSpec,
    #[serde(default)]
    tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestCaseFile {
    description: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    steps: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuiteFile {
    test_cases: Vec<TestCaseFile>,
}

/// Parse test cases from YAML, expanding expected tables over `inventory`
pub fn parse_test_cases(yaml: &str, inventory: &Inventory) -> Result<Vec<TestCase>> {
    let suite: SuiteFile = serde_yaml::from_str(yaml)
        .map_err(|e| Error::serialization(format!("invalid test case file: {}", e)))?;

    suite
        .test_cases
        .into_iter()
        .map(|case| {
            if case.steps.is_empty() {
                return Err(Error::validation(format!(
                    "test case {:?} has no steps",
                    case.description
                )));
            }
            let steps = case
                .steps
                .into_iter()
                .enumerate()
                .map(|(i, step)| {
                    let expected = step.expected.build(inventory).map_err(|e| {
                        Error::validation(format!(
                            "test case {:?} step {}: {}",
                            case.description, i, e
                        ))
                    })?;
                    Ok(Step {
                        description: step.description,
                        actions: step.actions,
                        expected,
                        tags: step.tags,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(TestCase {
                description: case.description,
                tags: case.tags,
                steps,
            })
        })
        .collect()
}

/// Load test cases from a YAML file
pub fn load_test_cases(path: &Path, inventory: &Inventory) -> Result<Vec<TestCase>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::validation(format!("failed to read {}: {}", path.display(), e)))?;
    parse_test_cases(&data, inventory)
}

/// Number of test cases carrying each tag, on the case or any of its steps
pub fn count_by_tag(cases: &[TestCase]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for case in cases {
        let tags: BTreeSet<&String> = case
            .tags
            .iter()
            .chain(case.steps.iter().flat_map(|s| s.tags.iter()))
            .collect();
        for tag in tags {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }
    counts
}
