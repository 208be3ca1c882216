//! Error types for netcheck

use thiserror::Error;

/// Main error type for netcheck operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The provisioning collaborator failed to apply or read cluster state
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// Cluster state read back after a perturbation differs from what was applied
    #[error("verification error: {0}")]
    Verification(String),

    /// Invalid configuration, inventory or test case
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single probe execution attempt failed for a reason unrelated to policy
    #[error("probe error: {0}")]
    Probe(String),

    /// The run was cancelled by the caller
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Create a provisioning error with the given message
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a verification error with the given message
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a probe error with the given message
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Whether this error must stop the whole run rather than a single test case.
    ///
    /// Only caller-issued cancellation escapes the test-case boundary.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation During a Run
    // ==========================================================================

    /// Story: a rejected NetworkPolicy surfaces as a provisioning error
    ///
    /// The API server (or an admission webhook) refuses the object. The test
    /// case is aborted but the run continues with the next case.
    #[test]
    fn story_provisioning_error_is_scoped_to_test_case() {
        let err = Error::provisioning("admission webhook denied networkpolicy x/deny-all");
        assert!(err.to_string().contains("provisioning error"));
        assert!(err.to_string().contains("x/deny-all"));
        assert!(!err.is_fatal_to_run());
    }

    /// Story: a mutating webhook rewrote the policy we applied
    #[test]
    fn story_verification_mismatch_is_scoped_to_test_case() {
        let err = Error::verification("policy y/allow-80 spec differs from applied spec");
        assert!(err.to_string().contains("verification error"));
        assert!(!err.is_fatal_to_run());

        match Error::verification("any") {
            Error::Verification(msg) => assert_eq!(msg, "any"),
            _ => panic!("Expected Verification variant"),
        }
    }

    /// Story: the user presses Ctrl-C in the middle of a long settle wait
    #[test]
    fn story_cancellation_stops_the_run() {
        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "run cancelled");
        assert!(err.is_fatal_to_run());
    }

    /// Story: error helpers accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let pod = "x/a";
        let err = Error::probe(format!("exec into {} failed: stream closed", pod));
        assert!(err.to_string().contains("x/a"));

        let err = Error::validation("batch size must be greater than zero");
        assert!(err.to_string().contains("validation error"));

        let err = Error::serialization(String::from("bad yaml"));
        assert!(err.to_string().contains("bad yaml"));
    }
}
