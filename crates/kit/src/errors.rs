//! Error taxonomy and test outcomes.
//!
//! Every failure in the orchestration maps to exactly one variant here, and
//! every variant carries enough context for the harness to report the stage
//! that caused it. Cleanup failures are deliberately second-class: they are
//! logged by the code that encounters them and never overturn a verdict that
//! was already decided.

use std::time::Duration;

use serde::Serialize;

/// The stage of the boot-verification sequence an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Creating a virtual machine from its boot configuration
    Provision,
    /// Bringing the storage-export stack to a discoverable state
    TargetSetup,
    /// Discovery, login, and OS installation onto the exported LUN
    Install,
    /// Netboot of the nested machine and completion detection
    Verify,
    /// Session logout and machine teardown
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Provision => "provision",
            Stage::TargetSetup => "target-setup",
            Stage::Install => "install",
            Stage::Verify => "verify",
            Stage::Cleanup => "cleanup",
        };
        write!(f, "{}", s)
    }
}

/// Failures surfaced by the orchestration stages.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The remote shell transport could not reach the machine at all.
    #[error("transport failure reaching {address}: {detail}")]
    Transport { address: String, detail: String },

    /// Machine provisioning failed before a handle existed.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// A setup step failed at the stage it ran in: target readiness, an
    /// iSCSI discovery/login/device step, or the nested netboot launch.
    #[error("setup failed [{stage}]: {detail}")]
    Setup { stage: Stage, detail: String },

    /// The installer returned a non-zero exit status.
    #[error("installer exited with status {status}: {detail}")]
    Install { status: i32, detail: String },

    /// No completion signal arrived within the verification window.
    #[error("no completion signal within {timeout:?}")]
    VerificationTimeout { timeout: Duration },

    /// Logout or machine destroy failed. Logged, never fatal on its own.
    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

impl TestError {
    /// The stage this error is attributed to when reported to the harness.
    pub fn stage(&self) -> Stage {
        match self {
            TestError::Transport { .. } => Stage::Provision,
            TestError::Provision(_) => Stage::Provision,
            TestError::Setup { stage, .. } => *stage,
            TestError::Install { .. } => Stage::Install,
            TestError::VerificationTimeout { .. } => Stage::Verify,
            TestError::Cleanup(_) => Stage::Cleanup,
        }
    }
}

/// The single result handed to the harness for one scenario invocation.
///
/// A run is pass or fail, never partially passed. `Fail` covers verdicts the
/// system reached correctly (the boot did not complete in time); `Fatal`
/// covers setup faults where no verdict about the boot itself was possible.
#[derive(Debug)]
pub enum TestOutcome {
    Pass,
    Fail { stage: Stage, reason: String },
    Fatal { stage: Stage, error: TestError },
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, TestOutcome::Pass)
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestOutcome::Pass => write!(f, "PASS"),
            TestOutcome::Fail { stage, reason } => write!(f, "FAIL [{}]: {}", stage, reason),
            TestOutcome::Fatal { stage, error } => write!(f, "FATAL [{}]: {}", stage, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_stage_attribution() {
        let e = TestError::Setup {
            stage: Stage::TargetSetup,
            detail: "no portal".into(),
        };
        assert_eq!(e.stage(), Stage::TargetSetup);
        // Setup errors keep the stage they were raised in
        let e = TestError::Setup {
            stage: Stage::Verify,
            detail: "netboot launch exited 125".into(),
        };
        assert_eq!(e.stage(), Stage::Verify);
        let e = TestError::Install {
            status: 1,
            detail: "boom".into(),
        };
        assert_eq!(e.stage(), Stage::Install);
        let e = TestError::VerificationTimeout {
            timeout: Duration::from_secs(1),
        };
        assert_eq!(e.stage(), Stage::Verify);
    }

    #[test]
    fn test_outcome_display() {
        let o = TestOutcome::Fail {
            stage: Stage::Verify,
            reason: "timed out".into(),
        };
        assert_eq!(o.to_string(), "FAIL [verify]: timed out");
        assert!(!o.passed());
        assert!(TestOutcome::Pass.passed());
    }
}
