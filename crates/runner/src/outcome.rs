//! Classified results of running an invocation.

use serde::{Deserialize, Serialize};

/// Diagnostic reported in place of stderr when a stage is killed for
/// running past its deadline.
pub const TIME_EXPIRED: &str = "Time expired!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Outcome {
    /// Every stage exited with status 0. Streams are those of the last stage.
    Success { stdout: String, stderr: String },
    /// A stage exited nonzero, died from a signal, or could not be launched.
    /// `exit_code` is `None` for the latter two.
    Failure {
        stage: usize,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        skipped_stages: usize,
    },
    /// A stage was still running at its deadline and was killed.
    Timeout { stage: usize, skipped_stages: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ToolInvocationFailure,
    PipelineAbort,
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { skipped_stages, .. } if *skipped_stages > 0 => {
                Some(FailureKind::PipelineAbort)
            }
            Outcome::Failure { .. } => Some(FailureKind::ToolInvocationFailure),
            Outcome::Timeout { .. } => Some(FailureKind::Timeout),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Outcome::Success { .. } => Some(0),
            Outcome::Failure { exit_code, .. } => *exit_code,
            Outcome::Timeout { .. } => None,
        }
    }

    /// Text shown ahead of a failure line; `None` on success.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { stderr, .. } => Some(stderr.as_str()),
            Outcome::Timeout { .. } => Some(TIME_EXPIRED),
        }
    }

    pub fn stdout(&self) -> &str {
        match self {
            Outcome::Success { stdout, .. } | Outcome::Failure { stdout, .. } => stdout,
            Outcome::Timeout { .. } => "",
        }
    }
}
