//! Severity-tagged step results

use serde::{Deserialize, Serialize};

/// How a single finding affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Work was done and succeeded
    Ok,

    /// Nothing to do; the host already satisfies the step
    Skipped,

    /// Something failed but the run continues
    Warning,

    /// The run stops here
    Fatal,
}

/// One finding reported by a deployment step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub severity: Severity,
    pub message: String,
}

impl Outcome {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Severity::Ok, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::new(Severity::Skipped, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}
