//! Finite state machine for a deployment run
//!
//! A run walks the stages in a fixed order exactly once. The machine only
//! knows how to move forward one stage at a time or to fail in place, so a
//! stage can never be entered twice.

use serde::{Deserialize, Serialize};

/// Deployment stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dependencies,
    Repositories,
    Environment,
    Certificates,
    Proxy,
    Containers,
    HealthChecks,
}

impl Stage {
    /// All stages in execution order
    pub const ORDER: [Stage; 7] = [
        Stage::Dependencies,
        Stage::Repositories,
        Stage::Environment,
        Stage::Certificates,
        Stage::Proxy,
        Stage::Containers,
        Stage::HealthChecks,
    ];

    /// The stage that follows this one, if any
    pub fn next(self) -> Option<Stage> {
        let index = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(index + 1).copied()
    }

    /// Human readable stage title
    pub fn title(self) -> &'static str {
        match self {
            Stage::Dependencies => "Installing dependencies",
            Stage::Repositories => "Synchronizing repositories",
            Stage::Environment => "Loading environment",
            Stage::Certificates => "Provisioning certificates",
            Stage::Proxy => "Configuring proxy",
            Stage::Containers => "Starting containers",
            Stage::HealthChecks => "Checking service health",
        }
    }
}

/// Deployment state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Nothing has run yet
    Pending,

    /// A stage is executing
    InProgress(Stage),

    /// Every stage finished without a fatal outcome
    Succeeded,

    /// The given stage failed and the run stopped
    Failed(Stage),
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Enter the first stage
    Start,

    /// The current stage finished; move to the next one
    Advance,

    /// The current stage failed fatally
    Fail(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Pending,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The stage currently executing
    pub fn current_stage(&self) -> Option<Stage> {
        match self.state {
            DeploymentState::InProgress(stage) => Some(stage),
            _ => None,
        }
    }

    /// Whether the run has reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            DeploymentState::Succeeded | DeploymentState::Failed(_)
        )
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (DeploymentState::Pending, DeploymentEvent::Start) => {
                DeploymentState::InProgress(Stage::ORDER[0])
            }

            (DeploymentState::InProgress(stage), DeploymentEvent::Advance) => match stage.next() {
                Some(next) => DeploymentState::InProgress(next),
                None => DeploymentState::Succeeded,
            },
            (DeploymentState::InProgress(stage), DeploymentEvent::Fail(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed(*stage)
            }

            // A fatal error before the first stage is pinned to it
            (DeploymentState::Pending, DeploymentEvent::Fail(err)) => {
                self.error = Some(err.clone());
                DeploymentState::Failed(Stage::ORDER[0])
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
