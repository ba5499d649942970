//! Operator confirmation

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::errors::DeployError;

/// Asks the operator to acknowledge a step before the run continues
#[async_trait]
pub trait Confirm: Send + Sync {
    /// Show `message` and block until the operator answers.
    /// Returns `false` when the operator declines.
    async fn confirm(&self, message: &str) -> Result<bool, DeployError>;
}

/// Reads the answer from standard input
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, message: &str) -> Result<bool, DeployError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(message.as_bytes()).await?;
        stdout.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            // stdin closed, nobody is there to confirm
            return Ok(false);
        }
        Ok(is_affirmative(&line))
    }
}

/// Empty input (just Enter) counts as yes
pub fn is_affirmative(answer: &str) -> bool {
    !matches!(answer.trim().to_lowercase().as_str(), "n" | "no")
}
