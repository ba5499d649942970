//! External tools the deployment depends on

use std::fmt;

use serde::Serialize;

use crate::infra::command::{Cmd, CommandRunner};

/// A command-line tool that must be callable on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Git,
    Docker,
    Compose,
    Nginx,
    Certbot,
    OpenSsl,
}

impl Tool {
    /// Every tool a full deployment needs, in install order
    pub const REQUIRED: [Tool; 6] = [
        Tool::Git,
        Tool::Docker,
        Tool::Compose,
        Tool::Nginx,
        Tool::Certbot,
        Tool::OpenSsl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Git => "git",
            Tool::Docker => "docker",
            Tool::Compose => "docker compose",
            Tool::Nginx => "nginx",
            Tool::Certbot => "certbot",
            Tool::OpenSsl => "openssl",
        }
    }

    /// Version queries; the tool is present when any of them succeeds
    pub fn version_queries(&self) -> Vec<Cmd> {
        match self {
            Tool::Git => vec![Cmd::new("git").arg("--version")],
            Tool::Docker => vec![Cmd::new("docker").arg("--version")],
            Tool::Compose => vec![
                Cmd::new("docker").args(["compose", "version"]),
                Cmd::new("docker-compose").arg("--version"),
            ],
            Tool::Nginx => vec![Cmd::new("nginx").arg("-v")],
            Tool::Certbot => vec![Cmd::new("certbot").arg("--version")],
            Tool::OpenSsl => vec![Cmd::new("openssl").arg("version")],
        }
    }

    /// Check whether the tool is callable
    pub async fn is_present(&self, runner: &dyn CommandRunner) -> bool {
        for query in self.version_queries() {
            if runner.probe(&query).await {
                return true;
            }
        }
        false
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
