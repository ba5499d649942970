//! Error types for the deployment orchestrator

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for stackup
///
/// Every variant is fatal for the run: the driver stops at the first one it
/// receives. Non-fatal conditions travel as [`crate::deploy::outcome::Outcome`]
/// values instead.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Template error: {0}")]
    TemplateError(#[from] tera::Error),

    #[error("Template not found: {}", .0.display())]
    TemplateMissing(PathBuf),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Dependency error: {0}")]
    DependencyError(String),

    #[error("Unsupported operating system: {0}")]
    UnsupportedOs(String),

    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Invalid transition: {0}")]
    TransitionError(String),
}
