//! Application configuration options

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::certs::CertOptions;
use crate::deploy::git::{RepoSpec, SyncAction};
use crate::deploy::proxy::ProxyOptions;
use crate::errors::DeployError;
use crate::installer::tools::Tool;
use crate::storage::layout::StorageLayout;

/// Main application options
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Deployment tree
    pub layout: StorageLayout,

    /// Reverse proxy paths
    pub proxy: ProxyOptions,

    /// Certificate store and renewal job
    pub certs: CertOptions,

    /// Release metadata used for OS detection
    pub os_release_file: PathBuf,

    /// Tools that must be callable before anything else runs
    pub tools: Vec<Tool>,

    /// Delay between starting services and checking their state
    pub settle_interval: Duration,

    /// Per-request timeout of the health probes
    pub health_timeout: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            proxy: ProxyOptions::default(),
            certs: CertOptions::default(),
            os_release_file: PathBuf::from("/etc/os-release"),
            tools: Tool::REQUIRED.to_vec(),
            settle_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
        }
    }
}

impl DeployOptions {
    /// Defaults adjusted by `STACKUP_BASE_DIR` and `STACKUP_SETTLE_SECS`
    pub fn from_env() -> Result<Self, DeployError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DeployError> {
        let mut options = Self::default();

        if let Some(base_dir) = lookup("STACKUP_BASE_DIR").filter(|v| !v.trim().is_empty()) {
            options.layout = StorageLayout::new(base_dir.trim());
        }
        if let Some(secs) = lookup("STACKUP_SETTLE_SECS").filter(|v| !v.trim().is_empty()) {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                DeployError::ConfigError(format!("STACKUP_SETTLE_SECS '{}' is not a number", secs))
            })?;
            options.settle_interval = Duration::from_secs(secs);
        }

        Ok(options)
    }
}

/// Repository and rebuild settings taken from the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub frontend_repo_url: Option<String>,
    pub frontend_branch: Option<String>,
    pub backend_repo_url: Option<String>,
    pub backend_branch: Option<String>,
    pub repo_action: Option<String>,
    pub force_rebuild: bool,
}

const DEFAULT_BRANCH: &str = "main";

impl Overrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            frontend_repo_url: get("FRONTEND_REPO_URL"),
            frontend_branch: get("FRONTEND_BRANCH"),
            backend_repo_url: get("BACKEND_REPO_URL"),
            backend_branch: get("BACKEND_BRANCH"),
            repo_action: get("REPO_ACTION"),
            force_rebuild: get("FORCE_REBUILD").map(|v| is_truthy(&v)).unwrap_or(false),
        }
    }

    /// Fill unset repository keys from an existing `.env`. Process values win.
    pub fn or_values(mut self, values: &BTreeMap<String, String>) -> Self {
        let pick = |current: &mut Option<String>, key: &str| {
            if current.is_none() {
                *current = values.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
            }
        };
        pick(&mut self.frontend_repo_url, "FRONTEND_REPO_URL");
        pick(&mut self.frontend_branch, "FRONTEND_BRANCH");
        pick(&mut self.backend_repo_url, "BACKEND_REPO_URL");
        pick(&mut self.backend_branch, "BACKEND_BRANCH");
        pick(&mut self.repo_action, "REPO_ACTION");
        if !self.force_rebuild {
            self.force_rebuild = values.get("FORCE_REBUILD").map(|v| is_truthy(v)).unwrap_or(false);
        }
        self
    }

    /// Sync mode, `pull` when unset
    pub fn sync_action(&self) -> Result<SyncAction, DeployError> {
        match &self.repo_action {
            Some(action) => action.parse().map_err(DeployError::ConfigError),
            None => Ok(SyncAction::default()),
        }
    }

    /// Frontend and backend repositories under the layout
    pub fn repositories(&self, layout: &StorageLayout) -> Result<Vec<RepoSpec>, DeployError> {
        let url = |value: &Option<String>, key: &str| {
            value.clone().ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "{} is not set in the environment or in {}",
                    key,
                    layout.env_file().path().display()
                ))
            })
        };
        let branch = |value: &Option<String>| value.clone().unwrap_or_else(|| DEFAULT_BRANCH.to_string());

        Ok(vec![
            RepoSpec {
                name: "frontend".to_string(),
                url: url(&self.frontend_repo_url, "FRONTEND_REPO_URL")?,
                branch: branch(&self.frontend_branch),
                dir: layout.frontend_dir().path().to_path_buf(),
            },
            RepoSpec {
                name: "backend".to_string(),
                url: url(&self.backend_repo_url, "BACKEND_REPO_URL")?,
                branch: branch(&self.backend_branch),
                dir: layout.backend_dir().path().to_path_buf(),
            },
        ])
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
