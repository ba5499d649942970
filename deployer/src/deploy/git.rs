//! Repository synchronization
//!
//! Each application source tree is either cloned fresh or updated in place,
//! depending on whether its directory exists and on the configured
//! [`SyncAction`].

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::infra::command::{Cmd, CommandRunner};

/// What to do with a repository directory that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncAction {
    /// Remove the directory and clone again
    Clone,

    /// Fetch and fast-forward in place
    #[default]
    Pull,
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clone" => Ok(SyncAction::Clone),
            "pull" => Ok(SyncAction::Pull),
            _ => Err(format!("Invalid repository action: {} (expected clone or pull)", s)),
        }
    }
}

/// A repository to materialize on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    /// Short name used in logs (e.g. "frontend")
    pub name: String,

    /// Remote URL
    pub url: String,

    /// Branch or tag to check out
    pub branch: String,

    /// Local working tree
    pub dir: PathBuf,
}

fn git(spec: &RepoSpec) -> Cmd {
    Cmd::new("git").current_dir(&spec.dir)
}

async fn clone(runner: &dyn CommandRunner, spec: &RepoSpec) -> Result<(), DeployError> {
    debug!("Cloning {} into {}...", spec.url, spec.dir.display());
    let cmd = Cmd::new("git")
        .args(["clone", "-b", spec.branch.as_str(), spec.url.as_str()])
        .arg(spec.dir.to_string_lossy())
        .interactive();

    runner.run_checked(&cmd).await.map_err(|e| {
        DeployError::RepositoryError(format!("Failed to clone {} ({}): {}", spec.name, spec.url, e))
    })?;
    Ok(())
}

async fn has_ref(runner: &dyn CommandRunner, spec: &RepoSpec, reference: &str) -> bool {
    runner
        .probe(&git(spec).args(["rev-parse", "--verify", "--quiet", reference]))
        .await
}

/// Fetch, check out the configured ref and fast-forward.
///
/// A failed fetch means the remote is unreachable or broken and is fatal.
/// A failed checkout or pull after a good fetch means the working tree has
/// diverged on purpose, which is only worth a warning.
async fn update(runner: &dyn CommandRunner, spec: &RepoSpec) -> Result<Outcome, DeployError> {
    debug!("Fetching {} in {}...", spec.name, spec.dir.display());
    runner
        .run_checked(&git(spec).args(["fetch", "origin", "--tags", "--prune"]))
        .await
        .map_err(|e| {
            DeployError::RepositoryError(format!("Failed to fetch {} from {}: {}", spec.name, spec.url, e))
        })?;

    let branch = spec.branch.as_str();
    let local = format!("refs/heads/{}", branch);
    let remote = format!("refs/remotes/origin/{}", branch);
    let tag = format!("refs/tags/{}", branch);

    let checkout = if has_ref(runner, spec, &local).await {
        git(spec).args(["checkout", branch])
    } else if has_ref(runner, spec, &remote).await {
        git(spec).args(["checkout", "-b", branch, "--track"]).arg(format!("origin/{}", branch))
    } else if has_ref(runner, spec, &tag).await {
        let output = runner.run(&git(spec).args(["checkout", branch])).await?;
        if !output.success {
            return Ok(diverged(spec, "checkout", output.stderr_summary()));
        }
        return Ok(Outcome::ok(format!("{}: checked out tag {}", spec.name, branch)));
    } else {
        return Ok(diverged(spec, "checkout", "ref not found on origin"));
    };

    let output = runner.run(&checkout).await?;
    if !output.success {
        return Ok(diverged(spec, "checkout", output.stderr_summary()));
    }

    let output = runner
        .run(&git(spec).args(["pull", "--ff-only", "origin", branch]))
        .await?;
    if !output.success {
        return Ok(diverged(spec, "pull", output.stderr_summary()));
    }

    Ok(Outcome::ok(format!("{}: updated {}", spec.name, branch)))
}

fn diverged(spec: &RepoSpec, action: &str, detail: &str) -> Outcome {
    warn!("{} of {} failed, keeping the current working tree: {}", action, spec.name, detail);
    Outcome::warning(format!(
        "{}: {} of {} failed ({}); the working tree may be on another branch",
        spec.name, action, spec.branch, detail
    ))
}

/// Sync a git repository (clone or update)
pub async fn sync_repository(
    runner: &dyn CommandRunner,
    spec: &RepoSpec,
    action: SyncAction,
) -> Result<Outcome, DeployError> {
    info!(
        "Syncing Git repository: {} (branch: {}) to {}",
        spec.url,
        spec.branch,
        spec.dir.display()
    );

    let dir = Dir::new(&spec.dir);
    if !dir.exists().await {
        clone(runner, spec).await?;
        return Ok(Outcome::ok(format!("{}: cloned {}", spec.name, spec.branch)));
    }

    match action {
        SyncAction::Clone => {
            debug!("Removing {} before a fresh clone", spec.dir.display());
            dir.delete().await?;
            clone(runner, spec).await?;
            Ok(Outcome::ok(format!("{}: re-cloned {}", spec.name, spec.branch)))
        }
        SyncAction::Pull => update(runner, spec).await,
    }
}

/// Sync every repository, then check that all working trees exist
pub async fn sync_repositories(
    runner: &dyn CommandRunner,
    specs: &[RepoSpec],
    action: SyncAction,
) -> Result<Vec<Outcome>, DeployError> {
    let mut outcomes = Vec::with_capacity(specs.len());
    for spec in specs {
        outcomes.push(sync_repository(runner, spec, action).await?);
    }

    let mut missing = Vec::new();
    for spec in specs {
        if !Dir::new(&spec.dir).exists().await {
            missing.push(spec.dir.display().to_string());
        }
    }
    if !missing.is_empty() {
        return Err(DeployError::RepositoryError(format!(
            "Repository directories missing after sync: {}",
            missing.join(", ")
        )));
    }

    info!("Successfully synced {} repositories", specs.len());
    Ok(outcomes)
}
