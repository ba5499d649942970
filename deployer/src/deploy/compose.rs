//! Container orchestration through docker compose

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::infra::command::{Cmd, CommandRunner};

/// Which compose executable the host provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeFlavor {
    /// `docker compose` (CLI plugin)
    Plugin,

    /// Legacy `docker-compose` binary
    Standalone,
}

/// Observed state of one service container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotBuilt,
    BuiltNotRunning,
    RunningHealthy,
    RunningUnhealthy,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::RunningHealthy | ServiceState::RunningUnhealthy)
    }
}

/// A service container as reported by `compose ps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
}

/// Parse the table printed by `docker compose ps -a` or `docker-compose ps -a`
pub fn parse_ps(output: &str) -> Vec<ServiceStatus> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(|line| {
            let name = line.split_whitespace().next()?;
            if name.eq_ignore_ascii_case("name") {
                return None;
            }

            let status = status_tokens(line);
            let running = status
                .iter()
                .any(|token| *token == "Up" || *token == "running" || token.starts_with("running("));
            let state = if !running {
                ServiceState::BuiltNotRunning
            } else if status.iter().any(|token| *token == "(unhealthy)") {
                ServiceState::RunningUnhealthy
            } else {
                ServiceState::RunningHealthy
            };

            Some(ServiceStatus {
                name: name.to_string(),
                state,
            })
        })
        .collect()
}

/// Tokens of a `ps` row after the container name, with quoted text removed
fn status_tokens(line: &str) -> Vec<&str> {
    line.split('"')
        .step_by(2)
        .flat_map(str::split_whitespace)
        .skip(1)
        .collect()
}

/// Whether a container name belongs to `service` in `project`
///
/// Compose names containers `<project>-<service>-<n>` (plugin) or
/// `<project>_<service>_<n>` (standalone).
fn container_of(container: &str, project: &str, service: &str) -> bool {
    ['-', '_'].iter().any(|sep| {
        container
            .strip_prefix(&format!("{project}{sep}{service}{sep}"))
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Add a [`ServiceState::NotBuilt`] entry for every declared service without a container
pub fn merge_declared(
    mut observed: Vec<ServiceStatus>,
    declared: &[String],
    project: &str,
) -> Vec<ServiceStatus> {
    for service in declared {
        let has_container = observed
            .iter()
            .any(|status| status.name == *service || container_of(&status.name, project, service));
        if !has_container {
            observed.push(ServiceStatus {
                name: service.clone(),
                state: ServiceState::NotBuilt,
            });
        }
    }
    observed
}

/// Rebuild when forced or when no image from a previous build exists
pub fn needs_rebuild(force: bool, image_exists: bool) -> bool {
    force || !image_exists
}

/// Prefer the compose plugin, fall back to the standalone binary
pub async fn detect_flavor(runner: &dyn CommandRunner) -> Result<ComposeFlavor, DeployError> {
    if runner.probe(&Cmd::new("docker").args(["compose", "version"])).await {
        return Ok(ComposeFlavor::Plugin);
    }
    if runner.probe(&Cmd::new("docker-compose").arg("--version")).await {
        return Ok(ComposeFlavor::Standalone);
    }
    Err(DeployError::ContainerError(
        "neither `docker compose` nor `docker-compose` is available".to_string(),
    ))
}

/// Whether the engine must be driven with elevated privileges
pub async fn detect_privilege(runner: &dyn CommandRunner) -> Result<bool, DeployError> {
    if runner.probe(&Cmd::new("docker").arg("info")).await {
        return Ok(false);
    }
    if runner.probe(&Cmd::new("docker").arg("info").elevated()).await {
        return Ok(true);
    }
    Err(DeployError::ContainerError(
        "cannot reach the docker engine, with or without elevated privileges".to_string(),
    ))
}

/// A compose project bound to a flavor and privilege mode
#[derive(Debug, Clone)]
pub struct ComposeCli {
    flavor: ComposeFlavor,
    elevated: bool,
    project_dir: PathBuf,
    project: String,
    envs: Vec<(String, String)>,
}

impl ComposeCli {
    pub fn new(
        flavor: ComposeFlavor,
        elevated: bool,
        project_dir: impl Into<PathBuf>,
        project: impl Into<String>,
        envs: Vec<(String, String)>,
    ) -> Self {
        Self {
            flavor,
            elevated,
            project_dir: project_dir.into(),
            project: project.into(),
            envs,
        }
    }

    /// Detect flavor and privilege mode for this host
    pub async fn detect(
        runner: &dyn CommandRunner,
        project_dir: impl Into<PathBuf>,
        project: impl Into<String>,
        envs: Vec<(String, String)>,
    ) -> Result<Self, DeployError> {
        let flavor = detect_flavor(runner).await?;
        let elevated = detect_privilege(runner).await?;
        info!("Using {:?} compose (elevated: {})", flavor, elevated);
        Ok(Self::new(flavor, elevated, project_dir, project, envs))
    }

    fn privileged(&self, cmd: Cmd) -> Cmd {
        if self.elevated {
            cmd.elevated()
        } else {
            cmd
        }
    }

    /// A compose command for this project
    pub fn command<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = match self.flavor {
            ComposeFlavor::Plugin => Cmd::new("docker").arg("compose"),
            ComposeFlavor::Standalone => Cmd::new("docker-compose"),
        };
        self.privileged(
            cmd.args(["-p", self.project.as_str()])
                .args(args)
                .current_dir(&self.project_dir)
                .envs(self.envs.iter().cloned()),
        )
    }

    /// Whether an image from a previous build of this project exists
    pub async fn image_exists(&self, runner: &dyn CommandRunner) -> Result<bool, DeployError> {
        let cmd = self.privileged(
            Cmd::new("docker")
                .args(["images", "-q"])
                .arg("--filter")
                .arg(format!("reference={}-*", self.project))
                .arg("--filter")
                .arg(format!("reference={}_*", self.project)),
        );
        let output = runner
            .run_checked(&cmd)
            .await
            .map_err(|e| DeployError::ContainerError(format!("Failed to list images: {}", e)))?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn build(&self, runner: &dyn CommandRunner) -> Result<(), DeployError> {
        runner
            .run_checked(&self.command(["build"]).interactive())
            .await
            .map_err(|e| DeployError::ContainerError(format!("Build failed: {}", e)))?;
        Ok(())
    }

    pub async fn up(&self, runner: &dyn CommandRunner) -> Result<(), DeployError> {
        runner
            .run_checked(&self.command(["up", "-d"]).interactive())
            .await
            .map_err(|e| DeployError::ContainerError(format!("Failed to start services: {}", e)))?;
        Ok(())
    }

    pub async fn service_states(
        &self,
        runner: &dyn CommandRunner,
    ) -> Result<Vec<ServiceStatus>, DeployError> {
        let output = runner
            .run_checked(&self.command(["ps", "-a"]))
            .await
            .map_err(|e| DeployError::ContainerError(format!("Failed to list services: {}", e)))?;
        let declared = self.declared_services(runner).await?;
        Ok(merge_declared(parse_ps(&output.stdout), &declared, &self.project))
    }

    /// Service names declared in the compose file
    pub async fn declared_services(
        &self,
        runner: &dyn CommandRunner,
    ) -> Result<Vec<String>, DeployError> {
        let output = runner
            .run_checked(&self.command(["config", "--services"]))
            .await
            .map_err(|e| DeployError::ContainerError(format!("Failed to read compose file: {}", e)))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Build if needed, start every service, wait, and check that something runs
pub async fn start_services(
    runner: &dyn CommandRunner,
    compose: &ComposeCli,
    force_rebuild: bool,
    settle: Duration,
) -> Result<Vec<Outcome>, DeployError> {
    let mut outcomes = Vec::new();

    let image_exists = compose.image_exists(runner).await?;
    if needs_rebuild(force_rebuild, image_exists) {
        let reason = if force_rebuild { "forced" } else { "no previous image" };
        info!("Building images ({})...", reason);
        compose.build(runner).await?;
        outcomes.push(Outcome::ok(format!("images built ({})", reason)));
    } else {
        debug!("Images already built, skipping build");
        outcomes.push(Outcome::skipped("images already built"));
    }

    info!("Starting services...");
    compose.up(runner).await?;

    if !settle.is_zero() {
        info!("Waiting {:?} for services to settle", settle);
        tokio::time::sleep(settle).await;
    }

    let services = compose.service_states(runner).await?;
    let running = services.iter().filter(|s| s.state.is_running()).count();
    if running == 0 {
        return Err(DeployError::ContainerError(
            "no service reports a running state".to_string(),
        ));
    }

    for service in &services {
        match service.state {
            ServiceState::RunningUnhealthy => {
                warn!("{} is running but unhealthy", service.name);
                outcomes.push(Outcome::warning(format!("{} is unhealthy", service.name)));
            }
            ServiceState::BuiltNotRunning => {
                warn!("{} is not running", service.name);
                outcomes.push(Outcome::warning(format!("{} is not running", service.name)));
            }
            ServiceState::NotBuilt => {
                warn!("{} has no container", service.name);
                outcomes.push(Outcome::warning(format!("{} was never created", service.name)));
            }
            ServiceState::RunningHealthy => {}
        }
    }
    outcomes.push(Outcome::ok(format!(
        "{}/{} services running",
        running,
        services.len()
    )));

    Ok(outcomes)
}
