//! Dependency installation
//!
//! Every tool is probed first and only installed when missing, so a second
//! run on a provisioned host issues no installation commands at all.

use std::path::Path;

use tracing::{debug, info};

use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::infra::command::{Cmd, CommandRunner};
use crate::installer::os::{detect_os, host_description, OsFamily};
use crate::installer::tools::Tool;

const DOCKER_CONVENIENCE_SCRIPT: &str = "curl -fsSL https://get.docker.com | sh";

/// OS-specific installation procedure
///
/// Implementations only describe commands; [`ensure_dependencies`] runs them.
pub trait PackageInstaller: Send + Sync {
    /// OS family this installer targets
    fn family(&self) -> OsFamily;

    /// Commands run once, before the first installation of a run
    fn prepare(&self) -> Vec<Cmd> {
        Vec::new()
    }

    /// Commands that make `tool` callable
    fn install_commands(&self, tool: Tool) -> Vec<Cmd>;
}

/// Select the installer for a detected OS family
pub fn installer_for(family: OsFamily) -> Box<dyn PackageInstaller> {
    match family {
        OsFamily::Debian => Box::new(AptInstaller),
        OsFamily::RedHat => Box::new(DnfInstaller),
        OsFamily::Arch => Box::new(PacmanInstaller),
        OsFamily::Alpine => Box::new(ApkInstaller),
        OsFamily::MacOs => Box::new(BrewInstaller),
    }
}

fn root(program: &str, args: &[&str]) -> Cmd {
    Cmd::new(program).args(args.iter().copied()).elevated().interactive()
}

fn docker_script() -> Cmd {
    root("sh", &["-c", DOCKER_CONVENIENCE_SCRIPT])
}

fn systemctl(args: &[&str]) -> Cmd {
    root("systemctl", args)
}

/// Debian, Ubuntu and derivatives
pub struct AptInstaller;

impl AptInstaller {
    fn apt_install(package: &str) -> Cmd {
        root("apt-get", &["install", "-y", package]).envs([("DEBIAN_FRONTEND", "noninteractive")])
    }
}

impl PackageInstaller for AptInstaller {
    fn family(&self) -> OsFamily {
        OsFamily::Debian
    }

    fn prepare(&self) -> Vec<Cmd> {
        vec![root("apt-get", &["update"])]
    }

    fn install_commands(&self, tool: Tool) -> Vec<Cmd> {
        match tool {
            Tool::Git => vec![Self::apt_install("git")],
            Tool::Docker => vec![docker_script(), systemctl(&["enable", "--now", "docker"])],
            Tool::Compose => vec![Self::apt_install("docker-compose-plugin")],
            Tool::Nginx => vec![Self::apt_install("nginx"), systemctl(&["enable", "nginx"])],
            Tool::Certbot => vec![Self::apt_install("certbot")],
            Tool::OpenSsl => vec![Self::apt_install("openssl")],
        }
    }
}

/// RHEL, CentOS, Fedora, Rocky, Alma, Amazon Linux
pub struct DnfInstaller;

impl DnfInstaller {
    fn dnf_install(package: &str) -> Cmd {
        root("dnf", &["install", "-y", package])
    }
}

impl PackageInstaller for DnfInstaller {
    fn family(&self) -> OsFamily {
        OsFamily::RedHat
    }

    fn install_commands(&self, tool: Tool) -> Vec<Cmd> {
        match tool {
            Tool::Git => vec![Self::dnf_install("git")],
            Tool::Docker => vec![docker_script(), systemctl(&["enable", "--now", "docker"])],
            Tool::Compose => vec![Self::dnf_install("docker-compose-plugin")],
            Tool::Nginx => vec![Self::dnf_install("nginx"), systemctl(&["enable", "nginx"])],
            // certbot lives in EPEL outside Fedora
            Tool::Certbot => vec![
                root("sh", &["-c", "dnf install -y epel-release || true"]),
                Self::dnf_install("certbot"),
            ],
            Tool::OpenSsl => vec![Self::dnf_install("openssl")],
        }
    }
}

/// Arch Linux and derivatives
pub struct PacmanInstaller;

impl PacmanInstaller {
    fn pacman_install(package: &str) -> Cmd {
        root("pacman", &["-S", "--noconfirm", "--needed", package])
    }
}

impl PackageInstaller for PacmanInstaller {
    fn family(&self) -> OsFamily {
        OsFamily::Arch
    }

    fn prepare(&self) -> Vec<Cmd> {
        vec![root("pacman", &["-Sy", "--noconfirm"])]
    }

    fn install_commands(&self, tool: Tool) -> Vec<Cmd> {
        match tool {
            Tool::Git => vec![Self::pacman_install("git")],
            Tool::Docker => vec![
                Self::pacman_install("docker"),
                systemctl(&["enable", "--now", "docker"]),
            ],
            Tool::Compose => vec![Self::pacman_install("docker-compose")],
            Tool::Nginx => vec![Self::pacman_install("nginx"), systemctl(&["enable", "nginx"])],
            Tool::Certbot => vec![Self::pacman_install("certbot")],
            Tool::OpenSsl => vec![Self::pacman_install("openssl")],
        }
    }
}

/// Alpine Linux (OpenRC)
pub struct ApkInstaller;

impl ApkInstaller {
    fn apk_add(package: &str) -> Cmd {
        root("apk", &["add", "--no-cache", package])
    }
}

impl PackageInstaller for ApkInstaller {
    fn family(&self) -> OsFamily {
        OsFamily::Alpine
    }

    fn prepare(&self) -> Vec<Cmd> {
        vec![root("apk", &["update"])]
    }

    fn install_commands(&self, tool: Tool) -> Vec<Cmd> {
        match tool {
            Tool::Git => vec![Self::apk_add("git")],
            Tool::Docker => vec![
                Self::apk_add("docker"),
                root("rc-update", &["add", "docker", "default"]),
                root("service", &["docker", "start"]),
            ],
            Tool::Compose => vec![Self::apk_add("docker-cli-compose")],
            Tool::Nginx => vec![
                Self::apk_add("nginx"),
                root("rc-update", &["add", "nginx", "default"]),
            ],
            Tool::Certbot => vec![Self::apk_add("certbot")],
            Tool::OpenSsl => vec![Self::apk_add("openssl")],
        }
    }
}

/// macOS via Homebrew (never elevated)
pub struct BrewInstaller;

impl BrewInstaller {
    fn brew(args: &[&str]) -> Cmd {
        Cmd::new("brew").args(args.iter().copied()).interactive()
    }
}

impl PackageInstaller for BrewInstaller {
    fn family(&self) -> OsFamily {
        OsFamily::MacOs
    }

    fn prepare(&self) -> Vec<Cmd> {
        vec![Self::brew(&["update"])]
    }

    fn install_commands(&self, tool: Tool) -> Vec<Cmd> {
        match tool {
            Tool::Git => vec![Self::brew(&["install", "git"])],
            Tool::Docker => vec![Self::brew(&["install", "--cask", "docker"])],
            Tool::Compose => vec![Self::brew(&["install", "docker-compose"])],
            Tool::Nginx => vec![Self::brew(&["install", "nginx"])],
            Tool::Certbot => vec![Self::brew(&["install", "certbot"])],
            Tool::OpenSsl => vec![Self::brew(&["install", "openssl"])],
        }
    }
}

async fn run_all(runner: &dyn CommandRunner, cmds: Vec<Cmd>, tool: Tool) -> Result<(), DeployError> {
    for cmd in cmds {
        runner.run_checked(&cmd).await.map_err(|e| {
            DeployError::DependencyError(format!("Failed to install {}: {}", tool, e))
        })?;
    }
    Ok(())
}

/// Make every tool in `tools` callable, installing only what is missing.
///
/// The OS is detected lazily, on the first missing tool.
pub async fn ensure_dependencies(
    runner: &dyn CommandRunner,
    tools: &[Tool],
    os_release: &Path,
) -> Result<Vec<Outcome>, DeployError> {
    info!("Checking dependencies on {}", host_description());

    let mut outcomes = Vec::with_capacity(tools.len());
    let mut installer: Option<Box<dyn PackageInstaller>> = None;
    let mut prepared = false;

    for tool in tools.iter().copied() {
        if tool.is_present(runner).await {
            debug!("{} is already installed", tool);
            outcomes.push(Outcome::skipped(format!("{} already installed", tool)));
            continue;
        }

        info!("{} not found, installing...", tool);
        let active = match installer.take() {
            Some(active) => active,
            None => {
                let family = detect_os(runner, os_release).await?;
                info!("Using {:?} installation procedure", family);
                installer_for(family)
            }
        };

        if !prepared {
            run_all(runner, active.prepare(), tool).await?;
            prepared = true;
        }
        run_all(runner, active.install_commands(tool), tool).await?;
        installer = Some(active);

        if !tool.is_present(runner).await {
            return Err(DeployError::DependencyError(format!(
                "{} is still not callable after installation",
                tool
            )));
        }
        info!("Installed {}", tool);
        outcomes.push(Outcome::ok(format!("installed {}", tool)));
    }

    Ok(outcomes)
}
