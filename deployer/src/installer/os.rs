//! Operating system detection

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::infra::command::{Cmd, CommandRunner};

/// OS families with a supported installation procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    RedHat,
    Arch,
    Alpine,
    MacOs,
}

impl OsFamily {
    /// Map a distribution identifier (os-release `ID`, `lsb_release -si`,
    /// `uname -s`) to a family
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().trim_matches('"').to_lowercase().as_str() {
            "debian" | "ubuntu" | "raspbian" | "linuxmint" | "pop" | "elementary" => {
                Some(OsFamily::Debian)
            }
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "amzn" | "ol" | "redhat"
            | "redhatenterpriseserver" => Some(OsFamily::RedHat),
            "arch" | "manjaro" | "endeavouros" => Some(OsFamily::Arch),
            "alpine" => Some(OsFamily::Alpine),
            "darwin" | "macos" => Some(OsFamily::MacOs),
            _ => None,
        }
    }
}

/// Read the family from os-release contents, trying `ID` then `ID_LIKE`
pub fn parse_os_release(contents: &str) -> Option<OsFamily> {
    let field = |name: &str| {
        contents.lines().find_map(|line| {
            line.trim()
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| value.trim().trim_matches('"').to_string())
        })
    };

    if let Some(family) = field("ID").and_then(|id| OsFamily::from_id(&id)) {
        return Some(family);
    }
    field("ID_LIKE")?
        .split_whitespace()
        .find_map(OsFamily::from_id)
}

/// Detect the host OS family.
///
/// Tries the release metadata file, then `lsb_release`, then the kernel name.
pub async fn detect_os(
    runner: &dyn CommandRunner,
    os_release: &Path,
) -> Result<OsFamily, DeployError> {
    let release_file = File::new(os_release);
    if release_file.exists().await {
        if let Some(family) = parse_os_release(&release_file.read_string().await?) {
            debug!("Detected {:?} from {}", family, os_release.display());
            return Ok(family);
        }
    }

    let mut seen = Vec::new();
    for cmd in [Cmd::new("lsb_release").arg("-si"), Cmd::new("uname").arg("-s")] {
        if let Ok(output) = runner.run(&cmd).await {
            let id = output.stdout.trim().to_string();
            if !output.success || id.is_empty() {
                continue;
            }
            if let Some(family) = OsFamily::from_id(&id) {
                debug!("Detected {:?} from `{}`", family, cmd);
                return Ok(family);
            }
            seen.push(id);
        }
    }

    let name = if seen.is_empty() {
        "unknown".to_string()
    } else {
        seen.join("/")
    };
    Err(DeployError::UnsupportedOs(name))
}

/// One-line host summary for logs
pub fn host_description() -> String {
    let os = sysinfo::System::long_os_version().unwrap_or_else(|| "unknown OS".to_string());
    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown host".to_string());
    format!("{} on {}", os, host)
}
