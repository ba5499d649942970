//! External command execution
//!
//! Every collaborator the orchestrator drives (package managers, git, docker,
//! nginx, certbot, systemd) is reached through [`CommandRunner`]. Deployment
//! steps build [`Cmd`] values and never spawn processes themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;

/// A command to run on the host
#[derive(Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: BTreeMap<String, String>,
    elevated: bool,
    interactive: bool,
}

impl Cmd {
    /// Create a new command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: BTreeMap::new(),
            elevated: false,
            interactive: false,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Export environment variables to the child
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Run with administrative privileges
    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    /// Let the child write straight to the operator's terminal
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_envs(&self) -> &BTreeMap<String, String> {
        &self.envs
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Program and arguments joined with spaces
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

// Env values may hold secrets, so only the keys are shown.
impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("command", &self.command_line())
            .field("cwd", &self.cwd)
            .field("env_keys", &self.envs.keys().collect::<Vec<_>>())
            .field("elevated", &self.elevated)
            .field("interactive", &self.interactive)
            .finish()
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful exit with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed exit with the given code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Last non-empty stderr line, for error messages
    pub fn stderr_summary(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// Runs commands on behalf of deployment steps
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// Fails only when the program could not be started; a non-zero exit is
    /// reported through [`CommandOutput::success`].
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, DeployError>;

    /// Run a command and turn a non-zero exit into an error
    async fn run_checked(&self, cmd: &Cmd) -> Result<CommandOutput, DeployError> {
        let output = self.run(cmd).await?;
        if output.success {
            return Ok(output);
        }
        let code = output
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(DeployError::CommandError(format!(
            "`{}` exited with {}: {}",
            cmd,
            code,
            output.stderr_summary()
        )))
    }

    /// True when the command starts and exits successfully
    async fn probe(&self, cmd: &Cmd) -> bool {
        matches!(self.run(cmd).await, Ok(output) if output.success)
    }
}

/// Runs commands as real child processes
#[derive(Debug, Clone)]
pub struct HostRunner {
    use_sudo: bool,
}

impl HostRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Use `sudo` for elevated commands unless already running as root
    pub async fn detect() -> Self {
        let is_root = Command::new("id")
            .arg("-u")
            .output()
            .await
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
            .unwrap_or(false);
        debug!("Running as root: {}", is_root);
        Self::new(!is_root)
    }

    fn build(&self, cmd: &Cmd) -> Command {
        let mut command = if cmd.is_elevated() && self.use_sudo {
            let mut sudo = Command::new("sudo");
            if !cmd.get_envs().is_empty() {
                let keys: Vec<&str> = cmd.get_envs().keys().map(String::as_str).collect();
                sudo.arg(format!("--preserve-env={}", keys.join(",")));
            }
            sudo.arg(cmd.program());
            sudo
        } else {
            Command::new(cmd.program())
        };

        command.args(cmd.get_args()).envs(cmd.get_envs());
        if let Some(dir) = cmd.cwd() {
            command.current_dir(dir);
        }

        // sudo may need to ask for a password
        command.stdin(Stdio::inherit());
        if cmd.is_interactive() {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        command
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, DeployError> {
        debug!("Running: {}", cmd);

        let output = self
            .build(cmd)
            .output()
            .await
            .map_err(|e| DeployError::CommandError(format!("Failed to run {}: {}", cmd.program(), e)))?;

        Ok(CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
