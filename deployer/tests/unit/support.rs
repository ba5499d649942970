//! Scripted host shared by the integration tests

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use stackup::app::prompt::Confirm;
use stackup::errors::DeployError;
use stackup::infra::command::{Cmd, CommandOutput, CommandRunner};

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Missing,
}

struct Rule {
    words: Vec<String>,
    replies: Vec<Reply>,
    used: usize,
}

/// A [`CommandRunner`] answering from prefix rules.
///
/// Unmatched commands succeed with empty output. When several rules match,
/// the one added last wins. Successful `install`, `cp`, `ln`, `rm` and
/// `git clone` calls are replayed on the filesystem, but only for targets
/// under `root`.
pub struct ScriptedRunner {
    root: PathBuf,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Cmd>>,
}

impl ScriptedRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn rule(self, line: &str, replies: Vec<Reply>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            words: line.split_whitespace().map(str::to_string).collect(),
            replies,
            used: 0,
        });
        self
    }

    /// Answer commands starting with `line`
    pub fn on(self, line: &str, output: CommandOutput) -> Self {
        self.rule(line, vec![Reply::Output(output)])
    }

    /// Answer successive calls in order; the last answer repeats
    pub fn on_seq(self, line: &str, outputs: Vec<CommandOutput>) -> Self {
        self.rule(line, outputs.into_iter().map(Reply::Output).collect())
    }

    /// The program cannot be started
    pub fn missing(self, line: &str) -> Self {
        self.rule(line, vec![Reply::Missing])
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Cmd::command_line).collect()
    }

    /// Number of calls whose command line starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|line| line.starts_with(prefix)).count()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    /// Index of the first call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.lines().iter().position(|line| line.starts_with(prefix))
    }

    fn reply(&self, cmd: &Cmd) -> Reply {
        let words: Vec<&str> = std::iter::once(cmd.program())
            .chain(cmd.get_args().iter().map(String::as_str))
            .collect();

        let mut rules = self.rules.lock().unwrap();
        let matched = rules.iter_mut().rev().find(|rule| {
            rule.words.len() <= words.len()
                && rule.words.iter().zip(&words).all(|(a, b)| a == b)
        });
        match matched {
            Some(rule) => {
                let index = rule.used.min(rule.replies.len() - 1);
                rule.used += 1;
                rule.replies[index].clone()
            }
            None => Reply::Output(CommandOutput::ok("")),
        }
    }

    fn inside(&self, path: &str) -> bool {
        Path::new(path).starts_with(&self.root)
    }

    fn emulate(&self, cmd: &Cmd) {
        let args = cmd.get_args();
        match cmd.program() {
            "install" | "cp" => {
                let [.., src, dst] = args else { return };
                if self.inside(dst) {
                    if let Some(parent) = Path::new(dst).parent() {
                        std::fs::create_dir_all(parent).unwrap();
                    }
                    std::fs::copy(src, dst).unwrap();
                }
            }
            "ln" => {
                let [.., target, link] = args else { return };
                if self.inside(link) {
                    if let Some(parent) = Path::new(link).parent() {
                        std::fs::create_dir_all(parent).unwrap();
                    }
                    let _ = std::fs::remove_file(link);
                    std::os::unix::fs::symlink(target, link).unwrap();
                }
            }
            "rm" => {
                for path in args.iter().filter(|arg| !arg.starts_with('-')) {
                    if self.inside(path) {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
            "git" if args.first().map(String::as_str) == Some("clone") => {
                let Some(dir) = args.last() else { return };
                if self.inside(dir) {
                    std::fs::create_dir_all(Path::new(dir).join(".git")).unwrap();
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, DeployError> {
        self.calls.lock().unwrap().push(cmd.clone());
        match self.reply(cmd) {
            Reply::Output(output) => {
                if output.success {
                    self.emulate(cmd);
                }
                Ok(output)
            }
            Reply::Missing => Err(DeployError::CommandError(format!(
                "Failed to start `{}`: No such file or directory",
                cmd
            ))),
        }
    }
}

/// Answers every confirmation the same way and remembers the prompts
pub struct AutoConfirm {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl AutoConfirm {
    pub fn yes() -> Self {
        Self {
            answer: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn no() -> Self {
        Self {
            answer: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, message: &str) -> Result<bool, DeployError> {
        self.prompts.lock().unwrap().push(message.to_string());
        Ok(self.answer)
    }
}

/// Release metadata of a Debian host
pub const DEBIAN_OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\nVERSION_ID=\"12\"\n";

/// `docker compose ps -a` with every service up
pub const PS_ALL_RUNNING: &str = "\
NAME                 IMAGE              COMMAND                  SERVICE    CREATED         STATUS                   PORTS
stackup-backend-1    stackup-backend    \"uvicorn app.main:app\"   backend    5 seconds ago   Up 4 seconds (healthy)   127.0.0.1:8000->8000/tcp
stackup-frontend-1   stackup-frontend   \"node server.js\"         frontend   5 seconds ago   Up 4 seconds             127.0.0.1:3000->3000/tcp
";

/// `openssl x509 -enddate` output for a certificate expiring `days` from now
pub fn enddate(days: i64) -> String {
    let at = chrono::Utc::now() + chrono::Duration::days(days);
    format!("notAfter={}\n", at.format("%b %e %H:%M:%S %Y GMT"))
}
