use async_trait::async_trait;
use rbdsr_core::{Result, SrError};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Search path handed to every child; the caller's environment is not inherited.
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tool {
    Rbd,
    Ceph,
    Lvm,
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tool::Rbd => write!(f, "rbd"),
            Tool::Ceph => write!(f, "ceph"),
            Tool::Lvm => write!(f, "lvm"),
        }
    }
}

/// A fully described external command. Arguments are passed as a vector,
/// never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    /// Value following `flag`, e.g. `--size 1024M`.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

/// Classified result of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NotFound,
    PermissionDenied,
    Busy,
    Timeout,
    AlreadyExists,
    QuotaExceeded,
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub outcome: Outcome,
}

impl CommandOutput {
    pub fn from_process(tool: Tool, exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        let outcome = classify(tool, exit_code, &stderr);
        Self {
            stdout,
            stderr,
            exit_code,
            outcome,
        }
    }

    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            outcome: Outcome::Success,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            outcome: Outcome::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit status {code}"),
            None => "terminated".to_string(),
        }
    }

    /// Turn a classified outcome into the matching error, or stdout on success.
    pub fn into_result(self, operation: &str, target: &str, timeout: Duration) -> Result<String> {
        let detail = self.detail();
        match self.outcome {
            Outcome::Success => Ok(self.stdout),
            Outcome::NotFound => Err(SrError::NotFound {
                resource: target.to_string(),
            }),
            Outcome::AlreadyExists => Err(SrError::AlreadyExists {
                resource: target.to_string(),
            }),
            Outcome::PermissionDenied => Err(SrError::PermissionDenied {
                operation: operation.to_string(),
                target: target.to_string(),
                detail,
            }),
            Outcome::Busy => Err(SrError::Busy {
                operation: operation.to_string(),
                target: target.to_string(),
                detail,
            }),
            Outcome::Timeout => Err(SrError::Timeout {
                operation: operation.to_string(),
                target: target.to_string(),
                seconds: timeout.as_secs(),
            }),
            Outcome::QuotaExceeded => Err(SrError::QuotaExceeded {
                pool: target.to_string(),
                message: detail,
            }),
            Outcome::Unknown(detail) => Err(SrError::Unknown {
                operation: operation.to_string(),
                target: target.to_string(),
                detail,
            }),
        }
    }
}

/// Map an exit status and stderr to an `Outcome`.
///
/// Stderr patterns win over the exit code. rbd and ceph exit with the errno
/// of the failure, so for them the exit code is a usable fallback; lvm only
/// reports generic codes.
pub fn classify(tool: Tool, exit_code: Option<i32>, stderr: &str) -> Outcome {
    match exit_code {
        Some(0) => return Outcome::Success,
        None => return Outcome::Unknown(format!("{tool} terminated by signal")),
        Some(_) => {}
    }

    let text = stderr.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

    if has(&["disk quota exceeded", "(122)", "edquot"]) {
        return Outcome::QuotaExceeded;
    }
    if has(&[
        "already exists",
        "already protected",
        "file exists",
        "(17)",
        "eexist",
    ]) {
        return Outcome::AlreadyExists;
    }
    if has(&[
        "no such file",
        "does not exist",
        "doesn't exist",
        "unrecognized pool",
        "not found",
        "failed to find",
        "(2)",
        "enoent",
    ]) {
        return Outcome::NotFound;
    }
    if has(&[
        "permission denied",
        "operation not permitted",
        "(13)",
        "(1)",
        "eacces",
        "eperm",
    ]) {
        return Outcome::PermissionDenied;
    }
    if has(&["timed out", "(110)", "etimedout"]) {
        return Outcome::Timeout;
    }
    if has(&[
        "busy",
        "watchers",
        "in use",
        "resource temporarily unavailable",
        "(16)",
        "(11)",
        "ebusy",
    ]) {
        return Outcome::Busy;
    }

    if matches!(tool, Tool::Rbd | Tool::Ceph) {
        match exit_code {
            Some(2) => return Outcome::NotFound,
            Some(1) | Some(13) => return Outcome::PermissionDenied,
            Some(11) | Some(16) => return Outcome::Busy,
            Some(17) => return Outcome::AlreadyExists,
            Some(110) => return Outcome::Timeout,
            Some(122) => return Outcome::QuotaExceeded,
            _ => {}
        }
    }

    let detail = stderr.trim();
    if detail.is_empty() {
        Outcome::Unknown(format!(
            "{tool} exited with status {}",
            exit_code.unwrap_or_default()
        ))
    } else {
        Outcome::Unknown(detail.to_string())
    }
}

/// Executes tool invocations. Swapped for a simulated cluster in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Errors only when the process could not be started; tool failures are
    /// reported through `CommandOutput::outcome`.
    async fn run(&self, invocation: &ToolInvocation) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("LC_ALL", "C")
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| SrError::Unknown {
            operation: format!("spawn {}", invocation.tool),
            target: invocation.program.display().to_string(),
            detail: e.to_string(),
        })?;

        // Dropping the pending future on timeout kills the child.
        let output =
            match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!(
                        "{} did not finish within {}s, killed",
                        invocation.command_line(),
                        invocation.timeout.as_secs()
                    );
                    return Ok(CommandOutput::timed_out());
                }
            };

        let result = CommandOutput::from_process(
            invocation.tool,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        );

        debug!(
            "{} finished with {:?} ({:?})",
            invocation.tool, result.exit_code, result.outcome
        );

        Ok(result)
    }
}
