pub mod ceph;
pub mod command;
pub mod lvm;
pub mod rbd;
pub mod retry;
#[cfg(any(test, feature = "simulator"))]
pub mod sim;

#[cfg(test)]
mod tests;

use command::{CommandOutput, CommandRunner, Tool, ToolInvocation};
use rbdsr_core::{DriverConfig, PoolReference, Result, ToolPathConfig};
use retry::{RetryConfig, retry_with_backoff};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use ceph::CephClient;
pub use command::{Outcome, SystemCommandRunner, classify};
pub use lvm::LvmClient;
pub use rbd::RbdClient;

/// Resolved locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub rbd: PathBuf,
    pub ceph: PathBuf,
    pub lvm: PathBuf,
}

impl ToolPaths {
    pub fn resolve(config: &ToolPathConfig) -> Self {
        let find = |explicit: &Option<PathBuf>, name: &str, fallback: &str| {
            explicit
                .clone()
                .unwrap_or_else(|| which::which(name).unwrap_or_else(|_| PathBuf::from(fallback)))
        };

        Self {
            rbd: find(&config.rbd, "rbd", "/usr/bin/rbd"),
            ceph: find(&config.ceph, "ceph", "/usr/bin/ceph"),
            lvm: find(&config.lvm, "lvm", "/usr/sbin/lvm"),
        }
    }

    pub fn program(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Rbd => &self.rbd,
            Tool::Ceph => &self.ceph,
            Tool::Lvm => &self.lvm,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rbd: PathBuf::from("rbd"),
            ceph: PathBuf::from("ceph"),
            lvm: PathBuf::from("lvm"),
        }
    }
}

/// Entry point to every external tool the driver uses.
#[derive(Clone)]
pub struct Gateway {
    runner: Arc<dyn CommandRunner>,
    paths: ToolPaths,
    timeout: Duration,
    retry: RetryConfig,
}

impl Gateway {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        paths: ToolPaths,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            runner,
            paths,
            timeout,
            retry,
        }
    }

    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &DriverConfig) -> Self {
        Self::new(
            runner,
            ToolPaths::resolve(&config.tools),
            config.command_timeout(),
            RetryConfig::from(&config.retry),
        )
    }

    pub fn rbd(&self, pool: &PoolReference) -> RbdClient {
        RbdClient::new(self.clone(), pool.clone())
    }

    pub fn ceph(&self, pool: &PoolReference) -> CephClient {
        CephClient::new(self.clone(), pool.clone())
    }

    /// LVM client whose every invocation is confined to `conf_dir`.
    pub fn lvm(&self, conf_dir: &Path) -> LvmClient {
        LvmClient::new(self.clone(), conf_dir.to_path_buf())
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn invocation(
        &self,
        tool: Tool,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> ToolInvocation {
        ToolInvocation {
            tool,
            program: self.paths.program(tool).to_path_buf(),
            args,
            env,
            timeout: self.timeout,
        }
    }

    pub(crate) async fn execute(&self, invocation: &ToolInvocation) -> Result<CommandOutput> {
        debug!("Executing {}", invocation.command_line());
        self.runner.run(invocation).await
    }

    /// Run once and convert a non-success outcome into an error.
    pub(crate) async fn run_checked(
        &self,
        invocation: &ToolInvocation,
        operation: &str,
        target: &str,
    ) -> Result<String> {
        self.execute(invocation)
            .await?
            .into_result(operation, target, invocation.timeout)
    }

    /// Like `run_checked`, retrying Busy and Timeout outcomes with backoff.
    /// Only used for invocations that are safe to repeat.
    pub(crate) async fn run_retrying(
        &self,
        invocation: &ToolInvocation,
        operation: &str,
        target: &str,
    ) -> Result<String> {
        retry_with_backoff(&self.retry, operation, || {
            self.run_checked(invocation, operation, target)
        })
        .await
    }
}

/// `-c <conf> --id <user> [--keyring <path>] [-m <mons>]`, shared by rbd and ceph.
pub(crate) fn cluster_args(pool: &PoolReference) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        pool.config_path.display().to_string(),
        "--id".to_string(),
        pool.auth_user.clone(),
    ];

    if let Some(keyring) = &pool.keyring_path {
        args.push("--keyring".to_string());
        args.push(keyring.display().to_string());
    }

    if !pool.monitor_hosts.is_empty() {
        args.push("-m".to_string());
        args.push(pool.monitor_hosts.join(","));
    }

    args
}

/// Tool JSON output is sometimes empty instead of `[]`.
pub(crate) fn parse_json_or_default<T>(stdout: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_str(trimmed)?)
    }
}
