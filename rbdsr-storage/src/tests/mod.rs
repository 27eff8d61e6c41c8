mod capacity_tests;
mod disk_tests;
mod locks_tests;
mod mapper_tests;
mod size_tests;
mod store_tests;

use crate::locks::ResourceLocks;
use crate::mapper::DeviceMapper;
use crate::{Driver, open_driver};
use async_trait::async_trait;
use rbdsr_core::{DeviceConfig, DriverConfig, DriverKind, PoolReference, Result, RetrySettings};
use rbdsr_platform::command::{CommandOutput, CommandRunner, ToolInvocation};
use rbdsr_platform::retry::RetryConfig;
use rbdsr_platform::sim::SimulatedCluster;
use rbdsr_platform::{Gateway, ToolPaths};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const MIB: u64 = 1024 * 1024;
pub(crate) const GIB: u64 = 1024 * MIB;

pub(crate) const BACKING_IMAGE: &str = "sr-backing";

/// A simulated cluster with one 500 GiB pool and a private state directory.
pub(crate) struct TestHost {
    pub cluster: Arc<SimulatedCluster>,
    pub config: DriverConfig,
    _state: TempDir,
}

impl TestHost {
    pub async fn new() -> Self {
        let cluster = Arc::new(SimulatedCluster::new());
        cluster.add_pool("vms", 500 * GIB).await;

        let state = TempDir::new().expect("temp dir");
        let config = DriverConfig {
            state_dir: state.path().join("state"),
            log_dir: state.path().join("log"),
            lvm_conf_root: state.path().join("lvm"),
            command_timeout_secs: 5,
            device_settle_timeout_secs: 0,
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 4,
                backoff_multiplier: 2.0,
            },
            ..DriverConfig::default()
        };

        Self {
            cluster,
            config,
            _state: state,
        }
    }

    /// Each call behaves like a fresh driver process on the same host.
    pub async fn rbd_driver(&self) -> Result<Driver> {
        let device = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool=vms"])?;
        open_driver(device, &self.config, self.cluster.clone()).await
    }

    pub async fn overlay_driver(&self, protected: bool) -> Result<Driver> {
        self.overlay_driver_on(protected, self.cluster.clone()).await
    }

    pub async fn rbd_driver_on(&self, runner: Arc<dyn CommandRunner>) -> Result<Driver> {
        let device = DeviceConfig::parse_pairs(DriverKind::Rbd, ["pool=vms"])?;
        open_driver(device, &self.config, runner).await
    }

    pub async fn overlay_driver_on(
        &self,
        protected: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Driver> {
        let device = DeviceConfig::parse_pairs(
            DriverKind::LvmOverRbd,
            [
                "pool=vms".to_string(),
                format!("image={BACKING_IMAGE}"),
                "size=4G".to_string(),
                format!("protected={protected}"),
            ],
        )?;
        open_driver(device, &self.config, runner).await
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(
            self.cluster.clone(),
            ToolPaths::default(),
            Duration::from_secs(5),
            fast_retry(3),
        )
    }

    pub fn mapper(&self) -> DeviceMapper {
        DeviceMapper::new(
            self.gateway().rbd(&pool_ref()),
            self.config.mappings_dir(),
            Arc::new(ResourceLocks::new(self.config.locks_dir())),
            fast_retry(3),
            None,
        )
    }
}

pub(crate) fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
    }
}

pub(crate) fn pool_ref() -> PoolReference {
    PoolReference {
        pool: "vms".to_string(),
        config_path: PathBuf::from("/etc/ceph/ceph.conf"),
        auth_user: "admin".to_string(),
        keyring_path: None,
        monitor_hosts: Vec::new(),
    }
}

type Interloper = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Forwards to the simulated cluster. The first command matching `trigger`
/// starts `interloper` in the background and is held back for a moment, so
/// the interloper runs while the caller is in the middle of an operation.
pub(crate) struct InterleavingRunner {
    cluster: Arc<SimulatedCluster>,
    trigger: Box<dyn Fn(&ToolInvocation) -> bool + Send + Sync>,
    interloper: Mutex<Option<Interloper>>,
}

impl InterleavingRunner {
    pub fn new(
        cluster: Arc<SimulatedCluster>,
        trigger: impl Fn(&ToolInvocation) -> bool + Send + Sync + 'static,
        interloper: impl Future<Output = ()> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            trigger: Box::new(trigger),
            interloper: Mutex::new(Some(Box::pin(interloper))),
        })
    }
}

#[async_trait]
impl CommandRunner for InterleavingRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<CommandOutput> {
        if (self.trigger)(invocation) {
            let interloper = self.interloper.lock().unwrap().take();
            if let Some(interloper) = interloper {
                tokio::spawn(interloper);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        self.cluster.run(invocation).await
    }
}
