pub mod capacity;
pub mod disk;
pub mod locks;
pub mod mapper;
pub mod overlay;
pub mod repository;
pub mod store;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use rbdsr_core::{
    DeviceConfig, DriverConfig, DriverKind, ProbeReport, RepositoryRecord, Result, SrError,
    VirtualDiskRecord,
};
use rbdsr_platform::Gateway;
use rbdsr_platform::command::CommandRunner;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of a storage repository.
#[async_trait]
pub trait RepositoryDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// The persisted record for `id`, or a fresh one bound to this device configuration.
    async fn open(&self, id: Uuid) -> Result<RepositoryRecord>;
    async fn create(&self, id: Uuid) -> Result<RepositoryRecord>;
    async fn delete(&self, repo: &RepositoryRecord, force: bool) -> Result<()>;
    async fn attach(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord>;
    async fn detach(&self, repo: &RepositoryRecord, force: bool) -> Result<()>;
    async fn scan(&self, repo: &RepositoryRecord) -> Result<Vec<VirtualDiskRecord>>;
    async fn stat(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord>;
    /// Read-only look at the cluster; never creates anything.
    async fn probe(&self) -> Result<ProbeReport>;
    async fn set_quota(&self, repo: &RepositoryRecord, max_bytes: u64) -> Result<RepositoryRecord>;
    async fn extend(&self, repo: &RepositoryRecord, size: &str) -> Result<RepositoryRecord>;
}

/// Lifecycle of the virtual disks inside a repository.
#[async_trait]
pub trait DiskDriver: Send + Sync {
    async fn create_disk(
        &self,
        repo: &RepositoryRecord,
        size_bytes: u64,
        sharable: bool,
    ) -> Result<VirtualDiskRecord>;
    async fn lookup_disk(&self, repo: &RepositoryRecord, id: Uuid) -> Result<VirtualDiskRecord>;
    async fn delete_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        force: bool,
    ) -> Result<()>;
    async fn resize_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        size_bytes: u64,
        force: bool,
    ) -> Result<VirtualDiskRecord>;
    async fn attach_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord>;
    async fn detach_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord>;
    async fn snapshot_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord>;
    async fn clone_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord>;
}

/// Both halves of a driver, selected by the device configuration.
#[derive(Clone)]
pub struct Driver {
    pub kind: DriverKind,
    pub repositories: Arc<dyn RepositoryDriver>,
    pub disks: Arc<dyn DiskDriver>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("kind", &self.kind).finish()
    }
}

/// Wire up the driver for one invocation.
pub async fn open_driver(
    device: DeviceConfig,
    config: &DriverConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Driver> {
    config.validate()?;

    let gateway = Gateway::from_config(runner, config);
    let locks = Arc::new(ResourceLocks::new(config.locks_dir()));
    let rbd = gateway.rbd(&device.pool);
    let ceph = gateway.ceph(&device.pool);
    let mapper = Arc::new(DeviceMapper::new(
        rbd.clone(),
        config.mappings_dir(),
        locks.clone(),
        gateway.retry_config().clone(),
        config.device_settle_timeout(),
    ));
    let store = RepositoryStore::new(config.repositories_dir());

    debug!(
        "Opening {} driver for pool {}",
        device.kind, device.pool.pool
    );

    match device.kind {
        DriverKind::Rbd => {
            let capacity = Arc::new(CapacityEstimator::new(ceph.clone()));
            let disks = Arc::new(RbdDiskController::new(
                rbd.clone(),
                capacity.clone(),
                mapper,
                locks,
            ));
            let repositories = Arc::new(RbdRepository::new(
                device.pool,
                ceph,
                rbd,
                capacity,
                disks.clone(),
                store,
            ));
            Ok(Driver {
                kind: DriverKind::Rbd,
                repositories,
                disks,
            })
        }
        DriverKind::LvmOverRbd => {
            let overlay_config = device.overlay.ok_or_else(|| {
                SrError::ConfigInvalid("lvmorbd driver needs the 'image' key".to_string())
            })?;
            let overlay = Arc::new(RbdOverlay::new(
                device.pool,
                overlay_config,
                config.lvm_conf_root.clone(),
                ceph,
                rbd,
                mapper,
                LvmVolumes::new(gateway),
                locks,
                store,
                AttachCounts::new(config.attachments_dir()),
            ));
            Ok(Driver {
                kind: DriverKind::LvmOverRbd,
                repositories: overlay.clone(),
                disks: overlay,
            })
        }
    }
}

pub use capacity::CapacityEstimator;
pub use disk::RbdDiskController;
pub use locks::{ResourceGuard, ResourceLocks};
pub use mapper::{DeviceMapper, MappingEntry};
pub use overlay::{AttachCounts, LogicalVolumes, LvmVolumes, RbdOverlay, parse_size};
pub use repository::RbdRepository;
pub use store::RepositoryStore;
