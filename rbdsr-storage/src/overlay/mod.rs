//! Composition mode: one RBD image carries a volume group, and every
//! virtual disk is a logical volume inside it.
//!
//! Every operation leases the backing image first (map plus import of an
//! exported group) and releases it afterwards. Release deactivates the
//! group before the last reference is unmapped, since the kernel refuses to
//! unmap a device with active logical volumes on it. When an operation
//! fails after the lease, the release still runs and its failure is only
//! logged, so the caller sees the operation's own error.
//!
//! An attached volume keeps its lease until the matching detach, one lease
//! per attach.

pub mod attachments;
pub mod size;
pub mod volumes;

pub use attachments::AttachCounts;
pub use size::parse_size;
pub use volumes::{LogicalVolumes, LvmVolumes};

use crate::locks::ResourceLocks;
use crate::mapper::DeviceMapper;
use crate::store::RepositoryStore;
use crate::{DiskDriver, RepositoryDriver};
use async_trait::async_trait;
use rbdsr_core::{
    CapacityStats, DiskState, DriverKind, IMAGE_PREFIX, ImageSpec, LOGICAL_VOLUME_PREFIX,
    OverlayBinding, OverlayConfig, PoolReference, ProbeReport, ProbedImage, RepositoryRecord,
    Result, SrError, VirtualDiskRecord, logical_volume_name, parse_prefixed_id, volume_group_name,
};
use rbdsr_platform::lvm::{LvReport, VgReport};
use rbdsr_platform::rbd::round_up_to_mib;
use rbdsr_platform::{CephClient, LvmClient, RbdClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Scope used to look at a device before any repository owns it.
const PROBE_SCOPE: &str = "probe";

pub struct RbdOverlay<V: LogicalVolumes = LvmVolumes> {
    pool: PoolReference,
    config: OverlayConfig,
    conf_root: PathBuf,
    ceph: CephClient,
    rbd: RbdClient,
    mapper: Arc<DeviceMapper>,
    volumes: V,
    locks: Arc<ResourceLocks>,
    store: RepositoryStore,
    attachments: AttachCounts,
}

impl<V: LogicalVolumes> RbdOverlay<V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PoolReference,
        config: OverlayConfig,
        conf_root: PathBuf,
        ceph: CephClient,
        rbd: RbdClient,
        mapper: Arc<DeviceMapper>,
        volumes: V,
        locks: Arc<ResourceLocks>,
        store: RepositoryStore,
        attachments: AttachCounts,
    ) -> Self {
        Self {
            pool,
            config,
            conf_root,
            ceph,
            rbd,
            mapper,
            volumes,
            locks,
            store,
            attachments,
        }
    }

    pub fn binding(&self, id: &Uuid) -> OverlayBinding {
        OverlayBinding {
            image: self.rbd.spec(&self.config.image),
            volume_group: volume_group_name(id),
            conf_dir: self.conf_root.join(id.to_string()),
            protected: self.config.protected,
        }
    }

    /// Map the backing image and make its volume group usable in this scope.
    async fn lease(&self, binding: &OverlayBinding) -> Result<PathBuf> {
        self.volumes.prepare_scope(&binding.conf_dir).await?;

        let device = match self.mapper.map(&binding.image, false, false).await {
            Ok(device) => device,
            Err(e) if e.is_not_found() => {
                return Err(SrError::NotFound {
                    resource: format!("backing image {}", binding.image),
                });
            }
            Err(e) => return Err(e),
        };

        let ready = async {
            match self
                .volumes
                .group(&binding.conf_dir, &binding.volume_group)
                .await?
            {
                Some(group) if group.is_exported() => {
                    self.volumes
                        .import_group(&binding.conf_dir, &binding.volume_group)
                        .await
                }
                Some(_) => Ok(()),
                None => Err(SrError::NotFound {
                    resource: format!(
                        "volume group {} on {}",
                        binding.volume_group, binding.image
                    ),
                }),
            }
        }
        .await;

        match ready {
            Ok(()) => Ok(device),
            Err(e) => self.finish(binding, Err(e)).await,
        }
    }

    /// Give back one lease; the last one deactivates the group and unmaps.
    /// Both happen under the image lock, so no lease can be taken between
    /// the deactivation and the unmap.
    async fn release(&self, binding: &OverlayBinding) -> Result<()> {
        self.mapper
            .unmap_with(&binding.image, || async {
                match self
                    .volumes
                    .set_group_active(&binding.conf_dir, &binding.volume_group, false)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => {
                        debug!("{} not visible, nothing to deactivate", binding.volume_group);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(())
    }

    /// Release the lease taken for `result`. A release failure only surfaces
    /// when the operation itself succeeded.
    async fn finish<T>(&self, binding: &OverlayBinding, result: Result<T>) -> Result<T> {
        let released = self.release(binding).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(
                    "Releasing {} after a failed operation also failed: {}",
                    binding.image, cleanup
                );
                Err(e)
            }
        }
    }

    async fn require_group(&self, binding: &OverlayBinding) -> Result<VgReport> {
        self.volumes
            .group(&binding.conf_dir, &binding.volume_group)
            .await?
            .ok_or_else(|| SrError::NotFound {
                resource: format!("volume group {}", binding.volume_group),
            })
    }

    async fn group_stats(&self, binding: &OverlayBinding) -> Result<CapacityStats> {
        let group = self.require_group(binding).await?;
        Ok(CapacityStats::new(
            group.vg_size,
            group.vg_size.saturating_sub(group.vg_free),
            None,
        ))
    }

    async fn ensure_free(&self, binding: &OverlayBinding, bytes: u64) -> Result<()> {
        let group = self.require_group(binding).await?;
        if bytes > group.vg_free {
            return Err(SrError::QuotaExceeded {
                pool: binding.volume_group.clone(),
                message: format!(
                    "{} bytes requested, {} bytes free",
                    bytes, group.vg_free
                ),
            });
        }
        Ok(())
    }

    async fn require_volume(&self, binding: &OverlayBinding, lv: &str) -> Result<LvReport> {
        self.volumes
            .volumes(&binding.conf_dir, &binding.volume_group)
            .await?
            .into_iter()
            .find(|report| report.lv_name == lv)
            .ok_or_else(|| SrError::NotFound {
                resource: format!("logical volume {}/{}", binding.volume_group, lv),
            })
    }

    fn volume_record(&self, binding: &OverlayBinding, id: Uuid, lv: &LvReport) -> VirtualDiskRecord {
        let active = lv.is_active();
        VirtualDiskRecord {
            id,
            backing: ImageSpec::image(&self.pool.pool, &lv.lv_name),
            size_bytes: lv.lv_size,
            read_only: lv.is_read_only(),
            sharable: false,
            parent: lv
                .origin()
                .map(|origin| ImageSpec::image(&self.pool.pool, origin)),
            state: if active {
                DiskState::Attached
            } else {
                DiskState::Unattached
            },
            device_path: active.then(|| LvmClient::lv_path(&binding.volume_group, &lv.lv_name)),
        }
    }

    /// Needs a lease.
    async fn list_disks(&self, binding: &OverlayBinding) -> Result<Vec<VirtualDiskRecord>> {
        let volumes = self
            .volumes
            .volumes(&binding.conf_dir, &binding.volume_group)
            .await?;
        Ok(volumes
            .iter()
            .filter_map(|lv| {
                parse_prefixed_id(LOGICAL_VOLUME_PREFIX, &lv.lv_name)
                    .map(|id| self.volume_record(binding, id, lv))
            })
            .collect())
    }

    async fn refresh(&self, binding: &OverlayBinding, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        let mut record = repo.clone();
        record.update_stats(self.group_stats(binding).await?);
        record.update_allocation(&self.list_disks(binding).await?);
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Undo a half-finished create, whatever step it got to. Failures are
    /// logged, never returned.
    async fn rollback_create(&self, binding: &OverlayBinding, id: &Uuid) {
        match self
            .volumes
            .remove_group(&binding.conf_dir, &binding.volume_group)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Rollback: removing {} failed: {}", binding.volume_group, e),
        }
        if let Err(e) = self.mapper.force_unmap(&binding.image).await {
            error!("Rollback: unmapping {} failed: {}", binding.image, e);
        }
        if let Err(e) = self.store.remove(id).await {
            warn!("Rollback: removing record of {} failed: {}", id, e);
        }
        if let Err(e) = self.rbd.remove(&binding.image.image).await {
            error!("Rollback: removing {} failed: {}", binding.image, e);
        }
        if let Err(e) = self.volumes.remove_scope(&binding.conf_dir).await {
            warn!("Rollback: removing scope {} failed: {}", binding.conf_dir.display(), e);
        }
    }

    /// Snapshot or writable clone of a logical volume, sized to its origin.
    async fn copy_volume(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        read_only: bool,
    ) -> Result<VirtualDiskRecord> {
        let binding = repo.overlay()?.clone();
        self.lease(&binding).await?;

        let result = async {
            let origin = self.require_volume(&binding, &disk.backing.image).await?;
            self.ensure_free(&binding, origin.lv_size).await?;

            let id = Uuid::new_v4();
            let lv = logical_volume_name(&id);
            self.volumes
                .snapshot_volume(
                    &binding.conf_dir,
                    &binding.volume_group,
                    &origin.lv_name,
                    &lv,
                    origin.lv_size,
                    read_only,
                )
                .await?;
            self.settle_volume(&binding, id, &lv).await
        }
        .await;

        self.finish(&binding, result).await
    }

    /// Leave a freshly created volume inactive and report it. A failure
    /// removes the volume again.
    async fn settle_volume(
        &self,
        binding: &OverlayBinding,
        id: Uuid,
        lv: &str,
    ) -> Result<VirtualDiskRecord> {
        let settled = async {
            self.volumes
                .set_volume_active(&binding.conf_dir, &binding.volume_group, lv, false)
                .await?;
            let created = self.require_volume(binding, lv).await?;
            Ok(self.volume_record(binding, id, &created))
        }
        .await;

        if settled.is_err() {
            warn!("Removing {}/{} after a failed create", binding.volume_group, lv);
            if let Err(e) = self
                .volumes
                .remove_volume(&binding.conf_dir, &binding.volume_group, lv)
                .await
            {
                error!("Rollback: removing {} failed: {}", lv, e);
            }
        }
        settled
    }
}

#[async_trait]
impl<V: LogicalVolumes> RepositoryDriver for RbdOverlay<V> {
    fn kind(&self) -> DriverKind {
        DriverKind::LvmOverRbd
    }

    async fn open(&self, id: Uuid) -> Result<RepositoryRecord> {
        match self.store.load(&id).await? {
            Some(record) => {
                let expected = self.binding(&id);
                match &record.overlay {
                    Some(binding) if binding.image == expected.image => Ok(record),
                    Some(binding) => Err(SrError::ConfigInvalid(format!(
                        "repository {id} is backed by {}, not {}",
                        binding.image, expected.image
                    ))),
                    None => Err(SrError::ConfigInvalid(format!(
                        "repository {id} is a direct-mode repository"
                    ))),
                }
            }
            None => Ok(RepositoryRecord::new(
                id,
                self.pool.clone(),
                Some(self.binding(&id)),
            )),
        }
    }

    async fn create(&self, id: Uuid) -> Result<RepositoryRecord> {
        let text = self.config.size.as_deref().ok_or_else(|| {
            SrError::ConfigInvalid(
                "size is required to create a volume-group repository (e.g. 10G, 2T, 1024M)"
                    .to_string(),
            )
        })?;
        let size = parse_size(text)?;

        if let Some(existing) = self.store.load(&id).await? {
            info!("Repository {} already exists", id);
            return self.stat(&existing).await;
        }

        let binding = self.binding(&id);
        let _pool = self.locks.pool(&self.pool.pool).await?;
        info!(
            "Creating volume-group repository {} on {} ({} bytes)",
            id, binding.image, size
        );

        self.ceph.health().await?;
        self.ceph.pool_stats().await?;
        self.volumes.prepare_scope(&binding.conf_dir).await?;
        self.rbd.create(&binding.image.image, size).await?;

        let built = async {
            let device = self.mapper.map(&binding.image, false, false).await?;
            self.volumes
                .create_group(&binding.conf_dir, &binding.volume_group, &device)
                .await?;
            let record = RepositoryRecord::new(id, self.pool.clone(), Some(binding.clone()));
            let record = self.refresh(&binding, &record).await?;
            self.release(&binding).await?;
            Ok(record)
        }
        .await;

        if built.is_err() {
            self.rollback_create(&binding, &id).await;
        }
        built
    }

    async fn delete(&self, repo: &RepositoryRecord, force: bool) -> Result<()> {
        let binding = repo.overlay()?.clone();
        let _pool = self.locks.pool(&self.pool.pool).await?;

        match self.lease(&binding).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!("{}; dropping local state of repository {}", e, repo.id);
                self.mapper.force_unmap(&binding.image).await?;
                self.volumes.remove_scope(&binding.conf_dir).await?;
                return self.store.remove(&repo.id).await;
            }
            Err(e) => return Err(e),
        }

        let teardown = async {
            let volumes = self
                .volumes
                .volumes(&binding.conf_dir, &binding.volume_group)
                .await?;
            if !volumes.is_empty() && !force {
                return Err(SrError::NotEmpty {
                    repository: repo.id.to_string(),
                    count: volumes.len(),
                });
            }

            self.volumes
                .set_group_active(&binding.conf_dir, &binding.volume_group, false)
                .await?;
            if binding.protected {
                info!(
                    "Backing image {} is protected, exporting {} and keeping it",
                    binding.image, binding.volume_group
                );
                self.volumes
                    .export_group(&binding.conf_dir, &binding.volume_group)
                    .await
            } else {
                self.volumes
                    .remove_group(&binding.conf_dir, &binding.volume_group)
                    .await
            }
        }
        .await;

        if let Err(e) = teardown {
            return self.finish(&binding, Err(e)).await;
        }

        // The group is inactive, so every reference can go at once.
        self.mapper.force_unmap(&binding.image).await?;
        if !binding.protected {
            match self.rbd.remove(&binding.image.image).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.attachments.clear_group(&binding.volume_group).await?;
        self.volumes.remove_scope(&binding.conf_dir).await?;
        self.store.remove(&repo.id).await?;
        info!("Deleted volume-group repository {}", repo.id);
        Ok(())
    }

    async fn attach(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        let binding = repo.overlay()?.clone();
        info!("Attaching volume-group repository {}", repo.id);
        self.ceph.health().await?;

        if self.mapper.refcount(&binding.image).await? > 0 {
            debug!("{} already mapped", binding.image);
            return self.refresh(&binding, repo).await;
        }

        self.lease(&binding).await?;
        match self.refresh(&binding, repo).await {
            Ok(record) => Ok(record),
            Err(e) => self.finish(&binding, Err(e)).await,
        }
    }

    async fn detach(&self, repo: &RepositoryRecord, force: bool) -> Result<()> {
        let binding = repo.overlay()?.clone();
        let refcount = self.mapper.refcount(&binding.image).await?;
        if refcount == 0 {
            debug!("Repository {} is not attached", repo.id);
            return Ok(());
        }

        let volumes = self
            .volumes
            .volumes(&binding.conf_dir, &binding.volume_group)
            .await?;
        if let Some(active) = volumes.iter().find(|lv| lv.is_active()) {
            if !force {
                return Err(SrError::StillMapped {
                    image: format!("{}/{}", binding.volume_group, active.lv_name),
                    refcount,
                });
            }
        }

        self.volumes
            .set_group_active(&binding.conf_dir, &binding.volume_group, false)
            .await?;
        self.mapper.force_unmap(&binding.image).await?;
        self.attachments.clear_group(&binding.volume_group).await?;
        info!("Detached volume-group repository {}", repo.id);
        Ok(())
    }

    async fn scan(&self, repo: &RepositoryRecord) -> Result<Vec<VirtualDiskRecord>> {
        let binding = repo.overlay()?.clone();
        self.lease(&binding).await?;

        let result = async {
            let disks = self.list_disks(&binding).await?;
            if self.store.load(&repo.id).await?.is_some() {
                let mut record = repo.clone();
                record.update_allocation(&disks);
                self.store.save(&record).await?;
            }
            Ok(disks)
        }
        .await;

        self.finish(&binding, result).await
    }

    async fn stat(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        let binding = repo.overlay()?.clone();
        self.lease(&binding).await?;
        let result = self.refresh(&binding, repo).await;
        self.finish(&binding, result).await
    }

    async fn probe(&self) -> Result<ProbeReport> {
        let pools = self.ceph.list_pools().await?;
        let pool_exists = pools.contains(&self.pool.pool);
        if !pool_exists {
            return Ok(ProbeReport {
                pools,
                ..ProbeReport::default()
            });
        }

        let images: Vec<ProbedImage> = self
            .rbd
            .list_long()
            .await?
            .into_iter()
            .filter(|row| row.snapshot.is_none())
            .map(|row| ProbedImage {
                disk_id: parse_prefixed_id(IMAGE_PREFIX, &row.image),
                name: row.image,
                size_bytes: row.size,
            })
            .collect();

        let mut volume_groups = Vec::new();
        if images.iter().any(|image| image.name == self.config.image) {
            let spec = self.rbd.spec(&self.config.image);
            let scope = self.conf_root.join(PROBE_SCOPE);
            self.volumes.prepare_scope(&scope).await?;

            let device = self.mapper.map(&spec, true, false).await?;
            let found = self.volumes.group_on_device(&scope, &device).await;
            if let Err(e) = self.mapper.unmap(&spec).await {
                warn!("Unmapping {} after probe failed: {}", spec, e);
            }
            volume_groups.extend(found?);
        }

        Ok(ProbeReport {
            pools,
            pool_exists,
            images,
            volume_groups,
        })
    }

    async fn set_quota(&self, repo: &RepositoryRecord, max_bytes: u64) -> Result<RepositoryRecord> {
        self.ceph.set_quota(max_bytes).await?;
        self.stat(repo).await
    }

    async fn extend(&self, repo: &RepositoryRecord, size: &str) -> Result<RepositoryRecord> {
        let binding = repo.overlay()?.clone();
        let requested = round_up_to_mib(parse_size(size)?);
        let current = self.rbd.info(&binding.image).await?.size;

        if requested < current {
            return Err(SrError::ShrinkRejected {
                image: binding.image.to_string(),
                current,
                requested,
                reason: "a volume group can only grow".to_string(),
            });
        }
        if requested == current {
            return self.stat(repo).await;
        }

        let device = self.lease(&binding).await?;
        let result = async {
            info!(
                "Extending {} from {} to {} bytes",
                binding.image, current, requested
            );
            self.rbd
                .resize(&binding.image.image, requested, false)
                .await?;
            self.volumes
                .grow_physical(&binding.conf_dir, &device)
                .await?;
            self.refresh(&binding, repo).await
        }
        .await;

        self.finish(&binding, result).await
    }
}

#[async_trait]
impl<V: LogicalVolumes> DiskDriver for RbdOverlay<V> {
    async fn create_disk(
        &self,
        repo: &RepositoryRecord,
        size_bytes: u64,
        sharable: bool,
    ) -> Result<VirtualDiskRecord> {
        if size_bytes == 0 {
            return Err(SrError::ConfigInvalid(
                "virtual disk size must be greater than zero".to_string(),
            ));
        }
        if sharable {
            debug!("Logical volumes are never shared; ignoring the sharable flag");
        }

        let binding = repo.overlay()?.clone();
        let _group = self.locks.pool(&binding.volume_group).await?;
        self.lease(&binding).await?;

        let result = async {
            let size = round_up_to_mib(size_bytes);
            self.ensure_free(&binding, size).await?;

            let id = Uuid::new_v4();
            let lv = logical_volume_name(&id);
            self.volumes
                .create_volume(&binding.conf_dir, &binding.volume_group, &lv, size)
                .await?;
            self.settle_volume(&binding, id, &lv).await
        }
        .await;

        self.finish(&binding, result).await
    }

    async fn lookup_disk(&self, repo: &RepositoryRecord, id: Uuid) -> Result<VirtualDiskRecord> {
        let binding = repo.overlay()?.clone();
        self.lease(&binding).await?;
        let result = self
            .require_volume(&binding, &logical_volume_name(&id))
            .await
            .map(|lv| self.volume_record(&binding, id, &lv));
        self.finish(&binding, result).await
    }

    async fn delete_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        force: bool,
    ) -> Result<()> {
        let binding = repo.overlay()?.clone();
        let _group = self.locks.pool(&binding.volume_group).await?;
        let _volume = self
            .locks
            .volume(&binding.volume_group, &disk.backing.image)
            .await?;
        self.lease(&binding).await?;

        let result = async {
            let volumes = self
                .volumes
                .volumes(&binding.conf_dir, &binding.volume_group)
                .await?;
            let Some(lv) = volumes.iter().find(|lv| lv.lv_name == disk.backing.image) else {
                debug!("{} already removed", disk.backing.image);
                return Ok(());
            };

            let attached = self
                .attachments
                .count(&binding.volume_group, &lv.lv_name)
                .await?;
            if attached > 0 || lv.is_active() {
                return Err(SrError::StillMapped {
                    image: format!("{}/{}", binding.volume_group, lv.lv_name),
                    refcount: attached.max(1),
                });
            }

            let dependants: Vec<String> = volumes
                .iter()
                .filter(|other| other.origin() == Some(lv.lv_name.as_str()))
                .map(|other| format!("{}/{}", binding.volume_group, other.lv_name))
                .collect();
            if !dependants.is_empty() {
                if !force {
                    return Err(SrError::HasClones {
                        image: format!("{}/{}", binding.volume_group, lv.lv_name),
                        clones: dependants,
                    });
                }
                warn!(
                    "Removing {} also removes its snapshots: {}",
                    lv.lv_name,
                    dependants.join(", ")
                );
            }

            self.volumes
                .remove_volume(&binding.conf_dir, &binding.volume_group, &lv.lv_name)
                .await
        }
        .await;

        self.finish(&binding, result).await
    }

    async fn resize_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        size_bytes: u64,
        force: bool,
    ) -> Result<VirtualDiskRecord> {
        let binding = repo.overlay()?.clone();
        let requested = round_up_to_mib(size_bytes);
        self.lease(&binding).await?;

        let result = async {
            let lv = self.require_volume(&binding, &disk.backing.image).await?;
            let current = lv.lv_size;
            if requested == current {
                return Ok(self.volume_record(&binding, disk.id, &lv));
            }

            let shrink = requested < current;
            if shrink && !force {
                return Err(SrError::ShrinkRejected {
                    image: format!("{}/{}", binding.volume_group, lv.lv_name),
                    current,
                    requested,
                    reason: "shrinking discards data and needs force".to_string(),
                });
            }
            if !shrink {
                self.ensure_free(&binding, requested - current).await?;
            }

            self.volumes
                .resize_volume(
                    &binding.conf_dir,
                    &binding.volume_group,
                    &lv.lv_name,
                    requested,
                    shrink,
                )
                .await?;
            let resized = self.require_volume(&binding, &lv.lv_name).await?;
            Ok(self.volume_record(&binding, disk.id, &resized))
        }
        .await;

        self.finish(&binding, result).await
    }

    async fn attach_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        let binding = repo.overlay()?.clone();
        let lv_name = disk.backing.image.as_str();
        let mut record = disk.clone();
        record.state = record.state.transition(DiskState::Attaching)?;

        let _volume = self.locks.volume(&binding.volume_group, lv_name).await?;
        self.lease(&binding).await?;

        let activated = async {
            let lv = self.require_volume(&binding, lv_name).await?;
            let count = self
                .attachments
                .increment(&binding.volume_group, lv_name)
                .await?;
            if lv.is_active() {
                debug!("{} already active, attached {} time(s)", lv_name, count);
                return Ok(());
            }
            if let Err(e) = self
                .volumes
                .set_volume_active(&binding.conf_dir, &binding.volume_group, lv_name, true)
                .await
            {
                if let Err(undo) = self
                    .attachments
                    .decrement(&binding.volume_group, lv_name)
                    .await
                {
                    warn!("Restoring attach count of {} failed: {}", lv_name, undo);
                }
                return Err(e);
            }
            Ok(())
        }
        .await;

        // On success the lease stays with this attach until its detach.
        if let Err(e) = activated {
            return self.finish(&binding, Err(e)).await;
        }

        record.state = record.state.transition(DiskState::Attached)?;
        record.device_path = Some(LvmClient::lv_path(&binding.volume_group, lv_name));
        info!("Attached {} at {:?}", lv_name, record.device_path);
        Ok(record)
    }

    async fn detach_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        let binding = repo.overlay()?.clone();
        let lv_name = disk.backing.image.as_str();
        let mut record = disk.clone();

        let _volume = self.locks.volume(&binding.volume_group, lv_name).await?;
        let attached = self
            .attachments
            .count(&binding.volume_group, lv_name)
            .await?;

        if attached > 1 {
            record.state = DiskState::Attached.transition(DiskState::Detaching)?;
            let remaining = self
                .attachments
                .decrement(&binding.volume_group, lv_name)
                .await?;
            self.release(&binding).await?;
            debug!("{} stays active for {} more attach(es)", lv_name, remaining);
            record.state = record.state.transition(DiskState::Attached)?;
            record.device_path = Some(LvmClient::lv_path(&binding.volume_group, lv_name));
            return Ok(record);
        }

        self.lease(&binding).await?;
        let deactivated = async {
            let lv = self.require_volume(&binding, lv_name).await?;
            if lv.is_active() {
                self.volumes
                    .set_volume_active(&binding.conf_dir, &binding.volume_group, lv_name, false)
                    .await?;
            }
            Ok(())
        }
        .await;
        self.finish(&binding, deactivated).await?;

        if attached == 1 {
            self.attachments
                .decrement(&binding.volume_group, lv_name)
                .await?;
            // Drop the lease the attach kept.
            self.release(&binding).await?;
        }

        record.state = DiskState::Unattached;
        record.device_path = None;
        Ok(record)
    }

    async fn snapshot_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        self.copy_volume(repo, disk, true).await
    }

    async fn clone_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        self.copy_volume(repo, disk, false).await
    }
}
