//! Direct mode: one RBD image per virtual disk.

use crate::DiskDriver;
use crate::capacity::CapacityEstimator;
use crate::locks::ResourceLocks;
use crate::mapper::{DeviceMapper, MappingEntry};
use async_trait::async_trait;
use rbdsr_core::{
    CLONE_BASE_PREFIX, DiskState, IMAGE_PREFIX, ImageSpec, RepositoryRecord, Result,
    SHARABLE_META_KEY, SNAPSHOT_PREFIX, SrError, VirtualDiskRecord, backing_image_name,
    clone_base_name, parse_prefixed_id, snapshot_name,
};
use rbdsr_platform::RbdClient;
use rbdsr_platform::rbd::round_up_to_mib;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct RbdDiskController {
    rbd: RbdClient,
    capacity: Arc<CapacityEstimator>,
    mapper: Arc<DeviceMapper>,
    locks: Arc<ResourceLocks>,
}

fn disk_record(
    id: Uuid,
    backing: ImageSpec,
    size_bytes: u64,
    sharable: bool,
    parent: Option<ImageSpec>,
    mapping: Option<&MappingEntry>,
) -> VirtualDiskRecord {
    let attached = mapping.filter(|entry| entry.refcount > 0);
    VirtualDiskRecord {
        id,
        read_only: backing.is_snapshot(),
        backing,
        size_bytes,
        sharable,
        parent,
        state: if attached.is_some() {
            DiskState::Attached
        } else {
            DiskState::Unattached
        },
        device_path: attached.map(|entry| entry.device.clone()),
    }
}

impl RbdDiskController {
    pub fn new(
        rbd: RbdClient,
        capacity: Arc<CapacityEstimator>,
        mapper: Arc<DeviceMapper>,
        locks: Arc<ResourceLocks>,
    ) -> Self {
        Self {
            rbd,
            capacity,
            mapper,
            locks,
        }
    }

    pub fn mapper(&self) -> &Arc<DeviceMapper> {
        &self.mapper
    }

    fn pool(&self) -> &str {
        &self.rbd.pool().pool
    }

    /// Every virtual disk in the pool: `vdi-<uuid>` heads and `snap-<uuid>` snapshots.
    pub async fn scan(&self) -> Result<Vec<VirtualDiskRecord>> {
        let rows = self.rbd.list_long().await?;
        let mappings = self.mapper.entries().await?;
        let mapping_of = |spec: &ImageSpec| mappings.iter().find(|entry| &entry.image == spec);

        let mut disks = Vec::new();
        for row in rows {
            match &row.snapshot {
                None => {
                    let Some(id) = parse_prefixed_id(IMAGE_PREFIX, &row.image) else {
                        continue;
                    };
                    let spec = self.rbd.spec(&row.image);
                    let sharable = self.is_sharable(&row.image).await?;
                    disks.push(disk_record(
                        id,
                        spec.clone(),
                        row.size,
                        sharable,
                        row.parent.as_ref().map(|p| p.spec()),
                        mapping_of(&spec),
                    ));
                }
                Some(snap) => {
                    let Some(id) = parse_prefixed_id(SNAPSHOT_PREFIX, snap) else {
                        continue;
                    };
                    let parent = self.rbd.spec(&row.image);
                    let spec = parent.with_snapshot(snap);
                    disks.push(disk_record(
                        id,
                        spec.clone(),
                        row.size,
                        false,
                        Some(parent),
                        mapping_of(&spec),
                    ));
                }
            }
        }

        debug!("Found {} virtual disk(s) in pool {}", disks.len(), self.pool());
        Ok(disks)
    }

    async fn is_sharable(&self, image: &str) -> Result<bool> {
        Ok(self
            .rbd
            .meta_get(image, SHARABLE_META_KEY)
            .await?
            .is_some_and(|value| value == "true"))
    }

    async fn find_snapshot(&self, id: Uuid) -> Result<Option<VirtualDiskRecord>> {
        let name = snapshot_name(&id);
        let Some(row) = self
            .rbd
            .list_long()
            .await?
            .into_iter()
            .find(|row| row.snapshot.as_deref() == Some(name.as_str()))
        else {
            return Ok(None);
        };

        let parent = self.rbd.spec(&row.image);
        let spec = parent.with_snapshot(&name);
        let mapping = self.mapper.lookup(&spec).await?;
        Ok(Some(disk_record(
            id,
            spec,
            row.size,
            false,
            Some(parent),
            mapping.as_ref(),
        )))
    }

    /// Best-effort removal of a snapshot this controller created itself.
    async fn discard_snapshot(&self, snap: &ImageSpec) {
        if let Err(e) = self.rbd.snap_unprotect(snap).await {
            debug!("Unprotect of {} during cleanup: {}", snap, e);
        }
        if let Err(e) = self.rbd.snap_remove(snap).await {
            warn!("Failed to remove snapshot {}: {}", snap, e);
        }
    }

    /// Drop the implicit `base-` snapshot a clone was made from once nothing uses it.
    async fn release_clone_base(&self, parent: &ImageSpec) {
        let is_base = parent
            .snapshot
            .as_deref()
            .is_some_and(|snap| snap.starts_with(CLONE_BASE_PREFIX));
        if !is_base {
            return;
        }

        match self.rbd.children(parent).await {
            Ok(children) if children.is_empty() => {
                info!("Removing clone base snapshot {}", parent);
                self.discard_snapshot(parent).await;
            }
            Ok(_) => debug!("Clone base {} still has children", parent),
            Err(e) => warn!("Could not list children of {}: {}", parent, e),
        }
    }

    async fn delete_snapshot(&self, disk: &VirtualDiskRecord, force: bool) -> Result<()> {
        let snap = &disk.backing;
        let name = snap.snapshot.as_deref().unwrap_or_default();

        let snapshots = match self.rbd.snap_list(&snap.image).await {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(info) = snapshots.iter().find(|s| s.name == name) else {
            debug!("Snapshot {} already gone", snap);
            return Ok(());
        };

        if info.protected {
            let children = self.rbd.children(snap).await?;
            if !children.is_empty() {
                if !force {
                    return Err(SrError::HasClones {
                        image: snap.to_string(),
                        clones: children.iter().map(ToString::to_string).collect(),
                    });
                }
                for child in &children {
                    info!("Flattening {} before deleting {}", child, snap);
                    self.rbd.flatten(&child.image).await?;
                }
            }
            self.rbd.snap_unprotect(snap).await?;
        }

        self.rbd.snap_remove(snap).await
    }

    async fn delete_head(&self, disk: &VirtualDiskRecord, force: bool) -> Result<()> {
        let image = disk.backing.image.as_str();

        let snapshots = match self.rbd.snap_list(image).await {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_not_found() => {
                debug!("Image {} already gone", disk.backing);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Clients on other hosts hold a watch while they have the image open.
        let watchers = self.rbd.watchers(image).await?;
        if !watchers.is_empty() {
            return Err(SrError::StillMapped {
                image: format!("{} (watched by {})", disk.backing, watchers.join(", ")),
                refcount: watchers.len() as u32,
            });
        }

        let protected: Vec<ImageSpec> = snapshots
            .iter()
            .filter(|s| s.protected)
            .map(|s| disk.backing.with_snapshot(&s.name))
            .collect();

        let mut clones = Vec::new();
        for snap in &protected {
            clones.extend(self.rbd.children(snap).await?);
        }

        if !clones.is_empty() {
            if !force {
                return Err(SrError::HasClones {
                    image: disk.backing.to_string(),
                    clones: clones.iter().map(ToString::to_string).collect(),
                });
            }
            for clone in &clones {
                info!("Flattening {} so it survives deletion of {}", clone, disk.backing);
                self.rbd.flatten(&clone.image).await?;
            }
        }

        for snap in &protected {
            self.rbd.snap_unprotect(snap).await?;
        }
        if !snapshots.is_empty() {
            self.rbd.snap_purge(image).await?;
        }

        match self.rbd.remove(image).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Image {} already removed", disk.backing),
            Err(e) => return Err(e),
        }

        if let Some(parent) = &disk.parent {
            self.release_clone_base(parent).await;
        }
        Ok(())
    }
}

#[async_trait]
impl DiskDriver for RbdDiskController {
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

        let _pool = self.locks.pool(self.pool()).await?;
        let requested = round_up_to_mib(size_bytes);

        let stats = self.capacity.stat().await?;
        if let Some(limit) = stats.quota {
            if stats.used.saturating_add(requested) > limit {
                return Err(SrError::QuotaExceeded {
                    pool: self.pool().to_string(),
                    message: format!(
                        "{} bytes requested, {} of {} bytes already used",
                        requested, stats.used, limit
                    ),
                });
            }
        }

        let id = Uuid::new_v4();
        let name = backing_image_name(&id);
        info!(
            "Creating virtual disk {} ({} bytes) in repository {}",
            id, requested, repo.id
        );

        let size = match self.rbd.create(&name, requested).await {
            Ok(size) => size,
            Err(SrError::AlreadyExists { resource }) => {
                error!("Derived image name {} is already taken", resource);
                return Err(SrError::AlreadyExists { resource });
            }
            Err(e) => return Err(e),
        };

        if sharable {
            if let Err(e) = self.rbd.meta_set(&name, SHARABLE_META_KEY, "true").await {
                warn!("Marking {} sharable failed, removing it", name);
                if let Err(rollback) = self.rbd.remove(&name).await {
                    error!("Rollback of {} failed: {}", name, rollback);
                }
                return Err(e);
            }
        }

        Ok(disk_record(id, self.rbd.spec(&name), size, sharable, None, None))
    }

    async fn lookup_disk(&self, _repo: &RepositoryRecord, id: Uuid) -> Result<VirtualDiskRecord> {
        let head = self.rbd.spec(&backing_image_name(&id));
        match self.rbd.info(&head).await {
            Ok(info) => {
                let sharable = self.is_sharable(&head.image).await?;
                let mapping = self.mapper.lookup(&head).await?;
                Ok(disk_record(
                    id,
                    head,
                    info.size,
                    sharable,
                    info.parent.map(|p| p.spec()),
                    mapping.as_ref(),
                ))
            }
            Err(e) if e.is_not_found() => {
                self.find_snapshot(id)
                    .await?
                    .ok_or_else(|| SrError::NotFound {
                        resource: format!("virtual disk {id} in pool {}", self.pool()),
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_disk(
        &self,
        repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        force: bool,
    ) -> Result<()> {
        let _pool = self.locks.pool(self.pool()).await?;
        self.mapper
            .while_unmapped(&disk.backing, || async {
                info!("Deleting virtual disk {} from repository {}", disk.id, repo.id);
                if disk.backing.is_snapshot() {
                    self.delete_snapshot(disk, force).await
                } else {
                    self.delete_head(disk, force).await
                }
            })
            .await
    }

    async fn resize_disk(
        &self,
        _repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
        size_bytes: u64,
        force: bool,
    ) -> Result<VirtualDiskRecord> {
        if disk.backing.is_snapshot() {
            return Err(SrError::Unsupported(format!(
                "snapshot {} cannot be resized",
                disk.backing
            )));
        }

        let _guard = self.locks.image(&disk.backing).await?;
        let requested = round_up_to_mib(size_bytes);
        let current = self.rbd.info(&disk.backing).await?.size;

        let mut record = disk.clone();
        if requested == current {
            record.size_bytes = current;
            return Ok(record);
        }

        let shrink = requested < current;
        if shrink {
            if !force {
                return Err(SrError::ShrinkRejected {
                    image: disk.backing.to_string(),
                    current,
                    requested,
                    reason: "shrinking discards data and needs force".to_string(),
                });
            }
            let usage = self.rbd.disk_usage(&disk.backing.image).await?;
            if requested < usage.used {
                return Err(SrError::ShrinkRejected {
                    image: disk.backing.to_string(),
                    current,
                    requested,
                    reason: format!("the cluster reports {} bytes in use", usage.used),
                });
            }
            warn!("Shrinking {} from {} to {} bytes", disk.backing, current, requested);
        } else {
            info!("Growing {} from {} to {} bytes", disk.backing, current, requested);
        }

        record.size_bytes = self
            .rbd
            .resize(&disk.backing.image, requested, shrink)
            .await?;
        Ok(record)
    }

    async fn attach_disk(
        &self,
        _repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        let mut record = disk.clone();
        record.state = record.state.transition(DiskState::Attaching)?;

        let read_only = disk.read_only || disk.backing.is_snapshot();
        let exclusive = !disk.sharable && !read_only;

        match self.mapper.map(&disk.backing, read_only, exclusive).await {
            Ok(device) => {
                record.state = record.state.transition(DiskState::Attached)?;
                record.device_path = Some(device);
                Ok(record)
            }
            Err(e) => {
                warn!("Attach of {} failed: {}", disk.backing, e);
                Err(e)
            }
        }
    }

    async fn detach_disk(
        &self,
        _repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        let mut record = disk.clone();
        if self.mapper.refcount(&disk.backing).await? == 0 {
            debug!("{} is not attached", disk.backing);
            record.state = DiskState::Unattached;
            record.device_path = None;
            return Ok(record);
        }

        record.state = DiskState::Attached.transition(DiskState::Detaching)?;
        let remaining = self.mapper.unmap(&disk.backing).await?;
        if remaining == 0 {
            record.state = record.state.transition(DiskState::Unattached)?;
            record.device_path = None;
        } else {
            record.state = record.state.transition(DiskState::Attached)?;
        }
        Ok(record)
    }

    async fn snapshot_disk(
        &self,
        _repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        if disk.backing.is_snapshot() {
            return Err(SrError::Unsupported(format!(
                "{} is already a snapshot",
                disk.backing
            )));
        }

        let id = Uuid::new_v4();
        let snap = disk.backing.with_snapshot(&snapshot_name(&id));
        self.rbd.snap_create(&snap).await?;
        if let Err(e) = self.rbd.snap_protect(&snap).await {
            warn!("Protecting {} failed, removing it", snap);
            self.discard_snapshot(&snap).await;
            return Err(e);
        }

        match self.rbd.info(&snap).await {
            Ok(info) => Ok(disk_record(
                id,
                snap,
                info.size,
                false,
                Some(disk.backing.clone()),
                None,
            )),
            Err(e) => {
                warn!("Reading back {} failed, removing it", snap);
                self.discard_snapshot(&snap).await;
                Err(e)
            }
        }
    }

    async fn clone_disk(
        &self,
        _repo: &RepositoryRecord,
        disk: &VirtualDiskRecord,
    ) -> Result<VirtualDiskRecord> {
        let id = Uuid::new_v4();
        let dest = backing_image_name(&id);

        let (source, implicit) = if disk.backing.is_snapshot() {
            (disk.backing.clone(), false)
        } else {
            let base = disk.backing.with_snapshot(&clone_base_name(&id));
            self.rbd.snap_create(&base).await?;
            (base, true)
        };

        let cloned = async {
            self.rbd.snap_protect(&source).await?;
            self.rbd.clone_image(&source, &dest).await
        }
        .await;

        if let Err(e) = cloned {
            if implicit {
                self.discard_snapshot(&source).await;
            }
            return Err(e);
        }

        info!("Cloned {} from {}", dest, source);
        let spec = self.rbd.spec(&dest);
        match self.rbd.info(&spec).await {
            Ok(info) => Ok(disk_record(id, spec, info.size, false, Some(source), None)),
            Err(e) => {
                warn!("Reading back {} failed, removing the clone", spec);
                if let Err(rollback) = self.rbd.remove(&dest).await {
                    error!("Rollback of {} failed: {}", dest, rollback);
                }
                if implicit {
                    self.discard_snapshot(&source).await;
                }
                Err(e)
            }
        }
    }
}
