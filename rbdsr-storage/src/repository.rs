use crate::capacity::CapacityEstimator;
use crate::disk::RbdDiskController;
use crate::store::RepositoryStore;
use crate::{DiskDriver, RepositoryDriver};
use async_trait::async_trait;
use rbdsr_core::{
    DriverKind, IMAGE_PREFIX, PoolReference, ProbeReport, ProbedImage, RepositoryRecord, Result,
    SrError, VirtualDiskRecord, parse_prefixed_id,
};
use rbdsr_platform::{CephClient, RbdClient};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Direct mode repository: a pool whose `vdi-` images are the virtual disks.
pub struct RbdRepository {
    pool: PoolReference,
    ceph: CephClient,
    rbd: RbdClient,
    capacity: Arc<CapacityEstimator>,
    disks: Arc<RbdDiskController>,
    store: RepositoryStore,
}

impl RbdRepository {
    pub fn new(
        pool: PoolReference,
        ceph: CephClient,
        rbd: RbdClient,
        capacity: Arc<CapacityEstimator>,
        disks: Arc<RbdDiskController>,
        store: RepositoryStore,
    ) -> Self {
        Self {
            pool,
            ceph,
            rbd,
            capacity,
            disks,
            store,
        }
    }

    /// Connectivity and pool existence, in that order.
    async fn verify_pool(&self) -> Result<()> {
        let health = self.ceph.health().await?;
        if !health.starts_with("HEALTH_OK") {
            warn!("Cluster reports {}", health);
        }
        self.ceph.pool_stats().await?;
        Ok(())
    }

    async fn refresh(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        let mut record = repo.clone();
        record.update_stats(self.capacity.stat().await?);
        record.update_allocation(&self.disks.scan().await?);
        self.store.save(&record).await?;
        Ok(record)
    }
}

#[async_trait]
impl RepositoryDriver for RbdRepository {
    fn kind(&self) -> DriverKind {
        DriverKind::Rbd
    }

    async fn open(&self, id: Uuid) -> Result<RepositoryRecord> {
        match self.store.load(&id).await? {
            Some(record) if record.pool.pool != self.pool.pool => {
                Err(SrError::ConfigInvalid(format!(
                    "repository {id} lives in pool {}, not {}",
                    record.pool.pool, self.pool.pool
                )))
            }
            Some(record) if record.overlay.is_some() => Err(SrError::ConfigInvalid(format!(
                "repository {id} is a volume-group repository"
            ))),
            Some(record) => Ok(record),
            None => Ok(RepositoryRecord::new(id, self.pool.clone(), None)),
        }
    }

    async fn create(&self, id: Uuid) -> Result<RepositoryRecord> {
        info!("Creating repository {} on pool {}", id, self.pool.pool);
        self.verify_pool().await?;
        let record = self.open(id).await?;
        self.refresh(&record).await
    }

    async fn delete(&self, repo: &RepositoryRecord, force: bool) -> Result<()> {
        let disks = self.disks.scan().await?;
        if !disks.is_empty() && !force {
            return Err(SrError::NotEmpty {
                repository: repo.id.to_string(),
                count: disks.len(),
            });
        }

        info!(
            "Deleting repository {} ({} virtual disk(s))",
            repo.id,
            disks.len()
        );

        let mapper = self.disks.mapper();
        for entry in mapper.entries().await? {
            mapper.force_unmap(&entry.image).await?;
        }
        for disk in &disks {
            mapper.force_unmap(&disk.backing).await?;
        }

        for disk in disks.iter().filter(|d| !d.backing.is_snapshot()) {
            match self.disks.delete_disk(repo, disk, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.store.remove(&repo.id).await
    }

    async fn attach(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        info!("Attaching repository {}", repo.id);
        self.verify_pool().await?;
        self.refresh(repo).await
    }

    async fn detach(&self, repo: &RepositoryRecord, force: bool) -> Result<()> {
        let mapper = self.disks.mapper();
        let held: Vec<_> = mapper
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.refcount > 0)
            .collect();

        if let Some(first) = held.first() {
            if !force {
                return Err(SrError::StillMapped {
                    image: first.image.to_string(),
                    refcount: first.refcount,
                });
            }
        }

        for entry in &held {
            warn!("Releasing {} while detaching repository {}", entry.image, repo.id);
            mapper.force_unmap(&entry.image).await?;
        }
        info!("Detached repository {}", repo.id);
        Ok(())
    }

    async fn scan(&self, repo: &RepositoryRecord) -> Result<Vec<VirtualDiskRecord>> {
        let disks = self.disks.scan().await?;
        if self.store.load(&repo.id).await?.is_some() {
            let mut record = repo.clone();
            record.update_allocation(&disks);
            self.store.save(&record).await?;
        }
        Ok(disks)
    }

    async fn stat(&self, repo: &RepositoryRecord) -> Result<RepositoryRecord> {
        self.refresh(repo).await
    }

    async fn probe(&self) -> Result<ProbeReport> {
        let pools = self.ceph.list_pools().await?;
        let pool_exists = pools.contains(&self.pool.pool);

        let images = if pool_exists {
            self.rbd
                .list_long()
                .await?
                .into_iter()
                .filter(|row| row.snapshot.is_none())
                .map(|row| ProbedImage {
                    disk_id: parse_prefixed_id(IMAGE_PREFIX, &row.image),
                    name: row.image,
                    size_bytes: row.size,
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(ProbeReport {
            pools,
            pool_exists,
            images,
            volume_groups: Vec::new(),
        })
    }

    async fn set_quota(&self, repo: &RepositoryRecord, max_bytes: u64) -> Result<RepositoryRecord> {
        self.ceph.set_quota(max_bytes).await?;
        self.refresh(repo).await
    }

    async fn extend(&self, _repo: &RepositoryRecord, _size: &str) -> Result<RepositoryRecord> {
        Err(SrError::Unsupported(
            "a direct-mode repository grows with its pool; set a quota instead".to_string(),
        ))
    }
}
