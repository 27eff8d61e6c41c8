//! Local kernel mappings of RBD images, reference counted per image.
//!
//! The table is persisted under `<state_dir>/mappings`, one file per image,
//! and reconciled against `rbd showmapped` the first time it is used in a
//! process. Live kernel state always wins over the persisted table.

use crate::locks::{ResourceLocks, escape_key};
use crate::store::write_atomic;
use chrono::{DateTime, Utc};
use rbdsr_core::{ImageSpec, Result, SrError};
use rbdsr_platform::RbdClient;
use rbdsr_platform::rbd::MappedDevice;
use rbdsr_platform::retry::{RetryConfig, retry_with_backoff};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub image: ImageSpec,
    pub device: PathBuf,
    pub refcount: u32,
    pub read_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl MappingEntry {
    fn new(image: ImageSpec, device: PathBuf, read_only: bool) -> Self {
        Self {
            image,
            device,
            refcount: 1,
            read_only,
            updated_at: Utc::now(),
        }
    }
}

/// Device mapping table for one pool.
pub struct DeviceMapper {
    rbd: RbdClient,
    dir: PathBuf,
    locks: Arc<ResourceLocks>,
    retry: RetryConfig,
    settle_timeout: Option<Duration>,
    table: RwLock<HashMap<ImageSpec, MappingEntry>>,
    reconciled: OnceCell<()>,
}

impl DeviceMapper {
    pub fn new(
        rbd: RbdClient,
        dir: PathBuf,
        locks: Arc<ResourceLocks>,
        retry: RetryConfig,
        settle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            rbd,
            dir,
            locks,
            retry,
            settle_timeout,
            table: RwLock::new(HashMap::new()),
            reconciled: OnceCell::new(),
        }
    }

    fn pool(&self) -> &str {
        &self.rbd.pool().pool
    }

    fn entry_path(&self, spec: &ImageSpec) -> PathBuf {
        self.dir
            .join(format!("{}.json", escape_key(&spec.to_string())))
    }

    /// Map `spec`, or take another reference on an existing mapping.
    pub async fn map(&self, spec: &ImageSpec, read_only: bool, exclusive: bool) -> Result<PathBuf> {
        self.reconcile().await?;
        let _guard = self.locks.image(spec).await?;

        if let Some(mut entry) = self.load_entry(spec).await?.filter(|e| e.refcount > 0) {
            entry.refcount += 1;
            entry.updated_at = Utc::now();
            debug!(
                "{} already mapped at {}, refcount now {}",
                spec,
                entry.device.display(),
                entry.refcount
            );
            let device = entry.device.clone();
            self.save_entry(entry).await?;
            return Ok(device);
        }

        let device = match self.live_devices(spec).await?.into_iter().next() {
            Some(device) => {
                info!("Adopting existing mapping of {} at {}", spec, device.display());
                device
            }
            None => {
                let device = retry_with_backoff(&self.retry, "map image", || {
                    self.rbd.map(spec, read_only, exclusive)
                })
                .await?;
                info!("Mapped {} at {}", spec, device.display());

                if let Some(timeout) = self.settle_timeout {
                    if let Err(e) = wait_for_device(&device, timeout).await {
                        warn!("Device {} never appeared, unmapping", device.display());
                        if let Err(cleanup) = self.rbd.unmap(&device).await {
                            warn!("Failed to unmap {}: {}", device.display(), cleanup);
                        }
                        return Err(e);
                    }
                }
                device
            }
        };

        self.save_entry(MappingEntry::new(spec.clone(), device.clone(), read_only))
            .await?;
        Ok(device)
    }

    /// Drop one reference; the kernel mapping goes away with the last one.
    /// Returns the references still held.
    pub async fn unmap(&self, spec: &ImageSpec) -> Result<u32> {
        self.unmap_with(spec, || async { Ok(()) }).await
    }

    /// `unmap`, running `before_last` under the image lock when this is the
    /// last reference. No other mapping of `spec` can be taken until both
    /// `before_last` and the kernel unmap are done. If `before_last` fails the
    /// reference is kept.
    pub async fn unmap_with<F, Fut>(&self, spec: &ImageSpec, before_last: F) -> Result<u32>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.reconcile().await?;
        let _guard = self.locks.image(spec).await?;

        let Some(mut entry) = self.load_entry(spec).await? else {
            debug!("{} is not mapped, nothing to unmap", spec);
            return Ok(0);
        };

        if entry.refcount > 1 {
            entry.refcount -= 1;
            entry.updated_at = Utc::now();
            let remaining = entry.refcount;
            debug!("{} still has {} reference(s)", spec, remaining);
            self.save_entry(entry).await?;
            return Ok(remaining);
        }

        before_last().await?;
        self.release_device(spec, &entry.device).await?;
        self.remove_entry(spec).await?;
        info!("Unmapped {} from {}", spec, entry.device.display());
        Ok(0)
    }

    /// Run `f` holding the image lock of `spec`, once no reference and no
    /// kernel mapping of it exist on this host. Nothing can map `spec` while
    /// `f` runs.
    pub async fn while_unmapped<T, F, Fut>(&self, spec: &ImageSpec, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.reconcile().await?;
        let _guard = self.locks.image(spec).await?;

        let refcount = self
            .load_entry(spec)
            .await?
            .map(|entry| entry.refcount)
            .unwrap_or(0);
        let live = self.live_devices(spec).await?.len() as u32;
        if refcount > 0 || live > 0 {
            return Err(SrError::StillMapped {
                image: spec.to_string(),
                refcount: refcount.max(live),
            });
        }
        f().await
    }

    /// Remove every kernel mapping of `spec` regardless of references.
    /// The caller must already know that nothing is using the device.
    pub async fn force_unmap(&self, spec: &ImageSpec) -> Result<bool> {
        self.reconcile().await?;
        let _guard = self.locks.image(spec).await?;

        let devices = self.live_devices(spec).await?;
        let unmapped = !devices.is_empty();
        for device in &devices {
            warn!("Force unmapping {} from {}", spec, device.display());
            self.release_device(spec, device).await?;
        }

        self.remove_entry(spec).await?;
        Ok(unmapped)
    }

    pub async fn refcount(&self, spec: &ImageSpec) -> Result<u32> {
        self.reconcile().await?;
        Ok(self
            .load_entry(spec)
            .await?
            .map(|entry| entry.refcount)
            .unwrap_or(0))
    }

    pub async fn lookup(&self, spec: &ImageSpec) -> Result<Option<MappingEntry>> {
        self.reconcile().await?;
        self.load_entry(spec).await
    }

    /// Every mapping of this pool, as currently known.
    pub async fn entries(&self) -> Result<Vec<MappingEntry>> {
        self.reconcile().await?;
        let mut entries: Vec<MappingEntry> = self.table.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.image.cmp(&b.image));
        Ok(entries)
    }

    /// Bring the persisted table in line with the kernel, once per process.
    async fn reconcile(&self) -> Result<()> {
        self.reconciled
            .get_or_try_init(|| async {
                let live: Vec<MappedDevice> = self
                    .rbd
                    .show_mapped()
                    .await?
                    .into_iter()
                    .filter(|mapped| mapped.pool == self.pool())
                    .collect();
                let persisted = self.read_persisted().await?;

                let mut table = HashMap::new();
                for mut entry in persisted {
                    match live.iter().find(|mapped| mapped.spec() == entry.image) {
                        Some(mapped) => {
                            if entry.device != mapped.device {
                                info!(
                                    "{} moved from {} to {}",
                                    entry.image,
                                    entry.device.display(),
                                    mapped.device.display()
                                );
                                entry.device = mapped.device.clone();
                            }
                            entry.refcount = entry.refcount.max(1);
                            let content = serde_json::to_vec_pretty(&entry)?;
                            write_atomic(&self.entry_path(&entry.image), &content).await?;
                            table.insert(entry.image.clone(), entry);
                        }
                        None => {
                            info!("Dropping stale mapping of {} (no longer mapped)", entry.image);
                            remove_file_if_exists(&self.entry_path(&entry.image)).await?;
                        }
                    }
                }

                for mapped in &live {
                    let spec = mapped.spec();
                    if table.contains_key(&spec) {
                        continue;
                    }
                    warn!(
                        "Adopting unrecorded mapping of {} at {}",
                        spec,
                        mapped.device.display()
                    );
                    let entry =
                        MappingEntry::new(spec.clone(), mapped.device.clone(), spec.is_snapshot());
                    let content = serde_json::to_vec_pretty(&entry)?;
                    write_atomic(&self.entry_path(&spec), &content).await?;
                    table.insert(spec, entry);
                }

                debug!("Reconciled {} mapping(s) in pool {}", table.len(), self.pool());
                *self.table.write().await = table;
                Ok::<(), SrError>(())
            })
            .await?;
        Ok(())
    }

    async fn read_persisted(&self) -> Result<Vec<MappingEntry>> {
        let mut entries = Vec::new();
        if !fs::try_exists(&self.dir).await? {
            return Ok(entries);
        }

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<MappingEntry>(&content) {
                Ok(entry) if entry.image.pool == self.pool() => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable mapping file {}: {}", path.display(), e),
            }
        }
        Ok(entries)
    }

    /// The on-disk entry is authoritative; another process may have changed it.
    async fn load_entry(&self, spec: &ImageSpec) -> Result<Option<MappingEntry>> {
        let path = self.entry_path(spec);
        if !fs::try_exists(&path).await? {
            self.table.write().await.remove(spec);
            return Ok(None);
        }
        let entry: MappingEntry = serde_json::from_str(&fs::read_to_string(&path).await?)?;
        self.table.write().await.insert(spec.clone(), entry.clone());
        Ok(Some(entry))
    }

    async fn save_entry(&self, entry: MappingEntry) -> Result<()> {
        write_atomic(
            &self.entry_path(&entry.image),
            &serde_json::to_vec_pretty(&entry)?,
        )
        .await?;
        self.table.write().await.insert(entry.image.clone(), entry);
        Ok(())
    }

    async fn remove_entry(&self, spec: &ImageSpec) -> Result<()> {
        remove_file_if_exists(&self.entry_path(spec)).await?;
        self.table.write().await.remove(spec);
        Ok(())
    }

    async fn live_devices(&self, spec: &ImageSpec) -> Result<Vec<PathBuf>> {
        Ok(self
            .rbd
            .show_mapped()
            .await?
            .into_iter()
            .filter(|mapped| &mapped.spec() == spec)
            .map(|mapped| mapped.device)
            .collect())
    }

    /// Unmap with backoff. A failure is forgiven if the device is gone anyway.
    async fn release_device(&self, spec: &ImageSpec, device: &Path) -> Result<()> {
        let result =
            retry_with_backoff(&self.retry, "unmap device", || self.rbd.unmap(device)).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.live_devices(spec).await?.iter().any(|d| d == device) {
                    Err(e)
                } else {
                    warn!(
                        "Unmap of {} failed but it is no longer mapped: {}",
                        device.display(),
                        e
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn wait_for_device(device: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if fs::try_exists(device).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SrError::Timeout {
                operation: "wait for device".to_string(),
                target: device.display().to_string(),
                seconds: timeout.as_secs(),
            });
        }
        tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
