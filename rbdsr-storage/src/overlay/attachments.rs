//! How many times each logical volume is attached on this host.
//!
//! Every attach of a volume keeps one lease on the backing image, so the
//! count is also the number of leases its detaches still have to give back.
//! Counts live under `<state_dir>/attachments/<vg>/<lv>.json`. Callers hold
//! the volume lock while reading and updating a count.

use crate::store::write_atomic;
use chrono::{DateTime, Utc};
use rbdsr_core::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttachEntry {
    count: u32,
    updated_at: DateTime<Utc>,
}

pub struct AttachCounts {
    dir: PathBuf,
}

impl AttachCounts {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, vg: &str, lv: &str) -> PathBuf {
        self.dir.join(vg).join(format!("{lv}.json"))
    }

    pub async fn count(&self, vg: &str, lv: &str) -> Result<u32> {
        let path = self.path(vg, lv);
        if !fs::try_exists(&path).await? {
            return Ok(0);
        }
        let content = fs::read(&path).await?;
        let entry: AttachEntry = serde_json::from_slice(&content)?;
        Ok(entry.count)
    }

    pub async fn increment(&self, vg: &str, lv: &str) -> Result<u32> {
        let count = self.count(vg, lv).await? + 1;
        self.store(vg, lv, count).await?;
        debug!("{}/{} attached {} time(s)", vg, lv, count);
        Ok(count)
    }

    /// Returns the attaches left. Never goes below zero.
    pub async fn decrement(&self, vg: &str, lv: &str) -> Result<u32> {
        let count = self.count(vg, lv).await?.saturating_sub(1);
        if count == 0 {
            self.clear_volume(vg, lv).await?;
        } else {
            self.store(vg, lv, count).await?;
        }
        Ok(count)
    }

    pub async fn clear_volume(&self, vg: &str, lv: &str) -> Result<()> {
        remove_if_exists(&self.path(vg, lv)).await
    }

    /// Forget every volume of `vg`, after its group was deactivated as a whole.
    pub async fn clear_group(&self, vg: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir.join(vg)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, vg: &str, lv: &str, count: u32) -> Result<()> {
        let entry = AttachEntry {
            count,
            updated_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&self.path(vg, lv), &content).await
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
