//! Resource-scoped mutual exclusion.
//!
//! A lock is held both in-process (a tokio mutex per key) and across
//! processes (an exclusive `flock` on `<locks_dir>/<key>.lock`). Each
//! driver invocation runs in its own process, so the file lock is what
//! serializes concurrent operations on one host.

use nix::fcntl::{Flock, FlockArg};
use rbdsr_core::{ImageSpec, Result, SrError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// In-process mutexes by key. An entry lives only while a guard holds it or
/// a task waits on it.
type HeldLocks = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

pub struct ResourceLocks {
    dir: PathBuf,
    held: HeldLocks,
}

/// Released on drop, file lock first.
pub struct ResourceGuard {
    key: String,
    file: Option<Flock<File>>,
    local: Option<OwnedMutexGuard<()>>,
    held: HeldLocks,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.file.take());
        drop(self.local.take());
        evict_idle(&self.held, &self.key);
    }
}

impl ResourceLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            held: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Serializes map, unmap and resize of one image or snapshot.
    pub async fn image(&self, spec: &ImageSpec) -> Result<ResourceGuard> {
        self.acquire(format!("image:{spec}")).await
    }

    /// Serializes quota-affecting operations (create, delete) within a pool.
    pub async fn pool(&self, pool: &str) -> Result<ResourceGuard> {
        self.acquire(format!("pool:{pool}")).await
    }

    /// Serializes attach, detach and delete of one logical volume.
    pub async fn volume(&self, vg: &str, lv: &str) -> Result<ResourceGuard> {
        self.acquire(format!("volume:{vg}/{lv}")).await
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn acquire(&self, key: String) -> Result<ResourceGuard> {
        let local = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.entry(key.clone()).or_default().clone()
        };
        let local = local.lock_owned().await;

        let path = self.dir.join(format!("{}.lock", escape_key(&key)));
        let locked = match tokio::task::spawn_blocking(move || lock_file(&path)).await {
            Ok(locked) => locked.map_err(SrError::from),
            Err(e) => Err(SrError::Other(e.into())),
        };
        let file = match locked {
            Ok(file) => file,
            Err(e) => {
                drop(local);
                evict_idle(&self.held, &key);
                return Err(e);
            }
        };

        debug!("Acquired lock {}", key);
        Ok(ResourceGuard {
            key,
            file: Some(file),
            local: Some(local),
            held: self.held.clone(),
        })
    }
}

fn evict_idle(held: &HeldLocks, key: &str) {
    let mut held = held.lock().unwrap_or_else(PoisonError::into_inner);
    if held
        .get(key)
        .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
    {
        held.remove(key);
    }
}

fn lock_file(path: &Path) -> std::io::Result<Flock<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| std::io::Error::from(errno))
}

/// Make a lock key or image spec usable as a single file name.
pub(crate) fn escape_key(key: &str) -> String {
    key.replace('%', "%25")
        .replace('/', "%2F")
        .replace('@', "%40")
}
