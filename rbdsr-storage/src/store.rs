use rbdsr_core::{RepositoryRecord, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Last known repository records, one JSON file per repository.
pub struct RepositoryStore {
    dir: PathBuf,
}

impl RepositoryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn load(&self, id: &Uuid) -> Result<Option<RepositoryRecord>> {
        let path = self.path(id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub async fn save(&self, record: &RepositoryRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path(&record.id), &content).await?;
        debug!("Saved repository record {}", record.id);
        Ok(())
    }

    pub async fn remove(&self, id: &Uuid) -> Result<()> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<RepositoryRecord>> {
        let mut records = Vec::new();
        if !fs::try_exists(&self.dir).await? {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            records.push(serde_json::from_str(&content)?);
        }
        Ok(records)
    }
}

/// Write to a sibling temporary file and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
