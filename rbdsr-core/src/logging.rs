//! Per-repository operation log at `<log_dir>/<repository>.log`.
//!
//! One line per driver operation, success or failure:
//!
//! ```text
//! 2026-10-19T08:12:03.114Z OK     vdi_create 5f0c... size=1073741824 sharable=false
//! 2026-10-19T08:12:09.870Z FAILED vdi_delete StillMapped: Image vms/vdi-5f0c... is still mapped
//! ```

use crate::{Result, SrError};
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub struct OperationLog {
    path: PathBuf,
}

impl OperationLog {
    pub fn new(log_dir: &Path, repository: &Uuid) -> Self {
        Self {
            path: log_dir.join(format!("{repository}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn succeeded(&self, operation: &str, detail: &str) -> Result<()> {
        let line = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{operation} {detail}")
        };
        self.append("OK    ", &line).await
    }

    /// Records the error's kind so failures can be grepped by class.
    pub async fn failed(&self, operation: &str, error: &SrError) -> Result<()> {
        let line = format!("{operation} {}: {error}", error.kind());
        self.append("FAILED", &line).await
    }

    async fn append(&self, outcome: &str, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let entry = format!(
            "{} {} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            outcome,
            line.replace('\n', " ")
        );

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
