use crate::command::Tool;
use crate::{Gateway, cluster_args, parse_json_or_default};
use rbdsr_core::{PoolReference, Result, SrError};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct PoolQuota {
    #[serde(rename = "quota_max_bytes", default)]
    pub max_bytes: u64,
    /// Not reported by every release.
    #[serde(rename = "current_num_bytes", default)]
    pub current_bytes: Option<u64>,
}

impl PoolQuota {
    /// A zero `max_bytes` means no quota is set.
    pub fn limit(&self) -> Option<u64> {
        (self.max_bytes > 0).then_some(self.max_bytes)
    }
}

/// Per-pool figures from `ceph df detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolUsage {
    /// Logical bytes stored, before replication. Older releases only
    /// report raw `bytes_used`, which stands in for it.
    pub stored: u64,
    /// Space still writable into this pool given its redundancy rule.
    pub max_avail: u64,
}

#[derive(Debug, Deserialize)]
struct DfReport {
    #[serde(default)]
    pools: Vec<DfPool>,
}

#[derive(Debug, Deserialize)]
struct DfPool {
    name: String,
    stats: DfPoolStats,
}

#[derive(Debug, Deserialize)]
struct DfPoolStats {
    #[serde(default)]
    stored: Option<u64>,
    #[serde(default)]
    bytes_used: u64,
    #[serde(default)]
    max_avail: u64,
}

/// Typed wrapper over the `ceph` tool, scoped to one pool.
#[derive(Clone)]
pub struct CephClient {
    gateway: Gateway,
    pool: PoolReference,
}

impl CephClient {
    pub fn new(gateway: Gateway, pool: PoolReference) -> Self {
        Self { gateway, pool }
    }

    async fn run(&self, operation: &str, target: &str, args: &[&str]) -> Result<String> {
        let mut full = cluster_args(&self.pool);
        full.extend(args.iter().map(|arg| arg.to_string()));
        let invocation = self.gateway.invocation(Tool::Ceph, full, Vec::new());
        self.gateway
            .run_retrying(&invocation, operation, target)
            .await
    }

    fn pool_missing(&self, error: SrError) -> SrError {
        match error {
            SrError::NotFound { .. } => SrError::PoolNotFound {
                pool: self.pool.pool.clone(),
                detail: "the cluster does not know this pool".to_string(),
            },
            other => other,
        }
    }

    /// Cluster health summary, e.g. `HEALTH_OK`. Also proves authentication works.
    pub async fn health(&self) -> Result<String> {
        let stdout = self.run("cluster health", "cluster", &["health"]).await?;
        let health = stdout.trim().to_string();
        debug!("Cluster health: {}", health);
        Ok(health)
    }

    /// Fails with `PoolNotFound` if the pool does not exist.
    pub async fn pool_stats(&self) -> Result<serde_json::Value> {
        let pool = self.pool.pool.as_str();
        let stdout = self
            .run("pool stats", pool, &["osd", "pool", "stats", pool, "--format", "json"])
            .await
            .map_err(|e| self.pool_missing(e))?;
        parse_json_or_default(&stdout)
    }

    pub async fn list_pools(&self) -> Result<Vec<String>> {
        let stdout = self
            .run("list pools", "cluster", &["osd", "pool", "ls", "--format", "json"])
            .await?;
        parse_json_or_default(&stdout)
    }

    pub async fn get_quota(&self) -> Result<PoolQuota> {
        let pool = self.pool.pool.as_str();
        let stdout = self
            .run(
                "get pool quota",
                pool,
                &["osd", "pool", "get-quota", pool, "--format", "json"],
            )
            .await
            .map_err(|e| self.pool_missing(e))?;
        parse_json_or_default(&stdout)
    }

    /// Zero clears the quota.
    pub async fn set_quota(&self, max_bytes: u64) -> Result<()> {
        let pool = self.pool.pool.as_str();
        let value = max_bytes.to_string();
        info!("Setting quota of pool {} to {} bytes", pool, max_bytes);
        self.run(
            "set pool quota",
            pool,
            &["osd", "pool", "set-quota", pool, "max_bytes", &value],
        )
        .await
        .map_err(|e| self.pool_missing(e))?;
        Ok(())
    }

    /// This pool's row of `ceph df detail`.
    pub async fn pool_usage(&self) -> Result<PoolUsage> {
        let pool = self.pool.pool.as_str();
        let stdout = self
            .run("pool usage", pool, &["df", "detail", "--format", "json"])
            .await?;
        let report: DfReport = serde_json::from_str(stdout.trim())?;

        let entry = report
            .pools
            .into_iter()
            .find(|entry| entry.name == pool)
            .ok_or_else(|| SrError::PoolNotFound {
                pool: pool.to_string(),
                detail: "pool missing from ceph df".to_string(),
            })?;

        Ok(PoolUsage {
            stored: entry.stats.stored.unwrap_or(entry.stats.bytes_used),
            max_avail: entry.stats.max_avail,
        })
    }
}
