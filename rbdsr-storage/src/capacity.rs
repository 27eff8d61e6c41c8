use rbdsr_core::{CapacityStats, Result, SrError};
use rbdsr_platform::CephClient;
use rbdsr_platform::ceph::PoolUsage;
use tracing::debug;

/// Capacity, used and free bytes of a pool as the host should see them.
pub struct CapacityEstimator {
    ceph: CephClient,
}

impl CapacityEstimator {
    pub fn new(ceph: CephClient) -> Self {
        Self { ceph }
    }

    pub async fn stat(&self) -> Result<CapacityStats> {
        let quota = self.ceph.get_quota().await?;

        let usage = match self.ceph.pool_usage().await {
            Ok(usage) => Some(usage),
            // A freshly created pool may not be in `ceph df` yet.
            Err(SrError::PoolNotFound { .. }) => {
                self.ceph.pool_stats().await?;
                None
            }
            Err(e) => return Err(e),
        };

        let stats = estimate(quota.limit(), quota.current_bytes, usage.as_ref());
        debug!(
            "Pool capacity {} used {} free {} (quota {:?})",
            stats.capacity, stats.used, stats.free, stats.quota
        );
        Ok(stats)
    }
}

/// With a quota the quota is the capacity. Without one, capacity is what the
/// pool already stores plus what its redundancy rule still lets it write, so
/// that free equals the cluster's `max_avail`. Used is the stored (thin) size.
pub fn estimate(
    quota: Option<u64>,
    quota_current: Option<u64>,
    usage: Option<&PoolUsage>,
) -> CapacityStats {
    let stored = usage.map(|u| u.stored).or(quota_current).unwrap_or(0);
    match quota {
        Some(limit) => CapacityStats::new(limit, stored, Some(limit)),
        None => {
            let max_avail = usage.map(|u| u.max_avail).unwrap_or(0);
            CapacityStats::new(max_avail.saturating_add(stored), stored, None)
        }
    }
}
