use super::{GIB, TestHost, pool_ref};
use crate::capacity::{CapacityEstimator, estimate};
use rbdsr_core::{CapacityStats, ErrorKind, Result};
use rbdsr_platform::ceph::PoolUsage;

fn usage(stored: u64, max_avail: u64) -> PoolUsage {
    PoolUsage { stored, max_avail }
}

#[test]
fn test_estimate_with_quota() {
    let stats = estimate(Some(100 * GIB), None, Some(&usage(30 * GIB, 400 * GIB)));
    assert_eq!(stats, CapacityStats::new(100 * GIB, 30 * GIB, Some(100 * GIB)));
    assert_eq!(stats.free, 70 * GIB);
}

#[test]
fn test_estimate_without_quota_reports_max_avail_as_free() {
    let stats = estimate(None, None, Some(&usage(30 * GIB, 400 * GIB)));
    assert_eq!(stats.capacity, 430 * GIB);
    assert_eq!(stats.used, 30 * GIB);
    assert_eq!(stats.free, 400 * GIB);
    assert_eq!(stats.quota, None);
}

#[test]
fn test_estimate_over_quota_saturates() {
    let stats = estimate(Some(10 * GIB), Some(12 * GIB), None);
    assert_eq!(stats.used, 12 * GIB);
    assert_eq!(stats.free, 0);
}

#[tokio::test]
async fn test_stat_reads_quota_and_usage() -> Result<()> {
    let host = TestHost::new().await;
    let estimator = CapacityEstimator::new(host.gateway().ceph(&pool_ref()));

    host.cluster.set_quota("vms", 100 * GIB).await;
    host.cluster.set_stored("vms", Some(30 * GIB)).await;

    let stats = estimator.stat().await?;
    assert_eq!(stats.capacity, 100 * GIB);
    assert_eq!(stats.used, 30 * GIB);
    assert_eq!(stats.free, 70 * GIB);
    assert_eq!(stats.quota, Some(100 * GIB));

    Ok(())
}

#[tokio::test]
async fn test_stat_of_missing_pool() {
    let host = TestHost::new().await;
    let mut pool = pool_ref();
    pool.pool = "nope".to_string();
    let estimator = CapacityEstimator::new(host.gateway().ceph(&pool));

    let err = estimator.stat().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolNotFound);
}
