mod classify_tests;

use crate::retry::RetryConfig;
use crate::sim::SimulatedCluster;
use crate::{Gateway, ToolPaths};
use rbdsr_core::PoolReference;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const GIB: u64 = 1024 * 1024 * 1024;

// Helper to build a gateway over a simulated cluster with fast retries
pub(crate) fn test_gateway(cluster: Arc<SimulatedCluster>) -> Gateway {
    Gateway::new(
        cluster,
        ToolPaths::default(),
        Duration::from_secs(5),
        fast_retry(3),
    )
}

pub(crate) fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
    }
}

pub(crate) fn pool_ref(pool: &str) -> PoolReference {
    PoolReference {
        pool: pool.to_string(),
        config_path: PathBuf::from("/etc/ceph/ceph.conf"),
        auth_user: "admin".to_string(),
        keyring_path: None,
        monitor_hosts: Vec::new(),
    }
}
