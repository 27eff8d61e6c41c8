use rbdsr_core::{
    DeviceConfig, DiskState, DriverConfig, DriverKind, ErrorKind, Result, RetrySettings,
};
use rbdsr_platform::sim::SimulatedCluster;
use rbdsr_storage::{Driver, open_driver};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const GIB: u64 = 1024 * 1024 * 1024;

// Helper to build host settings rooted in a temporary directory
fn test_config(root: &TempDir) -> DriverConfig {
    DriverConfig {
        state_dir: root.path().join("state"),
        log_dir: root.path().join("log"),
        lvm_conf_root: root.path().join("lvm"),
        device_settle_timeout_secs: 0,
        retry: RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        },
        ..DriverConfig::default()
    }
}

async fn test_cluster() -> Arc<SimulatedCluster> {
    let cluster = Arc::new(SimulatedCluster::new());
    cluster.add_pool("vms", 500 * GIB).await;
    cluster
}

async fn open(
    cluster: &Arc<SimulatedCluster>,
    config: &DriverConfig,
    kind: DriverKind,
    pairs: &[&str],
) -> Result<Driver> {
    let device = DeviceConfig::parse_pairs(kind, pairs)?;
    open_driver(device, config, cluster.clone()).await
}

#[tokio::test]
async fn test_direct_repository_lifecycle() -> Result<()> {
    let root = TempDir::new()?;
    let config = test_config(&root);
    let cluster = test_cluster().await;
    let driver = open(&cluster, &config, DriverKind::Rbd, &["pool=vms"]).await?;

    let repo = driver.repositories.create(Uuid::new_v4()).await?;
    let repo = driver.repositories.attach(&repo).await?;

    let disk = driver.disks.create_disk(&repo, 10 * GIB, false).await?;
    let disk = driver.disks.attach_disk(&repo, &disk).await?;
    assert_eq!(disk.state, DiskState::Attached);

    let snap = driver.disks.snapshot_disk(&repo, &disk).await?;
    let clone = driver.disks.clone_disk(&repo, &snap).await?;
    assert_eq!(driver.repositories.scan(&repo).await?.len(), 3);

    let disk = driver.disks.detach_disk(&repo, &disk).await?;
    assert_eq!(disk.state, DiskState::Unattached);

    driver.disks.delete_disk(&repo, &clone, false).await?;
    driver.disks.delete_disk(&repo, &snap, false).await?;
    driver.disks.delete_disk(&repo, &disk, false).await?;
    assert!(driver.repositories.scan(&repo).await?.is_empty());

    driver.repositories.detach(&repo, false).await?;
    driver.repositories.delete(&repo, false).await?;
    assert!(cluster.image_names("vms").await.is_empty());
    assert!(cluster.mapped().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_concurrent_attach_from_two_processes() -> Result<()> {
    let root = TempDir::new()?;
    let config = test_config(&root);
    let cluster = test_cluster().await;

    let first = open(&cluster, &config, DriverKind::Rbd, &["pool=vms"]).await?;
    let second = open(&cluster, &config, DriverKind::Rbd, &["pool=vms"]).await?;
    let repo = first.repositories.create(Uuid::new_v4()).await?;
    let disk = first.disks.create_disk(&repo, GIB, false).await?;

    let (a, b) = tokio::join!(
        first.disks.attach_disk(&repo, &disk),
        second.disks.attach_disk(&repo, &disk)
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.device_path, b.device_path);
    assert_eq!(cluster.mapped().await.len(), 1);

    first.disks.detach_disk(&repo, &a).await?;
    assert_eq!(cluster.mapped().await.len(), 1);
    second.disks.detach_disk(&repo, &b).await?;
    assert!(cluster.mapped().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_volume_group_repository_lifecycle() -> Result<()> {
    let root = TempDir::new()?;
    let config = test_config(&root);
    let cluster = test_cluster().await;
    let pairs = ["pool=vms", "image=sr-lvm", "size=20G", "protected=false"];
    let driver = open(&cluster, &config, DriverKind::LvmOverRbd, &pairs).await?;

    let report = driver.repositories.probe().await?;
    assert!(report.volume_groups.is_empty());

    let repo = driver.repositories.create(Uuid::new_v4()).await?;
    assert_eq!(repo.stats.capacity, 20 * GIB);
    let repo = driver.repositories.attach(&repo).await?;

    let disk = driver.disks.create_disk(&repo, 5 * GIB, false).await?;
    let disk = driver.disks.attach_disk(&repo, &disk).await?;
    let snap = driver.disks.snapshot_disk(&repo, &disk).await?;

    let repo = driver.repositories.stat(&repo).await?;
    assert_eq!(repo.stats.used, 10 * GIB);
    assert_eq!(repo.stats.free, 10 * GIB);
    assert_eq!(repo.virtual_allocation, 10 * GIB);

    let err = driver.disks.create_disk(&repo, 11 * GIB, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

    let repo = driver.repositories.extend(&repo, "40G").await?;
    assert_eq!(repo.stats.free, 30 * GIB);

    driver.disks.detach_disk(&repo, &disk).await?;
    driver.disks.delete_disk(&repo, &snap, false).await?;
    driver.disks.delete_disk(&repo, &disk, false).await?;

    driver.repositories.detach(&repo, false).await?;
    driver.repositories.delete(&repo, false).await?;
    assert!(cluster.image_names("vms").await.is_empty());
    assert!(cluster.volume_groups().await.is_empty());
    assert!(cluster.mapped().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_volume_group_repository_survives_reattach() -> Result<()> {
    let root = TempDir::new()?;
    let config = test_config(&root);
    let cluster = test_cluster().await;
    let pairs = ["pool=vms", "image=sr-lvm", "size=8G"];

    let driver = open(&cluster, &config, DriverKind::LvmOverRbd, &pairs).await?;
    let id = Uuid::new_v4();
    let repo = driver.repositories.create(id).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;

    let later = open(&cluster, &config, DriverKind::LvmOverRbd, &pairs).await?;
    let repo = later.repositories.open(id).await?;
    let repo = later.repositories.attach(&repo).await?;
    let found = later.disks.lookup_disk(&repo, disk.id).await?;
    assert_eq!(found.backing, disk.backing);
    later.repositories.detach(&repo, false).await?;

    Ok(())
}
