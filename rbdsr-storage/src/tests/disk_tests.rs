use super::{GIB, InterleavingRunner, MIB, TestHost};
use crate::Driver;
use rbdsr_core::{DiskState, ErrorKind, RepositoryRecord, Result, SHARABLE_META_KEY};
use rbdsr_platform::command::Tool;
use rbdsr_platform::sim::FaultKind;
use tokio::sync::oneshot;
use uuid::Uuid;

async fn direct_repository(host: &TestHost) -> Result<(Driver, RepositoryRecord)> {
    let driver = host.rbd_driver().await?;
    let repo = driver.repositories.create(Uuid::new_v4()).await?;
    Ok((driver, repo))
}

#[tokio::test]
async fn test_create_then_delete_leaves_no_image() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;

    let disk = driver.disks.create_disk(&repo, GIB + 1, false).await?;
    assert_eq!(disk.size_bytes, GIB + MIB);
    assert_eq!(disk.backing.image, format!("vdi-{}", disk.id));
    assert_eq!(disk.state, DiskState::Unattached);
    assert!(!disk.read_only);
    assert_eq!(host.cluster.image_names("vms").await, vec![disk.backing.image.clone()]);

    let found = driver.disks.lookup_disk(&repo, disk.id).await?;
    assert_eq!(found, disk);

    driver.disks.delete_disk(&repo, &disk, false).await?;
    assert!(host.cluster.image_names("vms").await.is_empty());

    let err = driver.disks.lookup_disk(&repo, disk.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[tokio::test]
async fn test_zero_size_is_rejected() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;

    let err = driver.disks.create_disk(&repo, 0, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    assert!(host.cluster.image_names("vms").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_create_respects_quota() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    host.cluster.set_quota("vms", 2 * GIB).await;
    host.cluster.set_stored("vms", Some(GIB + GIB / 2)).await;

    let err = driver.disks.create_disk(&repo, GIB, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(host.cluster.image_names("vms").await.is_empty());

    driver.disks.create_disk(&repo, 256 * MIB, false).await?;

    Ok(())
}

#[tokio::test]
async fn test_attach_twice_shares_one_mapping() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;

    let first = driver.disks.attach_disk(&repo, &disk).await?;
    let second = driver.disks.attach_disk(&repo, &first).await?;
    assert_eq!(first.state, DiskState::Attached);
    assert_eq!(first.device_path, second.device_path);
    assert_eq!(host.cluster.mapped().await.len(), 1);

    let detached = driver.disks.detach_disk(&repo, &second).await?;
    assert_eq!(detached.state, DiskState::Attached);
    assert_eq!(host.cluster.mapped().await.len(), 1);

    let detached = driver.disks.detach_disk(&repo, &detached).await?;
    assert_eq!(detached.state, DiskState::Unattached);
    assert_eq!(detached.device_path, None);
    assert!(host.cluster.mapped().await.is_empty());

    // detaching an unattached disk is a no-op
    let again = driver.disks.detach_disk(&repo, &detached).await?;
    assert_eq!(again.state, DiskState::Unattached);

    Ok(())
}

#[tokio::test]
async fn test_failed_attach_takes_no_reference() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;
    host.cluster
        .inject_fault(
            Tool::Rbd,
            "map",
            1,
            FaultKind::Failure("rbd: map failed: (6) No such device or address".to_string()),
        )
        .await;

    let err = driver.disks.attach_disk(&repo, &disk).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(host.cluster.mapped().await.is_empty());
    assert_eq!(host.mapper().refcount(&disk.backing).await?, 0);

    let attached = driver.disks.attach_disk(&repo, &disk).await?;
    assert_eq!(attached.state, DiskState::Attached);
    driver.disks.detach_disk(&repo, &attached).await?;
    assert!(host.cluster.mapped().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_attach_state_is_visible_to_a_new_process() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;
    let attached = driver.disks.attach_disk(&repo, &disk).await?;

    let later = host.rbd_driver().await?;
    let found = later.disks.lookup_disk(&repo, disk.id).await?;
    assert_eq!(found.state, DiskState::Attached);
    assert_eq!(found.device_path, attached.device_path);

    Ok(())
}

#[tokio::test]
async fn test_delete_while_attached_destroys_nothing() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;
    let attached = driver.disks.attach_disk(&repo, &disk).await?;

    let err = driver.disks.delete_disk(&repo, &attached, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StillMapped);
    assert_eq!(host.cluster.image_names("vms").await.len(), 1);
    assert_eq!(host.cluster.mapped().await.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_delete_holds_off_a_racing_attach() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;

    // another process attaches once the delete has started
    let other = host.rbd_driver().await?;
    let (tx, rx) = oneshot::channel();
    let attach = {
        let (repo, disk) = (repo.clone(), disk.clone());
        async move {
            let _ = tx.send(other.disks.attach_disk(&repo, &disk).await);
        }
    };
    let runner = InterleavingRunner::new(
        host.cluster.clone(),
        |invocation| {
            invocation.tool == Tool::Rbd && invocation.has_flag("snap") && invocation.has_flag("ls")
        },
        attach,
    );
    let deleting = host.rbd_driver_on(runner).await?;
    deleting.disks.delete_disk(&repo, &disk, false).await?;

    let attached = rx.await.expect("attach finished");
    assert!(attached.is_err(), "{attached:?}");
    assert!(host.cluster.image_names("vms").await.is_empty());
    assert!(host.cluster.mapped().await.is_empty());
    assert_eq!(host.mapper().refcount(&disk.backing).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_delete_refuses_an_image_open_elsewhere() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;
    host.cluster
        .add_watcher(&disk.backing, "10.0.0.2:0/2271683944")
        .await?;

    let err = driver.disks.delete_disk(&repo, &disk, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StillMapped);
    assert!(err.to_string().contains("10.0.0.2:0/2271683944"), "{err}");
    assert_eq!(host.cluster.image_names("vms").await, vec![disk.backing.image.clone()]);

    Ok(())
}

#[tokio::test]
async fn test_shrink_needs_force() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, 8 * MIB, false).await?;
    host.cluster.write_block(&disk.backing, 0, 1).await?;
    host.cluster.write_block(&disk.backing, 5, 1).await?;

    let err = driver
        .disks
        .resize_disk(&repo, &disk, 4 * MIB, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShrinkRejected);
    assert_eq!(host.cluster.image_size(&disk.backing).await, Some(8 * MIB));

    // still below what the cluster reports as used
    let err = driver
        .disks
        .resize_disk(&repo, &disk, MIB, true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShrinkRejected);
    assert_eq!(host.cluster.image_size(&disk.backing).await, Some(8 * MIB));

    let shrunk = driver.disks.resize_disk(&repo, &disk, 6 * MIB, true).await?;
    assert_eq!(shrunk.size_bytes, 6 * MIB);

    let grown = driver.disks.resize_disk(&repo, &shrunk, 16 * MIB, false).await?;
    assert_eq!(grown.size_bytes, 16 * MIB);
    assert_eq!(host.cluster.image_size(&disk.backing).await, Some(16 * MIB));

    Ok(())
}

#[tokio::test]
async fn test_snapshot_is_read_only_and_not_resizable() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;

    let snap = driver.disks.snapshot_disk(&repo, &disk).await?;
    assert!(snap.read_only);
    assert_eq!(snap.parent, Some(disk.backing.clone()));
    assert_eq!(
        snap.backing.snapshot.as_deref(),
        Some(format!("snap-{}", snap.id).as_str())
    );
    assert!(host.cluster.is_protected(&snap.backing).await);

    let found = driver.disks.lookup_disk(&repo, snap.id).await?;
    assert_eq!(found.backing, snap.backing);

    let err = driver
        .disks
        .resize_disk(&repo, &snap, 2 * GIB, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let attached = driver.disks.attach_disk(&repo, &snap).await?;
    let device = attached.device_path.clone().expect("device path");
    assert!(host.cluster.is_read_only_mapping(&device).await);
    driver.disks.detach_disk(&repo, &attached).await?;

    Ok(())
}

#[tokio::test]
async fn test_clone_is_copy_on_write() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, 8 * MIB, false).await?;
    host.cluster.write_block(&disk.backing, 1, 7).await?;

    let snap = driver.disks.snapshot_disk(&repo, &disk).await?;
    let clone = driver.disks.clone_disk(&repo, &snap).await?;
    assert_eq!(clone.parent, Some(snap.backing.clone()));
    assert_eq!(host.cluster.read_block(&clone.backing, 1).await?, 7);

    host.cluster.write_block(&clone.backing, 1, 9).await?;
    host.cluster.write_block(&disk.backing, 2, 3).await?;
    assert_eq!(host.cluster.read_block(&disk.backing, 1).await?, 7);
    assert_eq!(host.cluster.read_block(&clone.backing, 1).await?, 9);
    assert_eq!(host.cluster.read_block(&clone.backing, 2).await?, 0);

    // the snapshot backs a clone
    let err = driver.disks.delete_disk(&repo, &snap, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HasClones);

    driver.disks.delete_disk(&repo, &snap, true).await?;
    assert_eq!(host.cluster.image_parent(&clone.backing).await, None);
    assert_eq!(host.cluster.read_block(&clone.backing, 1).await?, 9);
    assert!(host.cluster.snapshot_names(&disk.backing).await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_clone_of_a_head_cleans_up_its_base() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;

    let clone = driver.disks.clone_disk(&repo, &disk).await?;
    let base = clone.parent.clone().expect("clone has a parent");
    assert_eq!(base.base(), disk.backing);
    assert_eq!(
        base.snapshot.as_deref(),
        Some(format!("base-{}", clone.id).as_str())
    );

    let err = driver.disks.delete_disk(&repo, &disk, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HasClones);

    driver.disks.delete_disk(&repo, &clone, false).await?;
    assert!(host.cluster.snapshot_names(&disk.backing).await.is_empty());

    driver.disks.delete_disk(&repo, &disk, false).await?;
    assert!(host.cluster.image_names("vms").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_failed_readback_leaves_no_snapshot_or_clone() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, false).await?;
    let info_fails = || {
        host.cluster.inject_fault(
            Tool::Rbd,
            "info",
            1,
            FaultKind::Failure("rbd: error opening image: (5) Input/output error".to_string()),
        )
    };

    info_fails().await;
    let err = driver.disks.snapshot_disk(&repo, &disk).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(host.cluster.snapshot_names(&disk.backing).await.is_empty());

    info_fails().await;
    let err = driver.disks.clone_disk(&repo, &disk).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert_eq!(host.cluster.image_names("vms").await, vec![disk.backing.image.clone()]);
    assert!(host.cluster.snapshot_names(&disk.backing).await.is_empty());

    // nothing left to block the delete
    driver.disks.delete_disk(&repo, &disk, false).await?;
    assert!(host.cluster.image_names("vms").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_sharable_disk_maps_without_exclusive_lock() -> Result<()> {
    let host = TestHost::new().await;
    let (driver, repo) = direct_repository(&host).await?;
    let disk = driver.disks.create_disk(&repo, GIB, true).await?;
    assert!(disk.sharable);
    assert_eq!(
        host.cluster.image_meta(&disk.backing, SHARABLE_META_KEY).await,
        Some("true".to_string())
    );

    let found = driver.disks.lookup_disk(&repo, disk.id).await?;
    assert!(found.sharable);

    driver.disks.attach_disk(&repo, &found).await?;
    let map = host
        .cluster
        .invocations()
        .await
        .into_iter()
        .find(|inv| inv.has_flag("map"))
        .expect("map invocation");
    assert!(!map.has_flag("--exclusive"));

    Ok(())
}
