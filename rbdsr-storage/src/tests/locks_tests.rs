use crate::locks::{ResourceLocks, escape_key};
use rbdsr_core::{ImageSpec, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_escape_key_is_a_single_file_name() {
    assert_eq!(escape_key("image:vms/vdi-1@snap-2"), "image:vms%2Fvdi-1%40snap-2");
    assert_eq!(escape_key("pool:a%b"), "pool:a%25b");
}

#[tokio::test]
async fn test_same_image_lock_is_exclusive() -> Result<()> {
    let dir = TempDir::new()?;
    let locks = Arc::new(ResourceLocks::new(dir.path().to_path_buf()));
    let spec = ImageSpec::image("vms", "vdi-a");

    let guard = locks.image(&spec).await?;
    assert_eq!(guard.key(), "image:vms/vdi-a");
    assert!(dir.path().join("image:vms%2Fvdi-a.lock").exists());

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let locks = locks.clone();
        let acquired = acquired.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let _guard = locks.image(&spec).await?;
            acquired.store(true, Ordering::SeqCst);
            Ok::<(), rbdsr_core::SrError>(())
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acquired.load(Ordering::SeqCst));

    drop(guard);
    waiter.await.expect("waiter task")?;
    assert!(acquired.load(Ordering::SeqCst));

    Ok(())
}

#[tokio::test]
async fn test_different_resources_do_not_contend() -> Result<()> {
    let dir = TempDir::new()?;
    let locks = ResourceLocks::new(dir.path().to_path_buf());

    let _image = locks.image(&ImageSpec::image("vms", "vdi-a")).await?;
    let _other = locks.image(&ImageSpec::image("vms", "vdi-b")).await?;
    let _pool = locks.pool("vms").await?;

    Ok(())
}

#[tokio::test]
async fn test_released_locks_are_forgotten() -> Result<()> {
    let dir = TempDir::new()?;
    let locks = Arc::new(ResourceLocks::new(dir.path().to_path_buf()));

    for n in 0..16 {
        let _guard = locks.image(&ImageSpec::image("vms", &format!("vdi-{n}"))).await?;
        assert_eq!(locks.tracked(), 1);
    }
    assert_eq!(locks.tracked(), 0);

    // a waiter keeps the entry alive until it is done with it
    let spec = ImageSpec::image("vms", "vdi-a");
    let guard = locks.volume("VG_RBDSR-1", "LV-1").await?;
    assert_eq!(guard.key(), "volume:VG_RBDSR-1/LV-1");
    let first = locks.image(&spec).await?;
    let waiter = {
        let locks = locks.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let _guard = locks.image(&spec).await?;
            Ok::<(), rbdsr_core::SrError>(())
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(first);
    assert_eq!(locks.tracked(), 2);

    waiter.await.expect("waiter task")?;
    assert_eq!(locks.tracked(), 1);
    drop(guard);
    assert_eq!(locks.tracked(), 0);

    Ok(())
}
