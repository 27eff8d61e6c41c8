use super::{GIB, TestHost, pool_ref};
use rbdsr_core::{ErrorKind, ImageSpec, Result};
use rbdsr_platform::command::Tool;
use rbdsr_platform::sim::FaultKind;
use std::path::Path;

async fn host_with_image(image: &str) -> Result<(TestHost, ImageSpec)> {
    let host = TestHost::new().await;
    let spec = ImageSpec::image("vms", image);
    host.gateway().rbd(&pool_ref()).create(image, GIB).await?;
    Ok((host, spec))
}

#[tokio::test]
async fn test_second_map_reuses_device() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let mapper = host.mapper();

    let first = mapper.map(&spec, false, true).await?;
    let second = mapper.map(&spec, false, true).await?;
    assert_eq!(first, second);
    assert_eq!(first, Path::new("/dev/rbd0"));
    assert_eq!(mapper.refcount(&spec).await?, 2);
    assert_eq!(host.cluster.count(Tool::Rbd, "map").await, 1);

    assert_eq!(mapper.unmap(&spec).await?, 1);
    assert_eq!(host.cluster.mapped().await.len(), 1);

    assert_eq!(mapper.unmap(&spec).await?, 0);
    assert!(host.cluster.mapped().await.is_empty());
    assert!(mapper.lookup(&spec).await?.is_none());

    // nothing left to drop
    assert_eq!(mapper.unmap(&spec).await?, 0);
    assert_eq!(host.cluster.count(Tool::Rbd, "unmap").await, 1);

    Ok(())
}

#[tokio::test]
async fn test_refcount_is_shared_between_processes() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;

    let device = host.mapper().map(&spec, false, false).await?;
    let other = host.mapper();
    assert_eq!(other.map(&spec, false, false).await?, device);
    assert_eq!(other.refcount(&spec).await?, 2);

    let entry = host.mapper().lookup(&spec).await?.expect("entry persisted");
    assert_eq!(entry.refcount, 2);
    assert_eq!(entry.device, device);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_adopts_unrecorded_mapping() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let device = host.cluster.add_kernel_mapping(&spec).await?;

    let mapper = host.mapper();
    assert_eq!(mapper.refcount(&spec).await?, 1);

    let entries = mapper.entries().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].device, device);

    // mapping again takes a reference on the adopted device
    assert_eq!(mapper.map(&spec, false, false).await?, device);
    assert_eq!(mapper.refcount(&spec).await?, 2);
    assert_eq!(host.cluster.count(Tool::Rbd, "map").await, 0);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_drops_mapping_that_vanished() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let device = host.mapper().map(&spec, false, false).await?;

    // the kernel lost the mapping, e.g. across a reboot
    host.gateway().rbd(&pool_ref()).unmap(&device).await?;

    let mapper = host.mapper();
    assert_eq!(mapper.refcount(&spec).await?, 0);
    assert!(mapper.entries().await?.is_empty());
    assert!(std::fs::read_dir(host.config.mappings_dir())?.next().is_none());

    Ok(())
}

#[tokio::test]
async fn test_busy_unmap_is_retried() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let mapper = host.mapper();
    mapper.map(&spec, false, false).await?;

    host.cluster
        .inject_fault(Tool::Rbd, "unmap", 2, FaultKind::Busy)
        .await;
    assert_eq!(mapper.unmap(&spec).await?, 0);
    assert_eq!(host.cluster.count(Tool::Rbd, "unmap").await, 3);
    assert!(host.cluster.mapped().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_persistent_busy_keeps_the_entry() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let mapper = host.mapper();
    mapper.map(&spec, false, false).await?;

    host.cluster
        .inject_fault(Tool::Rbd, "unmap", 5, FaultKind::Busy)
        .await;
    let err = mapper.unmap(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(mapper.refcount(&spec).await?, 1);
    assert_eq!(host.cluster.mapped().await.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_force_unmap_ignores_references() -> Result<()> {
    let (host, spec) = host_with_image("vdi-a").await?;
    let mapper = host.mapper();
    mapper.map(&spec, false, false).await?;
    mapper.map(&spec, false, false).await?;

    assert!(mapper.force_unmap(&spec).await?);
    assert_eq!(mapper.refcount(&spec).await?, 0);
    assert!(host.cluster.mapped().await.is_empty());

    assert!(!mapper.force_unmap(&spec).await?);

    Ok(())
}

#[tokio::test]
async fn test_missing_image_does_not_leave_an_entry() -> Result<()> {
    let host = TestHost::new().await;
    let mapper = host.mapper();
    let spec = ImageSpec::image("vms", "vdi-missing");

    let err = mapper.map(&spec, false, false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(mapper.refcount(&spec).await?, 0);

    Ok(())
}
