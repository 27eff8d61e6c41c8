use super::{Context, DeviceArgs};
use crate::output::{print_disk, print_done, print_warning};
use crate::utils::parse_bytes;
use rbdsr_core::{RepositoryRecord, Result, VirtualDiskRecord};
use rbdsr_storage::Driver;
use uuid::Uuid;

async fn open_disk(
    ctx: &Context,
    sr: Uuid,
    vdi: Uuid,
    device: &DeviceArgs,
) -> Result<(Driver, RepositoryRecord, VirtualDiskRecord)> {
    let driver = ctx.driver(device).await?;
    let repo = driver.repositories.open(sr).await?;
    let disk = driver.disks.lookup_disk(&repo, vdi).await?;
    Ok((driver, repo, disk))
}

pub async fn create(
    ctx: &Context,
    sr: Uuid,
    device: &DeviceArgs,
    size: &str,
    sharable: bool,
) -> Result<()> {
    let size_bytes = parse_bytes(size)?;
    let driver = ctx.driver(device).await?;
    let repo = driver.repositories.open(sr).await?;
    let disk = driver.disks.create_disk(&repo, size_bytes, sharable).await?;
    ctx.record(
        &sr,
        "vdi_create",
        &format!("{} size={} sharable={}", disk.id, disk.size_bytes, sharable),
    )
    .await;
    print_disk(ctx.format, &disk);
    Ok(())
}

pub async fn delete(
    ctx: &Context,
    sr: Uuid,
    vdi: Uuid,
    device: &DeviceArgs,
    force: bool,
) -> Result<()> {
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    if force {
        print_warning(&format!("Dependent clones of {vdi} will be flattened"));
    }
    driver.disks.delete_disk(&repo, &disk, force).await?;
    ctx.record(&sr, "vdi_delete", &format!("{vdi} force={force}"))
        .await;
    print_done(ctx.format, &format!("Virtual disk {vdi} deleted"));
    Ok(())
}

pub async fn resize(
    ctx: &Context,
    sr: Uuid,
    vdi: Uuid,
    device: &DeviceArgs,
    size: &str,
    force: bool,
) -> Result<()> {
    let size_bytes = parse_bytes(size)?;
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    let disk = driver
        .disks
        .resize_disk(&repo, &disk, size_bytes, force)
        .await?;
    ctx.record(
        &sr,
        "vdi_resize",
        &format!("{vdi} size={} force={force}", disk.size_bytes),
    )
    .await;
    print_disk(ctx.format, &disk);
    Ok(())
}

pub async fn attach(ctx: &Context, sr: Uuid, vdi: Uuid, device: &DeviceArgs) -> Result<()> {
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    let disk = driver.disks.attach_disk(&repo, &disk).await?;
    let path = disk
        .device_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    ctx.record(&sr, "vdi_attach", &format!("{vdi} -> {path}")).await;
    print_disk(ctx.format, &disk);
    Ok(())
}

pub async fn detach(ctx: &Context, sr: Uuid, vdi: Uuid, device: &DeviceArgs) -> Result<()> {
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    let disk = driver.disks.detach_disk(&repo, &disk).await?;
    ctx.record(&sr, "vdi_detach", &format!("{vdi} state={}", disk.state))
        .await;
    print_disk(ctx.format, &disk);
    Ok(())
}

pub async fn snapshot(ctx: &Context, sr: Uuid, vdi: Uuid, device: &DeviceArgs) -> Result<()> {
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    let snapshot = driver.disks.snapshot_disk(&repo, &disk).await?;
    ctx.record(&sr, "vdi_snapshot", &format!("{vdi} -> {}", snapshot.id))
        .await;
    print_disk(ctx.format, &snapshot);
    Ok(())
}

pub async fn clone(ctx: &Context, sr: Uuid, vdi: Uuid, device: &DeviceArgs) -> Result<()> {
    let (driver, repo, disk) = open_disk(ctx, sr, vdi, device).await?;
    let clone = driver.disks.clone_disk(&repo, &disk).await?;
    ctx.record(&sr, "vdi_clone", &format!("{vdi} -> {}", clone.id))
        .await;
    print_disk(ctx.format, &clone);
    Ok(())
}
