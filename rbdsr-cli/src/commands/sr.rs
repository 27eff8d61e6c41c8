use super::{Context, DeviceArgs};
use crate::output::{
    OutputFormat, OutputFormatter, print_disks, print_done, print_repository, print_warning,
};
use crate::utils::{format_bytes, parse_bytes};
use rbdsr_core::{ProbeReport, ProbedImage, Result};
use serde::Serialize;
use tabled::Tabled;
use tracing::info;
use uuid::Uuid;

pub async fn create(ctx: &Context, sr: Uuid, device: &DeviceArgs) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.create(sr).await?;
    ctx.record(
        &sr,
        "sr_create",
        &format!("driver={} pool={}", driver.kind, record.pool.pool),
    )
    .await;
    print_repository(ctx.format, &record);
    Ok(())
}

pub async fn delete(ctx: &Context, sr: Uuid, device: &DeviceArgs, force: bool) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    if force {
        print_warning(&format!("Force deleting repository {sr} and any disks it holds"));
    }
    driver.repositories.delete(&record, force).await?;
    ctx.record(&sr, "sr_delete", &format!("force={force}")).await;
    print_done(ctx.format, &format!("Repository {sr} deleted"));
    Ok(())
}

pub async fn attach(ctx: &Context, sr: Uuid, device: &DeviceArgs) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    let record = driver.repositories.attach(&record).await?;
    ctx.record(&sr, "sr_attach", "").await;
    print_repository(ctx.format, &record);
    Ok(())
}

pub async fn detach(ctx: &Context, sr: Uuid, device: &DeviceArgs, force: bool) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    driver.repositories.detach(&record, force).await?;
    ctx.record(&sr, "sr_detach", &format!("force={force}")).await;
    print_done(ctx.format, &format!("Repository {sr} detached"));
    Ok(())
}

pub async fn scan(ctx: &Context, sr: Uuid, device: &DeviceArgs) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    let disks = driver.repositories.scan(&record).await?;
    info!("Repository {} holds {} virtual disk(s)", sr, disks.len());
    ctx.record(&sr, "sr_scan", &format!("disks={}", disks.len()))
        .await;
    print_disks(ctx.format, &disks);
    Ok(())
}

pub async fn stat(ctx: &Context, sr: Uuid, device: &DeviceArgs) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    let record = driver.repositories.stat(&record).await?;
    print_repository(ctx.format, &record);
    Ok(())
}

#[derive(Serialize, Tabled)]
struct ProbedImageRow {
    image: String,
    size: String,
    disk: String,
}

impl From<&ProbedImage> for ProbedImageRow {
    fn from(image: &ProbedImage) -> Self {
        ProbedImageRow {
            image: image.name.clone(),
            size: format_bytes(image.size_bytes),
            disk: image
                .disk_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn probe(ctx: &Context, device: &DeviceArgs) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let report = driver.repositories.probe().await?;
    print_probe(ctx.format, &report);
    Ok(())
}

fn print_probe(format: OutputFormat, report: &ProbeReport) {
    match format {
        OutputFormat::Table => {
            println!("Pools: {}", report.pools.join(", "));
            println!(
                "Configured pool present: {}",
                if report.pool_exists { "yes" } else { "no" }
            );
            if !report.volume_groups.is_empty() {
                println!("Volume groups: {}", report.volume_groups.join(", "));
            }
            let rows: Vec<ProbedImageRow> = report.images.iter().map(ProbedImageRow::from).collect();
            println!("\n{}", format.format_table(rows));
        }
        _ => println!("{}", format.format(report)),
    }
}

pub async fn set_quota(ctx: &Context, sr: Uuid, device: &DeviceArgs, max_bytes: &str) -> Result<()> {
    let max_bytes = parse_bytes(max_bytes)?;
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    let record = driver.repositories.set_quota(&record, max_bytes).await?;
    ctx.record(&sr, "sr_set_quota", &format!("max_bytes={max_bytes}"))
        .await;
    print_repository(ctx.format, &record);
    Ok(())
}

pub async fn extend(ctx: &Context, sr: Uuid, device: &DeviceArgs, size: &str) -> Result<()> {
    let driver = ctx.driver(device).await?;
    let record = driver.repositories.open(sr).await?;
    let record = driver.repositories.extend(&record, size).await?;
    ctx.record(&sr, "sr_extend", &format!("size={size}")).await;
    print_repository(ctx.format, &record);
    Ok(())
}
