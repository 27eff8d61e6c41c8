mod sr;
mod vdi;

use clap::{Args, Subcommand, ValueEnum};
use rbdsr_core::{DeviceConfig, DriverConfig, DriverKind, OperationLog, Result, SrError};
use rbdsr_platform::command::SystemCommandRunner;
use rbdsr_storage::{Driver, open_driver};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::output::OutputFormat;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DriverArg {
    /// One RBD image per virtual disk
    Rbd,
    /// A volume group on one RBD image, one logical volume per virtual disk
    Lvmorbd,
}

impl From<DriverArg> for DriverKind {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Rbd => DriverKind::Rbd,
            DriverArg::Lvmorbd => DriverKind::LvmOverRbd,
        }
    }
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Device configuration entry (repeatable), e.g. -c pool=vms
    #[arg(short = 'c', long = "device-config", value_name = "KEY=VALUE")]
    pub pairs: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a storage repository
    SrCreate {
        /// Repository UUID
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Delete a storage repository
    SrDelete {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// Delete even if virtual disks remain
        #[arg(short, long)]
        force: bool,
    },

    /// Attach a storage repository to this host
    SrAttach {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Detach a storage repository from this host
    SrDetach {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// Release mappings still held by virtual disks
        #[arg(short, long)]
        force: bool,
    },

    /// List the virtual disks of a storage repository
    SrScan {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Refresh and show repository capacity
    SrStat {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Inspect the cluster without changing anything
    SrProbe {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Set the pool quota
    SrSetQuota {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// Quota in bytes, units K/M/G/T accepted
        #[arg(long)]
        max_bytes: String,
    },

    /// Grow the backing image of a volume-group repository
    SrExtend {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// New size, e.g. 20G (bare numbers are MiB)
        #[arg(long)]
        size: String,
    },

    /// Create a virtual disk
    VdiCreate {
        sr: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// Size in bytes, units K/M/G/T accepted
        #[arg(long)]
        size: String,
        /// Allow attaching from several hosts at once
        #[arg(long)]
        sharable: bool,
    },

    /// Delete a virtual disk
    VdiDelete {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// Flatten dependent clones and delete anyway
        #[arg(short, long)]
        force: bool,
    },

    /// Resize a virtual disk
    VdiResize {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
        /// New size in bytes, units K/M/G/T accepted
        #[arg(long)]
        size: String,
        /// Allow shrinking
        #[arg(short, long)]
        force: bool,
    },

    /// Attach a virtual disk and print its device path
    VdiAttach {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Detach a virtual disk
    VdiDetach {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Take a read-only snapshot of a virtual disk
    VdiSnapshot {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Create a writable copy-on-write clone of a virtual disk
    VdiClone {
        sr: Uuid,
        vdi: Uuid,
        #[command(flatten)]
        device: DeviceArgs,
    },
}

impl Command {
    /// Name in the operation log, and the repository the command acts on.
    pub fn operation(&self) -> (&'static str, Option<Uuid>) {
        match self {
            Command::SrCreate { sr, .. } => ("sr_create", Some(*sr)),
            Command::SrDelete { sr, .. } => ("sr_delete", Some(*sr)),
            Command::SrAttach { sr, .. } => ("sr_attach", Some(*sr)),
            Command::SrDetach { sr, .. } => ("sr_detach", Some(*sr)),
            Command::SrScan { sr, .. } => ("sr_scan", Some(*sr)),
            Command::SrStat { sr, .. } => ("sr_stat", Some(*sr)),
            Command::SrProbe { .. } => ("sr_probe", None),
            Command::SrSetQuota { sr, .. } => ("sr_set_quota", Some(*sr)),
            Command::SrExtend { sr, .. } => ("sr_extend", Some(*sr)),
            Command::VdiCreate { sr, .. } => ("vdi_create", Some(*sr)),
            Command::VdiDelete { sr, .. } => ("vdi_delete", Some(*sr)),
            Command::VdiResize { sr, .. } => ("vdi_resize", Some(*sr)),
            Command::VdiAttach { sr, .. } => ("vdi_attach", Some(*sr)),
            Command::VdiDetach { sr, .. } => ("vdi_detach", Some(*sr)),
            Command::VdiSnapshot { sr, .. } => ("vdi_snapshot", Some(*sr)),
            Command::VdiClone { sr, .. } => ("vdi_clone", Some(*sr)),
        }
    }
}

/// Everything a command needs besides its own arguments.
pub struct Context {
    pub kind: DriverKind,
    pub config: DriverConfig,
    pub format: OutputFormat,
}

impl Context {
    pub async fn driver(&self, device: &DeviceArgs) -> Result<Driver> {
        let device = DeviceConfig::parse_pairs(self.kind, &device.pairs)?;
        open_driver(device, &self.config, Arc::new(SystemCommandRunner::new())).await
    }

    /// Log a completed operation to the repository's operation log.
    /// Failing to write the log only warns.
    pub async fn record(&self, sr: &Uuid, operation: &str, detail: &str) {
        let log = OperationLog::new(&self.config.log_dir, sr);
        if let Err(e) = log.succeeded(operation, detail).await {
            warn!("Cannot write log {}: {}", log.path().display(), e);
        }
    }

    pub async fn record_failure(&self, sr: &Uuid, operation: &str, error: &SrError) {
        let log = OperationLog::new(&self.config.log_dir, sr);
        if let Err(e) = log.failed(operation, error).await {
            warn!("Cannot write log {}: {}", log.path().display(), e);
        }
    }
}

pub async fn execute(
    command: Command,
    kind: DriverKind,
    config: DriverConfig,
    format: OutputFormat,
) -> Result<()> {
    let ctx = Context {
        kind,
        config,
        format,
    };

    let (operation, target) = command.operation();
    let result = run(&ctx, command).await;
    if let (Err(e), Some(sr)) = (&result, target) {
        ctx.record_failure(&sr, operation, e).await;
    }
    result
}

async fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::SrCreate { sr, device } => sr::create(ctx, sr, &device).await,
        Command::SrDelete { sr, device, force } => sr::delete(ctx, sr, &device, force).await,
        Command::SrAttach { sr, device } => sr::attach(ctx, sr, &device).await,
        Command::SrDetach { sr, device, force } => sr::detach(ctx, sr, &device, force).await,
        Command::SrScan { sr, device } => sr::scan(ctx, sr, &device).await,
        Command::SrStat { sr, device } => sr::stat(ctx, sr, &device).await,
        Command::SrProbe { device } => sr::probe(ctx, &device).await,
        Command::SrSetQuota {
            sr,
            device,
            max_bytes,
        } => sr::set_quota(ctx, sr, &device, &max_bytes).await,
        Command::SrExtend { sr, device, size } => sr::extend(ctx, sr, &device, &size).await,
        Command::VdiCreate {
            sr,
            device,
            size,
            sharable,
        } => vdi::create(ctx, sr, &device, &size, sharable).await,
        Command::VdiDelete {
            sr,
            vdi,
            device,
            force,
        } => vdi::delete(ctx, sr, vdi, &device, force).await,
        Command::VdiResize {
            sr,
            vdi,
            device,
            size,
            force,
        } => vdi::resize(ctx, sr, vdi, &device, &size, force).await,
        Command::VdiAttach { sr, vdi, device } => vdi::attach(ctx, sr, vdi, &device).await,
        Command::VdiDetach { sr, vdi, device } => vdi::detach(ctx, sr, vdi, &device).await,
        Command::VdiSnapshot { sr, vdi, device } => vdi::snapshot(ctx, sr, vdi, &device).await,
        Command::VdiClone { sr, vdi, device } => vdi::clone(ctx, sr, vdi, &device).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rbdsr_core::ErrorKind;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: Command,
    }

    fn parse(args: &[&str]) -> Command {
        Harness::try_parse_from(std::iter::once("rbdsr").chain(args.iter().copied()))
            .expect("valid command line")
            .command
    }

    #[test]
    fn test_operation_names_and_targets() {
        let sr = Uuid::new_v4();
        let vdi = Uuid::new_v4();

        let command = parse(&["sr-stat", &sr.to_string(), "-c", "pool=vms"]);
        assert_eq!(command.operation(), ("sr_stat", Some(sr)));

        let command = parse(&["vdi-delete", &sr.to_string(), &vdi.to_string(), "--force"]);
        assert_eq!(command.operation(), ("vdi_delete", Some(sr)));

        let command = parse(&["sr-probe", "-c", "pool=vms"]);
        assert_eq!(command.operation(), ("sr_probe", None));
    }

    #[tokio::test]
    async fn test_failed_command_is_logged_with_its_kind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DriverConfig {
            log_dir: dir.path().join("log"),
            ..DriverConfig::default()
        };
        let sr = Uuid::new_v4();

        // a malformed device configuration fails before any tool runs
        let command = parse(&["sr-attach", &sr.to_string(), "-c", "pool"]);
        let err = execute(command, DriverKind::Rbd, config, OutputFormat::Json)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);

        let log = OperationLog::new(&dir.path().join("log"), &sr);
        let content = tokio::fs::read_to_string(log.path()).await?;
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("FAILED sr_attach ConfigInvalid: "), "{content}");

        Ok(())
    }
}
