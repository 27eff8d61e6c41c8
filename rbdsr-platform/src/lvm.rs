use crate::Gateway;
use crate::command::{Tool, ToolInvocation};
use rbdsr_core::{Result, SrError};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use tracing::info;

/// Points lvm at an isolated configuration directory.
pub const LVM_SYSTEM_DIR: &str = "LVM_SYSTEM_DIR";

const REPORT_ARGS: &[&str] = &["--reportformat", "json", "--units", "b", "--nosuffix"];

/// `--nosuffix --units b` still prints numbers as strings.
fn byte_count<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let trimmed = text.trim().trim_end_matches(['B', 'b']);
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<f64>()
        .map(|value| value as u64)
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgReport>,
}

#[derive(Debug, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvReport>,
}

#[derive(Debug, Deserialize)]
struct PvSection {
    #[serde(default)]
    pv: Vec<PvReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VgReport {
    pub vg_name: String,
    #[serde(deserialize_with = "byte_count")]
    pub vg_size: u64,
    #[serde(deserialize_with = "byte_count")]
    pub vg_free: u64,
    #[serde(default)]
    pub vg_attr: String,
}

impl VgReport {
    pub fn is_exported(&self) -> bool {
        self.vg_attr.chars().nth(2) == Some('x')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LvReport {
    pub lv_name: String,
    #[serde(deserialize_with = "byte_count")]
    pub lv_size: u64,
    #[serde(default)]
    pub lv_attr: String,
    #[serde(default)]
    pub origin: String,
}

impl LvReport {
    pub fn is_active(&self) -> bool {
        self.lv_attr.chars().nth(4) == Some('a')
    }

    pub fn is_read_only(&self) -> bool {
        self.lv_attr.chars().nth(1) == Some('r')
    }

    pub fn origin(&self) -> Option<&str> {
        (!self.origin.is_empty()).then_some(self.origin.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PvReport {
    pub pv_name: String,
    #[serde(deserialize_with = "byte_count")]
    pub pv_size: u64,
    #[serde(default)]
    pub vg_name: String,
}

/// Typed wrapper over `lvm`, confined to one configuration directory.
#[derive(Clone)]
pub struct LvmClient {
    gateway: Gateway,
    conf_dir: PathBuf,
}

impl LvmClient {
    pub fn new(gateway: Gateway, conf_dir: PathBuf) -> Self {
        Self { gateway, conf_dir }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub fn lv_path(vg: &str, lv: &str) -> PathBuf {
        PathBuf::from("/dev").join(vg).join(lv)
    }

    fn invocation(&self, subcommand: &str, args: &[&str]) -> ToolInvocation {
        let mut full = vec![subcommand.to_string()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        self.gateway.invocation(
            Tool::Lvm,
            full,
            vec![(
                LVM_SYSTEM_DIR.to_string(),
                self.conf_dir.display().to_string(),
            )],
        )
    }

    async fn run(&self, subcommand: &str, target: &str, args: &[&str]) -> Result<String> {
        let invocation = self.invocation(subcommand, args);
        self.gateway
            .run_checked(&invocation, subcommand, target)
            .await
    }

    async fn report(&self, subcommand: &str, target: &str, args: &[&str]) -> Result<String> {
        let mut full: Vec<&str> = REPORT_ARGS.to_vec();
        full.extend_from_slice(args);
        let invocation = self.invocation(subcommand, &full);
        self.gateway
            .run_retrying(&invocation, subcommand, target)
            .await
    }

    pub async fn vg_create(&self, vg: &str, device: &Path) -> Result<()> {
        let device = device.display().to_string();
        info!("Creating volume group {} on {}", vg, device);
        self.run("vgcreate", vg, &[vg, &device]).await?;
        Ok(())
    }

    pub async fn vg_remove(&self, vg: &str) -> Result<()> {
        info!("Removing volume group {}", vg);
        self.run("vgremove", vg, &["-f", vg]).await?;
        Ok(())
    }

    pub async fn vg_activate(&self, vg: &str, active: bool) -> Result<()> {
        let flag = if active { "-ay" } else { "-an" };
        self.run("vgchange", vg, &[flag, vg]).await?;
        Ok(())
    }

    pub async fn vg_export(&self, vg: &str) -> Result<()> {
        info!("Exporting volume group {}", vg);
        self.run("vgexport", vg, &[vg]).await?;
        Ok(())
    }

    pub async fn vg_import(&self, vg: &str) -> Result<()> {
        info!("Importing volume group {}", vg);
        self.run("vgimport", vg, &[vg]).await?;
        Ok(())
    }

    /// `None` when the volume group is not visible in this scope.
    pub async fn vg_report(&self, vg: &str) -> Result<Option<VgReport>> {
        match self
            .report(
                "vgs",
                vg,
                &["-o", "vg_name,vg_size,vg_free,vg_attr", vg],
            )
            .await
        {
            Ok(stdout) => {
                let report: Report<VgSection> = serde_json::from_str(stdout.trim())?;
                Ok(report
                    .report
                    .into_iter()
                    .flat_map(|section| section.vg)
                    .find(|entry| entry.vg_name == vg))
            }
            Err(SrError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn vg_list(&self) -> Result<Vec<VgReport>> {
        let stdout = self
            .report("vgs", "volume groups", &["-o", "vg_name,vg_size,vg_free,vg_attr"])
            .await?;
        let report: Report<VgSection> = serde_json::from_str(stdout.trim())?;
        Ok(report.report.into_iter().flat_map(|s| s.vg).collect())
    }

    pub async fn pv_report(&self, device: &Path) -> Result<Option<PvReport>> {
        let device = device.display().to_string();
        match self
            .report("pvs", &device, &["-o", "pv_name,pv_size,vg_name", &device])
            .await
        {
            Ok(stdout) => {
                let report: Report<PvSection> = serde_json::from_str(stdout.trim())?;
                Ok(report.report.into_iter().flat_map(|s| s.pv).next())
            }
            Err(SrError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Grow the physical volume to the size of its (already grown) device.
    pub async fn pv_resize(&self, device: &Path) -> Result<()> {
        let device = device.display().to_string();
        info!("Resizing physical volume {}", device);
        self.run("pvresize", &device, &[&device]).await?;
        Ok(())
    }

    pub async fn lv_create(&self, vg: &str, lv: &str, size_bytes: u64) -> Result<PathBuf> {
        let size = format!("{size_bytes}b");
        let target = format!("{vg}/{lv}");
        info!("Creating logical volume {} ({} bytes)", target, size_bytes);
        self.run("lvcreate", &target, &["-n", lv, "-L", &size, vg])
            .await?;
        Ok(Self::lv_path(vg, lv))
    }

    /// Copy-on-write snapshot of `origin`.
    pub async fn lv_snapshot(
        &self,
        vg: &str,
        origin: &str,
        lv: &str,
        size_bytes: u64,
        read_only: bool,
    ) -> Result<PathBuf> {
        let size = format!("{size_bytes}b");
        let source = format!("{vg}/{origin}");
        info!("Creating snapshot {}/{} of {}", vg, lv, source);

        let mut args = vec!["-s", "-n", lv, "-L", size.as_str()];
        if read_only {
            args.extend(["-p", "r"]);
        }
        args.push(source.as_str());

        self.run("lvcreate", &format!("{vg}/{lv}"), &args).await?;
        Ok(Self::lv_path(vg, lv))
    }

    pub async fn lv_remove(&self, vg: &str, lv: &str) -> Result<()> {
        let target = format!("{vg}/{lv}");
        info!("Removing logical volume {}", target);
        self.run("lvremove", &target, &["-f", &target]).await?;
        Ok(())
    }

    pub async fn lv_resize(&self, vg: &str, lv: &str, size_bytes: u64, force: bool) -> Result<()> {
        let target = format!("{vg}/{lv}");
        let size = format!("{size_bytes}b");
        info!("Resizing logical volume {} to {} bytes", target, size_bytes);

        let mut args = Vec::new();
        if force {
            args.push("-f");
        }
        args.extend(["-L", size.as_str(), target.as_str()]);
        self.run("lvresize", &target, &args).await?;
        Ok(())
    }

    pub async fn lv_activate(&self, vg: &str, lv: &str, active: bool) -> Result<()> {
        let target = format!("{vg}/{lv}");
        let flag = if active { "-ay" } else { "-an" };
        self.run("lvchange", &target, &[flag, &target]).await?;
        Ok(())
    }

    pub async fn lv_list(&self, vg: &str) -> Result<Vec<LvReport>> {
        let stdout = self
            .report("lvs", vg, &["-o", "lv_name,lv_size,lv_attr,origin", vg])
            .await?;
        let report: Report<LvSection> = serde_json::from_str(stdout.trim())?;
        Ok(report.report.into_iter().flat_map(|s| s.lv).collect())
    }
}
