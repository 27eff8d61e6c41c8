use crate::command::Tool;
use crate::{Gateway, cluster_args, parse_json_or_default};
use rbdsr_core::{ImageSpec, PoolReference, Result, SrError};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MIB: u64 = 1024 * 1024;

/// `rbd` sizes are whole MiB.
pub fn round_up_to_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).saturating_mul(MIB)
}

fn size_arg(bytes: u64) -> String {
    format!("{}M", round_up_to_mib(bytes) / MIB)
}

/// rbd prints booleans as `"true"` in some releases and `true` in others.
fn flexible_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Text(String),
    }

    Ok(match Flexible::deserialize(deserializer)? {
        Flexible::Bool(value) => value,
        Flexible::Text(text) => text.eq_ignore_ascii_case("true"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParentRef {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
}

impl ParentRef {
    pub fn spec(&self) -> ImageSpec {
        ImageSpec::snapshot(&self.pool, &self.image, &self.snapshot)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub provisioned: u64,
    pub used: u64,
}

#[derive(Debug, Deserialize)]
struct DuEntry {
    name: String,
    #[serde(default)]
    snapshot: Option<String>,
    provisioned_size: u64,
    used_size: u64,
}

#[derive(Debug, Deserialize)]
struct DuReport {
    #[serde(default)]
    images: Vec<DuEntry>,
}

/// One row of `rbd ls -l`: either an image head or one of its snapshots.
#[derive(Debug, Clone, Deserialize)]
pub struct ListedImage {
    pub image: String,
    pub size: u64,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub protected: bool,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MappedDevice {
    pub pool: String,
    pub name: String,
    #[serde(default)]
    pub snap: Option<String>,
    pub device: PathBuf,
}

impl MappedDevice {
    pub fn spec(&self) -> ImageSpec {
        match self.snap.as_deref() {
            Some(snap) if snap != "-" && !snap.is_empty() => {
                ImageSpec::snapshot(&self.pool, &self.name, snap)
            }
            _ => ImageSpec::image(&self.pool, &self.name),
        }
    }
}

/// Older releases key `showmapped` output by device id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowMapped {
    List(Vec<MappedDevice>),
    Keyed(BTreeMap<String, MappedDevice>),
}

impl Default for ShowMapped {
    fn default() -> Self {
        ShowMapped::List(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChildEntry {
    Object { pool: String, image: String },
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct ImageStatus {
    #[serde(default)]
    watchers: Vec<Watcher>,
}

#[derive(Debug, Deserialize)]
struct Watcher {
    address: String,
}

/// Typed wrapper over the `rbd` tool for one pool.
#[derive(Clone)]
pub struct RbdClient {
    gateway: Gateway,
    pool: PoolReference,
}

impl RbdClient {
    pub fn new(gateway: Gateway, pool: PoolReference) -> Self {
        Self { gateway, pool }
    }

    pub fn pool(&self) -> &PoolReference {
        &self.pool
    }

    pub fn spec(&self, image: &str) -> ImageSpec {
        ImageSpec::image(&self.pool.pool, image)
    }

    fn invocation(&self, args: &[&str]) -> crate::command::ToolInvocation {
        let mut full = cluster_args(&self.pool);
        full.extend(args.iter().map(|arg| arg.to_string()));
        self.gateway.invocation(Tool::Rbd, full, Vec::new())
    }

    async fn run(&self, operation: &str, target: &str, args: &[&str]) -> Result<String> {
        let invocation = self.invocation(args);
        self.gateway.run_checked(&invocation, operation, target).await
    }

    async fn run_retrying(&self, operation: &str, target: &str, args: &[&str]) -> Result<String> {
        let invocation = self.invocation(args);
        self.gateway
            .run_retrying(&invocation, operation, target)
            .await
    }

    /// Create a format 2 image with layering; returns the size actually allocated.
    pub async fn create(&self, image: &str, size_bytes: u64) -> Result<u64> {
        let spec = self.spec(image).to_string();
        let size = size_arg(size_bytes);
        info!("Creating image {} ({})", spec, size);

        self.run(
            "create image",
            &spec,
            &[
                "create",
                &spec,
                "--size",
                &size,
                "--image-format",
                "2",
                "--image-feature",
                "layering",
            ],
        )
        .await
        .map_err(|e| self.quota_context(e))?;

        Ok(round_up_to_mib(size_bytes))
    }

    pub async fn remove(&self, image: &str) -> Result<()> {
        let spec = self.spec(image).to_string();
        info!("Removing image {}", spec);
        self.run_retrying("remove image", &spec, &["rm", "--no-progress", &spec])
            .await?;
        Ok(())
    }

    pub async fn resize(&self, image: &str, size_bytes: u64, allow_shrink: bool) -> Result<u64> {
        let spec = self.spec(image).to_string();
        let size = size_arg(size_bytes);
        info!("Resizing image {} to {}", spec, size);

        let mut args = vec!["resize", "--no-progress", spec.as_str(), "--size", size.as_str()];
        if allow_shrink {
            args.push("--allow-shrink");
        }
        self.run("resize image", &spec, &args)
            .await
            .map_err(|e| self.quota_context(e))?;

        Ok(round_up_to_mib(size_bytes))
    }

    pub async fn info(&self, spec: &ImageSpec) -> Result<ImageInfo> {
        let target = spec.to_string();
        let stdout = self
            .run_retrying("image info", &target, &["info", &target, "--format", "json"])
            .await?;
        Ok(serde_json::from_str(stdout.trim())?)
    }

    /// Provisioned and allocated bytes of the image head.
    pub async fn disk_usage(&self, image: &str) -> Result<DiskUsage> {
        let target = self.spec(image).to_string();
        let stdout = self
            .run_retrying("disk usage", &target, &["du", &target, "--format", "json"])
            .await?;
        let report: DuReport = serde_json::from_str(stdout.trim())?;

        report
            .images
            .into_iter()
            .find(|entry| entry.name == image && entry.snapshot.is_none())
            .map(|entry| DiskUsage {
                provisioned: entry.provisioned_size,
                used: entry.used_size,
            })
            .ok_or_else(|| SrError::NotFound {
                resource: target.clone(),
            })
    }

    /// `rbd ls -l`: image heads and their snapshots.
    pub async fn list_long(&self) -> Result<Vec<ListedImage>> {
        let pool = self.pool.pool.clone();
        let stdout = self
            .run_retrying("list images", &pool, &["ls", "-l", "--format", "json", &pool])
            .await
            .map_err(|e| match e {
                SrError::NotFound { .. } => SrError::PoolNotFound {
                    pool: pool.clone(),
                    detail: "rbd ls reported no such pool".to_string(),
                },
                other => other,
            })?;
        parse_json_or_default(&stdout)
    }

    /// Map the image into the kernel. Single attempt; callers own retries.
    pub async fn map(&self, spec: &ImageSpec, read_only: bool, exclusive: bool) -> Result<PathBuf> {
        let target = spec.to_string();
        let mut args = vec!["map", target.as_str()];
        if read_only {
            args.push("--read-only");
        }
        if exclusive {
            args.push("--exclusive");
        }

        let stdout = self.run("map image", &target, &args).await?;
        let device = stdout.trim();
        if device.is_empty() {
            return Err(SrError::Unknown {
                operation: "map image".to_string(),
                target,
                detail: "rbd map printed no device path".to_string(),
            });
        }

        debug!("Mapped {} at {}", target, device);
        Ok(PathBuf::from(device))
    }

    /// Single attempt; callers own retries.
    pub async fn unmap(&self, device: &Path) -> Result<()> {
        let target = device.display().to_string();
        self.run("unmap device", &target, &["unmap", &target])
            .await?;
        Ok(())
    }

    /// Live kernel mappings on this host, for every pool.
    pub async fn show_mapped(&self) -> Result<Vec<MappedDevice>> {
        let stdout = self
            .run_retrying(
                "list mapped devices",
                "host",
                &["showmapped", "--format", "json"],
            )
            .await?;

        Ok(match parse_json_or_default::<ShowMapped>(&stdout)? {
            ShowMapped::List(devices) => devices,
            ShowMapped::Keyed(devices) => devices.into_values().collect(),
        })
    }

    /// Client addresses holding a watch on the image.
    pub async fn watchers(&self, image: &str) -> Result<Vec<String>> {
        let target = self.spec(image).to_string();
        let stdout = self
            .run_retrying("image status", &target, &["status", &target, "--format", "json"])
            .await?;
        let status: ImageStatus = parse_json_or_default(&stdout)?;
        Ok(status.watchers.into_iter().map(|w| w.address).collect())
    }

    pub async fn snap_create(&self, snap: &ImageSpec) -> Result<()> {
        let target = snap.to_string();
        info!("Creating snapshot {}", target);
        self.run("create snapshot", &target, &["snap", "create", &target])
            .await?;
        Ok(())
    }

    /// Idempotent: an already protected snapshot is left alone.
    pub async fn snap_protect(&self, snap: &ImageSpec) -> Result<()> {
        let target = snap.to_string();
        let name = snap.snapshot.as_deref().unwrap_or_default();

        let snapshots = self.snap_list(&snap.image).await?;
        match snapshots.iter().find(|s| s.name == name) {
            Some(existing) if existing.protected => {
                debug!("Snapshot {} already protected", target);
                return Ok(());
            }
            Some(_) => {}
            None => {
                return Err(SrError::NotFound { resource: target });
            }
        }

        match self
            .run("protect snapshot", &target, &["snap", "protect", &target])
            .await
        {
            Ok(_) | Err(SrError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn snap_unprotect(&self, snap: &ImageSpec) -> Result<()> {
        let target = snap.to_string();
        self.run("unprotect snapshot", &target, &["snap", "unprotect", &target])
            .await?;
        Ok(())
    }

    pub async fn snap_remove(&self, snap: &ImageSpec) -> Result<()> {
        let target = snap.to_string();
        info!("Removing snapshot {}", target);
        self.run("remove snapshot", &target, &["snap", "rm", "--no-progress", &target])
            .await?;
        Ok(())
    }

    pub async fn snap_list(&self, image: &str) -> Result<Vec<SnapshotInfo>> {
        let target = self.spec(image).to_string();
        let stdout = self
            .run_retrying("list snapshots", &target, &["snap", "ls", &target, "--format", "json"])
            .await?;
        parse_json_or_default(&stdout)
    }

    /// Remove every unprotected snapshot of the image.
    pub async fn snap_purge(&self, image: &str) -> Result<()> {
        let target = self.spec(image).to_string();
        self.run("purge snapshots", &target, &["snap", "purge", "--no-progress", &target])
            .await?;
        Ok(())
    }

    /// Images cloned from the given snapshot.
    pub async fn children(&self, snap: &ImageSpec) -> Result<Vec<ImageSpec>> {
        let target = snap.to_string();
        let stdout = self
            .run_retrying("list children", &target, &["children", &target, "--format", "json"])
            .await?;
        let entries: Vec<ChildEntry> = parse_json_or_default(&stdout)?;

        entries
            .into_iter()
            .map(|entry| match entry {
                ChildEntry::Object { pool, image } => Ok(ImageSpec::image(&pool, &image)),
                ChildEntry::Text(text) => ImageSpec::parse(&text),
            })
            .collect()
    }

    /// Clone a protected snapshot into a new image of this pool.
    pub async fn clone_image(&self, source: &ImageSpec, dest_image: &str) -> Result<()> {
        let source_spec = source.to_string();
        let dest = self.spec(dest_image).to_string();
        info!("Cloning {} into {}", source_spec, dest);

        self.run(
            "clone snapshot",
            &dest,
            &[
                "clone",
                &source_spec,
                &dest,
                "--image-feature",
                "layering",
            ],
        )
        .await
        .map_err(|e| self.quota_context(e))?;
        Ok(())
    }

    /// Copy all parent data into the image, detaching it from its parent.
    pub async fn flatten(&self, image: &str) -> Result<()> {
        let target = self.spec(image).to_string();
        info!("Flattening {}", target);
        self.run("flatten image", &target, &["flatten", "--no-progress", &target])
            .await
            .map_err(|e| self.quota_context(e))?;
        Ok(())
    }

    pub async fn meta_get(&self, image: &str, key: &str) -> Result<Option<String>> {
        let target = self.spec(image).to_string();
        match self
            .run_retrying("get image metadata", &target, &["image-meta", "get", &target, key])
            .await
        {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(SrError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn meta_set(&self, image: &str, key: &str, value: &str) -> Result<()> {
        let target = self.spec(image).to_string();
        self.run(
            "set image metadata",
            &target,
            &["image-meta", "set", &target, key, value],
        )
        .await?;
        Ok(())
    }

    fn quota_context(&self, error: SrError) -> SrError {
        match error {
            SrError::QuotaExceeded { message, .. } => SrError::QuotaExceeded {
                pool: self.pool.pool.clone(),
                message,
            },
            other => other,
        }
    }
}
