use crate::{Result, SrError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub const IMAGE_PREFIX: &str = "vdi-";
pub const SNAPSHOT_PREFIX: &str = "snap-";
pub const CLONE_BASE_PREFIX: &str = "base-";
pub const VOLUME_GROUP_PREFIX: &str = "VG_RBDSR-";
pub const LOGICAL_VOLUME_PREFIX: &str = "LV-";
pub const SHARABLE_META_KEY: &str = "rbdsr.sharable";

/// Where a repository's images live and how to authenticate against the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReference {
    pub pool: String,
    pub config_path: PathBuf,
    pub auth_user: String,
    pub keyring_path: Option<PathBuf>,
    pub monitor_hosts: Vec<String>,
}

/// An image, or a snapshot of one, inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageSpec {
    pub pool: String,
    pub image: String,
    pub snapshot: Option<String>,
}

impl ImageSpec {
    pub fn image(pool: &str, image: &str) -> Self {
        Self {
            pool: pool.to_string(),
            image: image.to_string(),
            snapshot: None,
        }
    }

    pub fn snapshot(pool: &str, image: &str, snapshot: &str) -> Self {
        Self {
            pool: pool.to_string(),
            image: image.to_string(),
            snapshot: Some(snapshot.to_string()),
        }
    }

    /// The spec of the image this snapshot belongs to (itself for plain images).
    pub fn base(&self) -> Self {
        Self::image(&self.pool, &self.image)
    }

    pub fn with_snapshot(&self, snapshot: &str) -> Self {
        Self::snapshot(&self.pool, &self.image, snapshot)
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Parse `pool/image[@snap]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (pool, rest) = spec
            .split_once('/')
            .ok_or_else(|| SrError::ConfigInvalid(format!("image spec '{spec}' has no pool")))?;
        let (image, snapshot) = match rest.split_once('@') {
            Some((image, snap)) => (image, Some(snap.to_string())),
            None => (rest, None),
        };
        if pool.is_empty() || image.is_empty() {
            return Err(SrError::ConfigInvalid(format!("malformed image spec '{spec}'")));
        }
        Ok(Self {
            pool: pool.to_string(),
            image: image.to_string(),
            snapshot,
        })
    }
}

impl std::fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.snapshot {
            Some(snap) => write!(f, "{}/{}@{}", self.pool, self.image, snap),
            None => write!(f, "{}/{}", self.pool, self.image),
        }
    }
}

pub fn backing_image_name(id: &Uuid) -> String {
    format!("{IMAGE_PREFIX}{id}")
}

pub fn snapshot_name(id: &Uuid) -> String {
    format!("{SNAPSHOT_PREFIX}{id}")
}

pub fn clone_base_name(clone_id: &Uuid) -> String {
    format!("{CLONE_BASE_PREFIX}{clone_id}")
}

pub fn volume_group_name(repository_id: &Uuid) -> String {
    format!("{VOLUME_GROUP_PREFIX}{repository_id}")
}

pub fn logical_volume_name(id: &Uuid) -> String {
    format!("{LOGICAL_VOLUME_PREFIX}{id}")
}

/// Inverse of the naming functions above: `Some(uuid)` when `name` is `prefix` plus a UUID.
pub fn parse_prefixed_id(prefix: &str, name: &str) -> Option<Uuid> {
    let rest = name.strip_prefix(prefix)?;
    let id = Uuid::parse_str(rest).ok()?;
    // Only the canonical lowercase hyphenated form maps back, keeping the naming injective.
    (id.to_string() == rest).then_some(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    Unattached,
    Attaching,
    Attached,
    Detaching,
}

impl DiskState {
    pub fn can_transition_to(self, next: DiskState) -> bool {
        matches!(
            (self, next),
            (DiskState::Unattached, DiskState::Attaching)
                | (DiskState::Attaching, DiskState::Attached)
                | (DiskState::Attaching, DiskState::Unattached)
                | (DiskState::Attached, DiskState::Attaching)
                | (DiskState::Attached, DiskState::Detaching)
                | (DiskState::Detaching, DiskState::Unattached)
                | (DiskState::Detaching, DiskState::Attached)
        )
    }

    pub fn transition(self, next: DiskState) -> Result<DiskState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SrError::InvalidStateTransition(format!(
                "virtual disk cannot move from {self:?} to {next:?}"
            )))
        }
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskState::Unattached => write!(f, "unattached"),
            DiskState::Attaching => write!(f, "attaching"),
            DiskState::Attached => write!(f, "attached"),
            DiskState::Detaching => write!(f, "detaching"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDiskRecord {
    pub id: Uuid,
    /// For composition mode this names the logical volume; the pool is the repository pool.
    pub backing: ImageSpec,
    pub size_bytes: u64,
    pub read_only: bool,
    pub sharable: bool,
    pub parent: Option<ImageSpec>,
    pub state: DiskState,
    pub device_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityStats {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub quota: Option<u64>,
}

impl CapacityStats {
    pub fn new(capacity: u64, used: u64, quota: Option<u64>) -> Self {
        Self {
            capacity,
            used,
            free: capacity.saturating_sub(used),
            quota,
        }
    }
}

/// Composition-mode binding between a repository and its single backing image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayBinding {
    pub image: ImageSpec,
    pub volume_group: String,
    pub conf_dir: PathBuf,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: Uuid,
    pub pool: PoolReference,
    pub stats: CapacityStats,
    /// Sum of the nominal sizes of every virtual disk, as of the last scan.
    #[serde(default)]
    pub virtual_allocation: u64,
    pub overlay: Option<OverlayBinding>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryRecord {
    pub fn new(id: Uuid, pool: PoolReference, overlay: Option<OverlayBinding>) -> Self {
        Self {
            id,
            pool,
            stats: CapacityStats::default(),
            virtual_allocation: 0,
            overlay,
            updated_at: Utc::now(),
        }
    }

    pub fn overlay(&self) -> Result<&OverlayBinding> {
        self.overlay.as_ref().ok_or_else(|| {
            SrError::ConfigInvalid(format!(
                "repository {} has no volume-group binding",
                self.id
            ))
        })
    }

    pub fn update_stats(&mut self, stats: CapacityStats) {
        self.stats = stats;
        self.updated_at = Utc::now();
    }

    pub fn update_allocation(&mut self, disks: &[VirtualDiskRecord]) {
        self.virtual_allocation = disks.iter().map(|disk| disk.size_bytes).sum();
        self.updated_at = Utc::now();
    }
}

/// What a non-mutating probe found on the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub pools: Vec<String>,
    pub pool_exists: bool,
    pub images: Vec<ProbedImage>,
    pub volume_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbedImage {
    pub name: String,
    pub size_bytes: u64,
    pub disk_id: Option<Uuid>,
}
