use crate::types::PoolReference;
use crate::{Result, SrError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/rbdsr/config.yaml";
pub const CONFIG_ENV_VAR: &str = "RBDSR_CONFIG";
pub const DEFAULT_CEPH_CONF: &str = "/etc/ceph/ceph.conf";
pub const DEFAULT_AUTH_USER: &str = "admin";

const COMMON_KEYS: &[&str] = &[
    "pool",
    "config_path",
    "auth_user",
    "keyring_path",
    "monitor_hosts",
];
const OVERLAY_KEYS: &[&str] = &["image", "size", "protected"];

/// Host-wide driver settings, read from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lvm_conf_root: PathBuf,
    pub command_timeout_secs: u64,
    pub device_settle_timeout_secs: u64,
    pub retry: RetrySettings,
    pub tools: ToolPathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPathConfig {
    pub rbd: Option<PathBuf>,
    pub ceph: Option<PathBuf>,
    pub lvm: Option<PathBuf>,
}

impl DriverConfig {
    /// Load settings from `path`, or from `$RBDSR_CONFIG`, or from the default location.
    /// A missing file yields the defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path
            .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DriverConfig = serde_yaml::from_str(&content)
                .map_err(|e| SrError::ConfigInvalid(e.to_string()))?;
            config.validate()?;
            debug!("Loaded driver settings from {}", config_path.display());
            Ok(config)
        } else {
            debug!(
                "No driver settings at {}, using defaults",
                config_path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(SrError::ConfigInvalid(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SrError::ConfigInvalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(SrError::ConfigInvalid(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// `None` disables waiting for the mapped device node to appear.
    pub fn device_settle_timeout(&self) -> Option<Duration> {
        if self.device_settle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.device_settle_timeout_secs))
        }
    }

    pub fn mappings_dir(&self) -> PathBuf {
        self.state_dir.join("mappings")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.state_dir.join("repositories")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.state_dir.join("attachments")
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/rbdsr"),
            log_dir: PathBuf::from("/var/log/rbdsr"),
            lvm_conf_root: PathBuf::from("/etc/lvm/lvmorbd"),
            command_timeout_secs: 120,
            device_settle_timeout_secs: 30,
            retry: RetrySettings::default(),
            tools: ToolPathConfig::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Which repository layout a device configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// One virtual disk per RBD image.
    Rbd,
    /// One volume group on a single RBD image, one logical volume per disk.
    #[serde(rename = "lvmorbd")]
    LvmOverRbd,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Rbd => write!(f, "rbd"),
            DriverKind::LvmOverRbd => write!(f, "lvmorbd"),
        }
    }
}

/// Validated per-invocation device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub kind: DriverKind,
    pub pool: PoolReference,
    pub overlay: Option<OverlayConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub image: String,
    /// Raw size with optional K/M/G/T unit, only needed when creating.
    pub size: Option<String>,
    pub protected: bool,
}

impl DeviceConfig {
    pub fn from_map(kind: DriverKind, map: &BTreeMap<String, String>) -> Result<Self> {
        let allowed: Vec<&str> = match kind {
            DriverKind::Rbd => COMMON_KEYS.to_vec(),
            DriverKind::LvmOverRbd => COMMON_KEYS.iter().chain(OVERLAY_KEYS).copied().collect(),
        };

        let mut unknown: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|key| !allowed.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(SrError::ConfigInvalid(format!(
                "unrecognized device-config key(s) for {kind} driver: {}",
                unknown.join(", ")
            )));
        }

        let pool = required(map, "pool")?;
        validate_object_name("pool", &pool)?;

        let config_path = map
            .get("config_path")
            .map(|p| PathBuf::from(p.trim()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CEPH_CONF));

        let auth_user = optional(map, "auth_user").unwrap_or_else(|| DEFAULT_AUTH_USER.to_string());
        let keyring_path = optional(map, "keyring_path").map(PathBuf::from);

        let monitor_hosts = optional(map, "monitor_hosts")
            .map(|hosts| {
                hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let overlay = match kind {
            DriverKind::Rbd => None,
            DriverKind::LvmOverRbd => {
                let image = required(map, "image")?;
                validate_object_name("image", &image)?;

                let protected = match optional(map, "protected") {
                    None => true,
                    Some(value) => parse_bool("protected", &value)?,
                };

                Some(OverlayConfig {
                    image,
                    size: optional(map, "size"),
                    protected,
                })
            }
        };

        Ok(Self {
            kind,
            pool: PoolReference {
                pool,
                config_path,
                auth_user,
                keyring_path,
                monitor_hosts,
            },
            overlay,
        })
    }

    /// Parse `key=value` pairs as given on the command line.
    pub fn parse_pairs<I, S>(kind: DriverKind, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                SrError::ConfigInvalid(format!("device-config entry '{pair}' is not key=value"))
            })?;
            if map.insert(key.trim().to_string(), value.to_string()).is_some() {
                return Err(SrError::ConfigInvalid(format!(
                    "device-config key '{}' given more than once",
                    key.trim()
                )));
            }
        }
        Self::from_map(kind, &map)
    }
}

fn optional(map: &BTreeMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(map: &BTreeMap<String, String>, key: &str) -> Result<String> {
    optional(map, key).ok_or_else(|| {
        SrError::ConfigInvalid(format!("device-config is missing required key '{key}'"))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(SrError::ConfigInvalid(format!(
            "'{key}' must be true or false, got '{value}'"
        ))),
    }
}

fn validate_object_name(key: &str, value: &str) -> Result<()> {
    if value
        .chars()
        .any(|c| c == '/' || c == '@' || c.is_whitespace() || c.is_control())
    {
        return Err(SrError::ConfigInvalid(format!(
            "'{key}' contains characters not allowed in a Ceph name: '{value}'"
        )));
    }
    Ok(())
}
