use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SrError {
    #[error("Pool {pool} not found: {detail}")]
    PoolNotFound { pool: String, detail: String },

    #[error("Quota exceeded in pool {pool}: {message}")]
    QuotaExceeded { pool: String, message: String },

    #[error("Image {image} is still mapped (refcount {refcount})")]
    StillMapped { image: String, refcount: u32 },

    #[error("Image {image} has dependent clones: {}", clones.join(", "))]
    HasClones { image: String, clones: Vec<String> },

    #[error("Resource busy during {operation} on {target}: {detail}")]
    Busy {
        operation: String,
        target: String,
        detail: String,
    },

    #[error("Timed out during {operation} on {target} after {seconds}s")]
    Timeout {
        operation: String,
        target: String,
        seconds: u64,
    },

    #[error("Permission denied during {operation} on {target}: {detail}")]
    PermissionDenied {
        operation: String,
        target: String,
        detail: String,
    },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Refusing to shrink {image} from {current} to {requested} bytes: {reason}")]
    ShrinkRejected {
        image: String,
        current: u64,
        requested: u64,
        reason: String,
    },

    #[error("Repository {repository} still contains {count} virtual disk(s)")]
    NotEmpty { repository: String, count: usize },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Tool failure during {operation} on {target}: {detail}")]
    Unknown {
        operation: String,
        target: String,
        detail: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SrError>;

/// Flat error code reported to the host control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PoolNotFound,
    QuotaExceeded,
    StillMapped,
    HasClones,
    Busy,
    Timeout,
    PermissionDenied,
    ConfigInvalid,
    AlreadyExists,
    NotFound,
    ShrinkRejected,
    NotEmpty,
    InvalidStateTransition,
    Unsupported,
    Unknown,
}

impl SrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SrError::PoolNotFound { .. } => ErrorKind::PoolNotFound,
            SrError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            SrError::StillMapped { .. } => ErrorKind::StillMapped,
            SrError::HasClones { .. } => ErrorKind::HasClones,
            SrError::Busy { .. } => ErrorKind::Busy,
            SrError::Timeout { .. } => ErrorKind::Timeout,
            SrError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            SrError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            SrError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            SrError::NotFound { .. } => ErrorKind::NotFound,
            SrError::ShrinkRejected { .. } => ErrorKind::ShrinkRejected,
            SrError::NotEmpty { .. } => ErrorKind::NotEmpty,
            SrError::InvalidStateTransition(_) => ErrorKind::InvalidStateTransition,
            SrError::Unsupported(_) => ErrorKind::Unsupported,
            SrError::Unknown { .. }
            | SrError::IoError(_)
            | SrError::SerializationError(_)
            | SrError::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Busy and Timeout are the only kinds worth retrying locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SrError::Busy { .. } | SrError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SrError::NotFound { .. } | SrError::PoolNotFound { .. })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorKind::PoolNotFound => "PoolNotFound",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::StillMapped => "StillMapped",
            ErrorKind::HasClones => "HasClones",
            ErrorKind::Busy => "Busy",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ShrinkRejected => "ShrinkRejected",
            ErrorKind::NotEmpty => "NotEmpty",
            ErrorKind::InvalidStateTransition => "InvalidStateTransition",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Unknown => "Unknown",
        };
        write!(f, "{code}")
    }
}
