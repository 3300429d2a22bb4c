use crate::registry::DeviceId;
use std::path::PathBuf;
use thiserror::Error;

/// Failures opening or talking to a raw device
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no input device matches {0}")]
    NotFound(String),
    #[error("permission denied opening {}", .path.display())]
    PermissionDenied { path: PathBuf },
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("malformed device selector: {0}")]
    Selector(String),
    #[error("malformed valuator mapping {key}: {reason}")]
    Mapping { key: String, reason: String },
}

/// Failure building one adapter; the adapter is discarded as a whole
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device entry '{entry}': {source}")]
    Device {
        entry: String,
        #[source]
        source: DeviceError,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0:?} already has a haptic feature registered")]
    AlreadyRegistered(DeviceId),
    #[error("unknown device {0:?}")]
    UnknownDevice(DeviceId),
}
