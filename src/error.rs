use std::time::Duration;

use thiserror::Error;

/// Why a coordinator tick produced no field map.
///
/// Every variant ends up as a missed update for the entities. `Unreachable`
/// is kept apart so logs can tell a silent device from a broken link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadFailure {
    #[error("device not present")]
    Unreachable,
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("read failed: {0}")]
    Transport(String),
}

/// Why a write was refused before touching the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("device uses encryption and is read-only")]
    Encrypted,
    #[error("field is not writable")]
    NotWritable,
    #[error("value {0} is not valid for this field")]
    InvalidValue(String),
}

/// Why an attempted write did not go through.
#[derive(Debug, Error)]
pub enum WriteFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(anyhow::Error),
}

/// Error returned to whoever initiated a write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Refused before the access lock was taken. No I/O happened.
    #[error("write to {field} rejected: {reason}")]
    Rejected { field: String, reason: RejectReason },
    /// The device session failed the write. No refresh was requested.
    #[error("write to {field} failed: {cause}")]
    Failed { field: String, cause: WriteFailure },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config entry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be {constraint}")]
    Invalid {
        field: &'static str,
        constraint: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("device {0} not present")]
    NotReady(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
