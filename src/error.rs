use crate::bag::BagError;
use crate::lifecycle::{LifecycleError, ManagerError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrabError>;

/// Any error this crate produces, for callers that just want `?`
#[derive(Debug, Error)]
pub enum CrabError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Bag(#[from] BagError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Malformed configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {key}: '{value}' ({reason})")]
    InvalidDuration {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown signal: {0}")]
    InvalidSignal(String),

    #[error("unknown log format: {0}")]
    InvalidLogFormat(String),
}
