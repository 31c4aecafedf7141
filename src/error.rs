//! Crate-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::traits::CameraError;

/// Any failure of the capture application.
#[derive(Debug, Error)]
pub enum Error {
    /// Camera or stream failure.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// SD card volume failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Terminal I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for application operations.
pub type Result<T> = std::result::Result<T, Error>;
