//! Application configuration.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::disk::FAT_FILESYSTEMS;
use crate::traits::FourCC;

/// Largest buffer pool accepted (V4L2 drivers cap requests well below this).
pub const MAX_BUFFER_COUNT: u32 = 32;

/// Full configuration file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Camera and format negotiation settings.
    pub camera: CameraConfig,
    /// SD card volume settings.
    pub storage: StorageConfig,
    /// Capture sequence settings.
    pub capture: CaptureConfig,
}

/// Camera settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// V4L2 device index (0 for /dev/video0).
    pub device_index: u32,
    /// Requested frame width; 0 keeps the driver default.
    pub width: u32,
    /// Requested frame height; 0 keeps the driver default.
    pub height: u32,
    /// Requested pixel format as a four-character code; empty keeps the default.
    pub pixel_format: String,
    /// Number of frame buffers in the pool.
    pub buffer_count: u32,
    /// How long a dequeue waits for a frame, in milliseconds.
    pub dequeue_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 0,
            height: 0,
            pixel_format: String::new(),
            buffer_count: 2,
            dequeue_timeout_ms: 5000,
        }
    }
}

impl CameraConfig {
    /// Parsed pixel format override, if one is configured.
    pub fn pixel_format(&self) -> Result<Option<FourCC>, ConfigError> {
        if self.pixel_format.is_empty() {
            return Ok(None);
        }
        self.pixel_format
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidPixelFormat(self.pixel_format.clone()))
    }

    /// Dequeue timeout as a duration.
    pub const fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    /// Validates the camera parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pixel_format()?;
        if self.buffer_count == 0 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::InvalidBufferCount(self.buffer_count));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

/// SD card volume settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block device name of the card (as listed under `sysfs_root`).
    pub drive: String,
    /// Directory holding the card's device node.
    pub device_dir: PathBuf,
    /// Filesystem type used when mounting the card.
    pub fstype: String,
    /// Directory the card's FAT filesystem is attached to.
    pub mount_point: PathBuf,
    /// File name prefix for saved frames.
    pub frame_prefix: String,
    /// Where block devices are listed in sysfs.
    pub sysfs_root: PathBuf,
    /// Mount table to look the mount point up in.
    pub mount_table: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            drive: "mmcblk0".to_owned(),
            device_dir: PathBuf::from("/dev"),
            fstype: "vfat".to_owned(),
            mount_point: PathBuf::from("/media/sdcard"),
            frame_prefix: "frame-".to_owned(),
            sysfs_root: PathBuf::from("/sys/class/block"),
            mount_table: PathBuf::from("/proc/self/mounts"),
        }
    }
}

impl StorageConfig {
    /// Storage settings for a volume at `mount_point`, other fields default.
    pub fn with_mount_point(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            ..Default::default()
        }
    }

    /// Validates the storage parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_prefix.is_empty() || self.frame_prefix.contains('/') {
            return Err(ConfigError::InvalidFramePrefix(self.frame_prefix.clone()));
        }
        if self.mount_point.as_os_str().is_empty() {
            return Err(ConfigError::MissingMountPoint);
        }
        if !FAT_FILESYSTEMS.contains(&self.fstype.as_str()) {
            return Err(ConfigError::UnsupportedFilesystem(self.fstype.clone()));
        }
        Ok(())
    }
}

/// Capture sequence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Number used in the file name of the first saved frame.
    pub first_frame: u32,
    /// Number of frames saved at startup.
    pub frame_count: u32,
    /// Frames dequeued and requeued unsaved before the first save.
    pub skip_frames: u32,
    /// Pause after mounting the card, in milliseconds.
    pub settle_delay_ms: u64,
    /// Run the interactive shell after the startup capture.
    pub shell: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            first_frame: 2,
            frame_count: 1,
            skip_frames: 0,
            settle_delay_ms: 1000,
            shell: true,
        }
    }
}

impl CaptureConfig {
    /// Settle delay as a duration.
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Pixel format is not a four-character code.
    #[error("invalid pixel format '{0}': expected 4 ASCII characters")]
    InvalidPixelFormat(String),
    /// Buffer pool size out of range.
    #[error("invalid buffer count {0} (must be 1-32)")]
    InvalidBufferCount(u32),
    /// Zero dequeue timeout.
    #[error("dequeue timeout must be greater than zero")]
    InvalidTimeout,
    /// Frame prefix is empty or contains a path separator.
    #[error("invalid frame prefix '{0}'")]
    InvalidFramePrefix(String),
    /// No mount point configured.
    #[error("mount point must not be empty")]
    MissingMountPoint,
    /// Card filesystem is not one of the FAT family.
    #[error("unsupported card filesystem '{0}'")]
    UnsupportedFilesystem(String),
    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    /// Config file is not valid TOML for this format.
    #[error("failed to parse config file: {0}")]
    ParseError(String),
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        self.storage.validate()
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.buffer_count, 2);
        assert_eq!(config.camera.dequeue_timeout(), Duration::from_secs(5));
        assert_eq!(config.capture.first_frame, 2);
        assert_eq!(config.storage.frame_prefix, "frame-");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [camera]
            width = 240
            height = 240
            pixel_format = "RGBP"

            [storage]
            mount_point = "/mnt/card"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.camera.width, 240);
        assert_eq!(config.camera.buffer_count, 2);
        assert_eq!(
            config.camera.pixel_format().expect("valid"),
            Some(FourCC::new(b"RGBP"))
        );
        assert_eq!(config.storage.mount_point, PathBuf::from("/mnt/card"));
        assert_eq!(config.storage.drive, "mmcblk0");
        assert_eq!(config.storage.device_dir, PathBuf::from("/dev"));
        assert_eq!(config.storage.fstype, "vfat");
        assert!(config.capture.shell);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.camera.pixel_format = "YUV".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPixelFormat(_))
        ));

        let mut config = AppConfig::default();
        config.camera.buffer_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferCount(0))
        ));

        let mut config = AppConfig::default();
        config.storage.frame_prefix = "a/b".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFramePrefix(_))
        ));

        let mut config = AppConfig::default();
        config.storage.fstype = "ext4".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedFilesystem(_))
        ));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cam.toml");
        let mut config = AppConfig::default();
        config.capture.frame_count = 3;
        std::fs::write(&path, config.to_toml().expect("serialize")).expect("write");

        let loaded = AppConfig::from_file(&path).expect("load");
        assert_eq!(loaded.capture.frame_count, 3);

        assert!(matches!(
            AppConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::FileReadError(_))
        ));
    }
}
