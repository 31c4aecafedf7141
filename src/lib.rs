//! cam-sdcard: capture camera frames onto a FAT-formatted SD card.
//!
//! The library wraps three pieces: a V4L2 camera with a fixed pool of frame
//! buffers, the card's mounted volume, and a small command shell. The
//! binary runs them in a fixed order: mount the card, negotiate the camera
//! format, capture and save a frame, then serve shell commands.
//!
//! Camera access goes through the [`CameraDevice`] and [`CaptureStream`]
//! traits so the whole sequence also runs against [`mock::MockDevice`].

pub mod app;
pub mod camera;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod mock;
pub mod shell;
pub mod storage;
pub mod traits;

pub use app::{grab_and_discard, grab_and_save, Session};
pub use camera::{Camera, CameraStream};
pub use config::AppConfig;
pub use device::V4L2Device;
pub use error::{Error, Result};
pub use storage::Volume;
pub use traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC, FrameMetadata,
    VideoBuffer,
};
