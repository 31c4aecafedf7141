//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded (`modprobe vivid`)
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Tests will fail if vivid is not available.

#![cfg(feature = "integration")]

use cam_sdcard::config::{CameraConfig, StorageConfig};
use cam_sdcard::device::V4L2Device;
use cam_sdcard::traits::{CameraDevice, CameraError, CaptureStream, FourCC, VideoBuffer};
use cam_sdcard::{grab_and_save, Camera, Volume};
use serial_test::serial;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check device driver name before opening, avoiding
/// unnecessary device opens on real cameras.
fn find_vivid_devices() -> Vec<u32> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        // Verify we can actually open it as a capture device
        if V4L2Device::open(index).is_ok_and(|dev| dev.capabilities().can_capture) {
            devices.push(index);
        }
    }
    devices
}

/// Integration tests MUST have vivid loaded - they fail, not silently skip.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().copied() {
            Some(idx) => idx,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

fn vga_config(index: u32) -> CameraConfig {
    CameraConfig {
        device_index: index,
        width: 640,
        height: 480,
        pixel_format: "YUYV".to_owned(),
        buffer_count: 4,
        ..CameraConfig::default()
    }
}

/// A temp directory listed as a host-mounted card in a private mount table.
fn temp_volume(root: &Path) -> Volume {
    let card = root.join("card");
    fs::create_dir_all(&card).expect("create card dir");
    let target = fs::canonicalize(&card).expect("canonical card dir");
    let table = root.join("mounts");
    fs::write(&table, format!("/dev/mmcblk0p1 {} vfat rw 0 0\n", target.display()))
        .expect("write mount table");

    let mut config = StorageConfig::with_mount_point(card);
    config.sysfs_root = root.join("sys");
    config.mount_table = table;
    Volume::init(&config).expect("Failed to mount temp volume")
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let device_index = require_vivid!();

    let device = V4L2Device::open(device_index).expect("Failed to open vivid device");
    let caps = device.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");

    println!("Opened vivid device:");
    println!("  Driver: {}", caps.driver);
    println!("  Card: {}", caps.card);
    println!("  Bus: {}", caps.bus_info);
}

#[test]
#[serial]
fn test_vivid_capabilities_and_intervals() {
    let device_index = require_vivid!();

    let device = V4L2Device::open(device_index).expect("Failed to open vivid device");
    let caps = device.format_caps().expect("Failed to enumerate formats");
    for cap in &caps {
        println!("  {cap}");
    }
    assert!(
        caps.iter().any(|cap| cap.fourcc == FourCC::YUYV),
        "vivid should offer YUYV"
    );

    let format = device.format().expect("Failed to query format");
    assert!(format.width > 0, "Width should be positive");
    assert!(format.height > 0, "Height should be positive");

    let intervals = device
        .frame_intervals(&format)
        .expect("Failed to enumerate frame intervals");
    assert!(!intervals.is_empty(), "vivid should report frame intervals");

    let interval = device.frame_interval().expect("Failed to query frame rate");
    assert!(interval.fps() > 0.0, "Frame rate should be positive");
}

#[test]
#[serial]
fn test_vivid_camera_init() {
    let device_index = require_vivid!();

    let device = V4L2Device::open(device_index).expect("Failed to open vivid device");
    let camera = Camera::init(device, &vga_config(device_index)).expect("Failed to init camera");

    assert_eq!(camera.format().width, 640, "Width mismatch");
    assert_eq!(camera.format().height, 480, "Height mismatch");
    assert_eq!(camera.format().fourcc, FourCC::YUYV);
    assert_eq!(camera.available_buffers(), 4);
    assert!(camera.buffer_size() >= 640 * 480 * 2);
}

#[test]
#[serial]
fn test_vivid_queue_discipline() {
    let device_index = require_vivid!();

    let mut device = V4L2Device::open(device_index).expect("Failed to open vivid device");
    let mut stream = device.create_stream(2).expect("Failed to create stream");

    assert!(matches!(
        stream.dequeue(Duration::from_secs(1)),
        Err(CameraError::NotStreaming)
    ));

    for index in 0..2 {
        let buffer = VideoBuffer::alloc(index, 640 * 480 * 4).expect("alloc");
        stream.enqueue(buffer).expect("Failed to enqueue");
    }
    stream.start().expect("Failed to start");

    let mut sequences = Vec::new();
    for _ in 0..6 {
        let frame = stream
            .dequeue(Duration::from_secs(5))
            .expect("Failed to capture frame");
        assert!(frame.bytes_used() > 0, "Bytes used should be positive");
        assert_eq!(
            frame.data().len(),
            frame.bytes_used(),
            "Only the driver's payload is copied"
        );
        sequences.push(frame.metadata().sequence);
        stream.enqueue(frame).expect("Failed to requeue");
    }
    assert!(
        sequences.windows(2).all(|pair| pair[1] > pair[0]),
        "Sequence numbers should increase: {sequences:?}"
    );

    let reclaimed = stream.stop().expect("Failed to stop");
    assert_eq!(reclaimed.len(), 2);
}

#[test]
#[serial]
fn test_vivid_grab_and_save() {
    let device_index = require_vivid!();
    let dir = tempfile::tempdir().expect("tempdir");
    let volume = temp_volume(dir.path());

    let device = V4L2Device::open(device_index).expect("Failed to open vivid device");
    let mut camera =
        Camera::init(device, &vga_config(device_index)).expect("Failed to init camera");

    let mut stream = camera.open_stream().expect("Failed to open stream");
    stream.setup_buffers().expect("Failed to queue buffers");
    stream.start().expect("Failed to start stream");

    let first = grab_and_save(&mut stream, &volume, 2).expect("Failed to grab frame 2");
    let second = grab_and_save(&mut stream, &volume, 3).expect("Failed to grab frame 3");
    stream.stop().expect("Failed to stop stream");
    drop(stream);

    for path in [&first, &second] {
        let size = fs::metadata(path).expect("frame file exists").len();
        println!("{}: {size} bytes", path.display());
        assert!(size >= 640 * 480 * 2, "Frame file too small: {size}");
    }
    assert_eq!(camera.available_buffers(), 4);
}
