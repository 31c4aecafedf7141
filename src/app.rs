//! Top-level capture sequence.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use tracing::{error, info};

use crate::camera::{Camera, CameraStream};
use crate::config::{AppConfig, CaptureConfig};
use crate::error::Result;
use crate::shell;
use crate::storage::Volume;
use crate::traits::CameraDevice;

/// Capture one frame and save it as frame `num`.
///
/// The stream is stopped while the file is written and restarted with the
/// whole pool queued afterwards. If the write fails the stream stays
/// stopped.
pub fn grab_and_save<D: CameraDevice>(
    stream: &mut CameraStream<'_, D>,
    volume: &Volume,
    num: u32,
) -> Result<PathBuf> {
    let vbuf = stream.frame_get()?;
    info!(
        "camera got frame, buffer {} seq {} ({} bytes)",
        vbuf.index(),
        vbuf.metadata().sequence,
        vbuf.bytes_used()
    );

    if let Err(err) = stream.stop() {
        stream.release(vbuf);
        return Err(err.into());
    }

    let written = volume.write_frame(num, vbuf.data());
    stream.release(vbuf);
    let path = written?;

    stream.setup_buffers()?;
    stream.start()?;

    info!("Done!");
    Ok(path)
}

/// Capture one frame and hand it straight back to the driver.
pub fn grab_and_discard<D: CameraDevice>(stream: &mut CameraStream<'_, D>) -> Result<()> {
    let vbuf = stream.frame_get()?;
    stream.frame_put(vbuf)?;
    Ok(())
}

fn skip_frames<D: CameraDevice>(stream: &mut CameraStream<'_, D>, count: u32) -> Result<()> {
    for _ in 0..count {
        grab_and_discard(stream)?;
    }
    Ok(())
}

/// A mounted card and an initialised camera.
pub struct Session<D: CameraDevice> {
    camera: Camera<D>,
    volume: Volume,
    capture: CaptureConfig,
}

impl<D: CameraDevice> Session<D> {
    /// Bundle a camera and a volume.
    pub const fn new(camera: Camera<D>, volume: Volume, capture: CaptureConfig) -> Self {
        Self {
            camera,
            volume,
            capture,
        }
    }

    /// The camera.
    pub const fn camera(&self) -> &Camera<D> {
        &self.camera
    }

    /// The card volume.
    pub const fn volume(&self) -> &Volume {
        &self.volume
    }

    /// The card volume, mutably.
    pub fn volume_mut(&mut self) -> &mut Volume {
        &mut self.volume
    }

    /// Run `body` on a freshly started stream, stopping it afterwards.
    fn with_stream<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut CameraStream<'_, D>, &Volume) -> Result<T>,
    {
        let mut stream = self.camera.open_stream()?;
        stream.setup_buffers()?;
        stream.start()?;
        info!("camera stream started!");

        skip_frames(&mut stream, self.capture.skip_frames)?;
        let result = body(&mut stream, &self.volume)?;
        stream.stop()?;
        Ok(result)
    }

    /// Save `count` frames numbered from `first` with a fresh stream.
    pub fn capture_frames(&mut self, first: u32, count: u32) -> Result<Vec<PathBuf>> {
        self.with_stream(|stream, volume| {
            (0..count)
                .map(|i| {
                    grab_and_save(stream, volume, first.saturating_add(i))
                        .inspect_err(|_| error!("Cannot grab and save"))
                })
                .collect()
        })
    }

    /// Save a single frame as frame `num`.
    pub fn capture(&mut self, num: u32) -> Result<PathBuf> {
        self.with_stream(|stream, volume| {
            grab_and_save(stream, volume, num).inspect_err(|_| error!("Cannot grab and save"))
        })
    }
}

/// Run the application: mount, init camera, capture, then serve the shell.
pub fn run<D, R, W>(config: &AppConfig, device: D, input: R, output: W) -> Result<()>
where
    D: CameraDevice,
    R: BufRead,
    W: Write,
{
    let volume = Volume::init(&config.storage)?;
    std::thread::sleep(config.capture.settle_delay());
    info!("mounted drive!");

    let camera = Camera::init(device, &config.camera)?;
    info!("camera init done!");

    let mut session = Session::new(camera, volume, config.capture.clone());
    let saved = session.capture_frames(config.capture.first_frame, config.capture.frame_count)?;
    for path in &saved {
        info!("saved {}", path.display());
    }
    info!("done");

    if config.capture.shell {
        shell::run_shell(&mut session, input, output)?;
    }
    Ok(())
}
