//! Camera handle: format negotiation, the buffer pool and stream control.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::CameraConfig;
use crate::traits::{CameraDevice, CameraError, CaptureStream, Format, Result, VideoBuffer};

/// A configured camera together with its frame buffer pool.
pub struct Camera<D: CameraDevice> {
    device: D,
    format: Format,
    pool_size: usize,
    buffers: Vec<VideoBuffer>,
    timeout: Duration,
}

/// Apply the configured size and pixel format on top of `format`.
///
/// A zero width or height keeps the driver's value; a new width resets the
/// pitch to two bytes per pixel. Sizes whose frame does not fit in `u32`
/// bytes are rejected.
pub fn apply_config(format: &mut Format, config: &CameraConfig) -> Result<()> {
    let oversized = || {
        CameraError::FormatError(format!(
            "frame size {}x{} is too large",
            config.width, config.height
        ))
    };

    if config.height != 0 {
        format.height = config.height;
    }
    if config.width != 0 {
        format.width = config.width;
        format.stride = config.width.checked_mul(2).ok_or_else(oversized)?;
    }
    if !config.pixel_format.is_empty() {
        format.fourcc = config.pixel_format.parse()?;
    }
    format.size = format
        .stride
        .checked_mul(format.height)
        .ok_or_else(oversized)?;
    Ok(())
}

impl<D: CameraDevice> Camera<D> {
    /// Negotiate the capture format and allocate the buffer pool.
    pub fn init(mut device: D, config: &CameraConfig) -> Result<Self> {
        let caps = device.capabilities();
        if !caps.can_capture || !caps.can_stream {
            error!("{}: video device not ready.", caps.card);
            return Err(CameraError::CaptureUnsupported(caps.card.clone()));
        }
        info!("Video device: {} ({})", caps.card, caps.driver);

        info!("- Capabilities:");
        match device.format_caps() {
            Ok(format_caps) => {
                for cap in format_caps {
                    info!("  {cap}");
                }
            }
            Err(err) => {
                error!("Unable to retrieve video capabilities");
                return Err(err);
            }
        }

        let mut format = device
            .format()
            .inspect_err(|_| error!("Unable to retrieve video format"))?;
        info!("- Default format: {format}");

        match device.frame_interval() {
            Ok(interval) => info!("- Default frame rate : {:.1} fps", interval.fps()),
            Err(err) => debug!("Default frame rate unavailable: {err}"),
        }

        info!("- Supported frame intervals for the default format:");
        match device.frame_intervals(&format) {
            Ok(intervals) => {
                for interval in intervals {
                    info!("   {interval}");
                }
            }
            Err(err) => warn!("Unable to enumerate frame intervals: {err}"),
        }

        apply_config(&mut format, config)?;
        info!("- Video format: {format}");

        let format = device
            .set_format(&format)
            .inspect_err(|_| error!("Unable to set format"))?;
        info!("Format set");
        if (config.width != 0 && format.width != config.width)
            || (config.height != 0 && format.height != config.height)
        {
            warn!(
                "Driver adjusted size: requested {}x{}, got {}x{}",
                config.width, config.height, format.width, format.height
            );
        }

        let pool_size = config.buffer_count as usize;
        let buffer_size = format.buffer_size();
        let buffers = (0..pool_size)
            .map(|index| VideoBuffer::alloc(index, buffer_size))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|_| error!("Unable to alloc video buffer"))?;
        debug!("Allocated {pool_size} buffers of {buffer_size} bytes");

        Ok(Self {
            device,
            format,
            pool_size,
            buffers,
            timeout: config.dequeue_timeout(),
        })
    }

    /// The negotiated format.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// The underlying device.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Configured number of buffers.
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Buffers currently held by the pool (not queued, not lent out).
    pub fn available_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.format.buffer_size()
    }

    /// Create a driver stream for the pool.
    pub fn open_stream(&mut self) -> Result<CameraStream<'_, D>> {
        let Self {
            device,
            pool_size,
            buffers,
            timeout,
            ..
        } = self;
        let count = u32::try_from(*pool_size).unwrap_or(u32::MAX);
        let stream = device.create_stream(count)?;
        Ok(CameraStream {
            stream,
            pool: buffers,
            timeout: *timeout,
        })
    }
}

/// A capture stream drawing its buffers from a camera's pool.
///
/// Dropping the stream stops it and returns queued buffers to the pool.
pub struct CameraStream<'a, D: CameraDevice + 'a> {
    stream: D::Stream<'a>,
    pool: &'a mut Vec<VideoBuffer>,
    timeout: Duration,
}

impl<'a, D: CameraDevice + 'a> CameraStream<'a, D> {
    /// Enqueue every buffer of the pool.
    pub fn setup_buffers(&mut self) -> Result<()> {
        if self.pool.is_empty() {
            error!("Cannot enqueue buffer");
            return Err(CameraError::NoBuffersAvailable);
        }
        let mut pending = std::mem::take(&mut *self.pool).into_iter();
        while let Some(buffer) = pending.next() {
            info!(" - enqueue buffer {}", buffer.index());
            if let Err(err) = self.stream.enqueue(buffer) {
                error!("Cannot enqueue buffer");
                self.pool.extend(pending);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Start capturing.
    pub fn start(&mut self) -> Result<()> {
        self.stream
            .start()
            .inspect_err(|_| error!("Unable to start video"))
    }

    /// Stop capturing; queued buffers go back to the pool.
    pub fn stop(&mut self) -> Result<()> {
        let reclaimed = self.stream.stop()?;
        self.pool.extend(reclaimed);
        Ok(())
    }

    /// Whether the stream is running.
    pub fn is_streaming(&self) -> bool {
        self.stream.is_streaming()
    }

    /// Take the next captured frame.
    pub fn frame_get(&mut self) -> Result<VideoBuffer> {
        self.stream
            .dequeue(self.timeout)
            .inspect_err(|_| error!("Unable to dequeue video buf"))
    }

    /// Give a frame buffer back to the driver.
    pub fn frame_put(&mut self, buffer: VideoBuffer) -> Result<()> {
        self.stream
            .enqueue(buffer)
            .inspect_err(|_| error!("Unable to enqueue video buf"))
    }

    /// Return a frame buffer to the pool without queueing it.
    pub fn release(&mut self, buffer: VideoBuffer) {
        self.pool.push(buffer);
    }
}

impl<'a, D: CameraDevice + 'a> Drop for CameraStream<'a, D> {
    fn drop(&mut self) {
        match self.stream.stop() {
            Ok(reclaimed) => self.pool.extend(reclaimed),
            Err(err) => warn!("Failed to stop stream: {err}"),
        }
    }
}
