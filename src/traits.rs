//! Core traits and types for the camera abstraction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '.'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match <[u8; 4]>::try_from(s.as_bytes()) {
            Ok(code) if code.iter().all(u8::is_ascii_graphic) => Ok(Self(code)),
            _ => Err(CameraError::InvalidFourCC(s.to_owned())),
        }
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride, or pitch).
    pub stride: u32,
    /// Total frame size in bytes as reported by the driver.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width.saturating_mul(2); // YUYV is 2 bytes per pixel
        let size = stride.saturating_mul(height);
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// Number of bytes a buffer must hold to receive one frame.
    ///
    /// Compressed formats report a zero stride, so the driver's image size
    /// wins whenever it is larger than `stride * height`.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        let planar = u64::from(self.stride) * u64::from(self.height);
        let bytes = planar.max(u64::from(self.size));
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.fourcc, self.width, self.height)
    }
}

/// A rational number, used for frame intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl Fraction {
    /// Create a new fraction.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frames per second for a frame interval of this length.
    #[must_use]
    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            return 0.0;
        }
        f64::from(self.denominator) / f64::from(self.numerator)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl From<v4l::Fraction> for Fraction {
    fn from(fraction: v4l::Fraction) -> Self {
        Self::new(fraction.numerator, fraction.denominator)
    }
}

/// Frame interval supported by a device for a given format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameInterval {
    /// A single fixed interval.
    Discrete(Fraction),
    /// A range of intervals.
    Stepwise {
        /// Shortest interval.
        min: Fraction,
        /// Longest interval.
        max: Fraction,
        /// Increment between intervals.
        step: Fraction,
    },
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discrete(interval) => write!(f, "{interval}"),
            Self::Stepwise { min, max, step } => {
                write!(f, "[min = {min}; max = {max}; step = {step}]")
            }
        }
    }
}

/// One range of frame sizes a device can produce in a given pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCap {
    /// Pixel format.
    pub fourcc: FourCC,
    /// Smallest width.
    pub width_min: u32,
    /// Largest width.
    pub width_max: u32,
    /// Width increment (0 for a discrete size).
    pub width_step: u32,
    /// Smallest height.
    pub height_min: u32,
    /// Largest height.
    pub height_max: u32,
    /// Height increment (0 for a discrete size).
    pub height_step: u32,
}

impl FormatCap {
    /// Capability for exactly one frame size.
    #[must_use]
    pub const fn discrete(fourcc: FourCC, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            width_min: width,
            width_max: width,
            width_step: 0,
            height_min: height,
            height_max: height,
            height_step: 0,
        }
    }

    /// Whether the given size lies within this range.
    #[must_use]
    pub fn contains(&self, width: u32, height: u32) -> bool {
        let fits = |value: u32, min: u32, max: u32, step: u32| {
            value >= min && value <= max && (step == 0 || (value - min) % step == 0)
        };
        fits(width, self.width_min, self.width_max, self.width_step)
            && fits(height, self.height_min, self.height_max, self.height_step)
    }
}

impl fmt::Display for FormatCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} width [{}; {}; {}] height [{}; {}; {}]",
            self.fourcc,
            self.width_min,
            self.width_max,
            self.width_step,
            self.height_min,
            self.height_max,
            self.height_step
        )
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// Handle to one fixed-size frame buffer of the capture pool.
///
/// The handle is deliberately not `Clone`: it is passed by value to the
/// stream on enqueue and handed back on dequeue, so exactly one side owns
/// the memory at any time.
#[derive(Debug)]
pub struct VideoBuffer {
    index: usize,
    data: Vec<u8>,
    capacity: usize,
    metadata: FrameMetadata,
}

impl VideoBuffer {
    /// Allocate a buffer able to hold `size` bytes.
    pub fn alloc(index: usize, size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| CameraError::BufferAlloc { index, size })?;
        Ok(Self {
            index,
            data,
            capacity: size,
            metadata: FrameMetadata::default(),
        })
    }

    /// Position of this buffer in the pool.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of bytes the buffer can hold.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload of the last frame written into the buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of payload bytes.
    pub fn bytes_used(&self) -> usize {
        self.data.len()
    }

    /// Metadata of the last frame written into the buffer.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Replace the buffer content with a new frame payload.
    pub fn fill(&mut self, payload: &[u8], metadata: FrameMetadata) -> Result<()> {
        if payload.len() > self.capacity {
            return Err(CameraError::BufferTooSmall {
                needed: payload.len(),
                capacity: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        self.metadata = metadata;
        Ok(())
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Device cannot capture or stream video.
    #[error("Device '{0}' does not support streaming video capture")]
    CaptureUnsupported(String),
    /// Querying or setting the format failed.
    #[error("Format error: {0}")]
    FormatError(String),
    /// String is not a valid four-character code.
    #[error("Invalid pixel format '{0}': expected 4 ASCII characters")]
    InvalidFourCC(String),
    /// Pool buffer could not be allocated.
    #[error("Unable to alloc video buffer {index} ({size} bytes)")]
    BufferAlloc {
        /// Pool index of the failed buffer.
        index: usize,
        /// Requested size in bytes.
        size: usize,
    },
    /// Frame does not fit the buffer.
    #[error("Frame of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall {
        /// Frame size in bytes.
        needed: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },
    /// Every buffer is held elsewhere.
    #[error("No video buffers available")]
    NoBuffersAvailable,
    /// Dequeue on a stream that was not started.
    #[error("Stream is not running")]
    NotStreaming,
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over camera device operations.
pub trait CameraDevice {
    /// The stream type returned by `create_stream`.
    type Stream<'a>: CaptureStream
    where
        Self: 'a;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Enumerate the pixel formats and frame sizes the device offers.
    fn format_caps(&self) -> Result<Vec<FormatCap>>;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Get the current frame interval.
    fn frame_interval(&self) -> Result<Fraction>;

    /// Enumerate frame intervals supported for the given format.
    fn frame_intervals(&self, format: &Format) -> Result<Vec<FrameInterval>>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Create a capture stream with the specified number of buffers.
    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream<'_>>;
}

/// Abstraction over the driver's buffer queue.
pub trait CaptureStream {
    /// Hand a buffer to the driver to be filled.
    ///
    /// A buffer that is rejected is dropped.
    fn enqueue(&mut self, buffer: VideoBuffer) -> Result<()>;

    /// Take the next filled buffer, waiting at most `timeout`.
    fn dequeue(&mut self, timeout: Duration) -> Result<VideoBuffer>;

    /// Start capturing into queued buffers.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and return every buffer that was still queued.
    fn stop(&mut self) -> Result<Vec<VideoBuffer>>;

    /// Whether the stream has been started.
    fn is_streaming(&self) -> bool;
}
