//! Mock device implementation for running without hardware.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FormatCap, FourCC,
    Fraction, FrameInterval, FrameMetadata, Result, VideoBuffer,
};

/// Mock device for testing without hardware.
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    pattern: TestPattern,
    frame_count: u32,
    frame_limit: Option<u32>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            pattern: TestPattern::ColorBars,
            frame_count: 0,
            frame_limit: None,
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the test pattern generated into captured frames.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Stop producing frames after `limit` captures; later dequeues time out.
    #[must_use]
    pub const fn with_frame_limit(mut self, limit: u32) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Number of frames produced so far.
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }
}

impl CameraDevice for MockDevice {
    type Stream<'a> = MockStream<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format_caps(&self) -> Result<Vec<FormatCap>> {
        Ok(vec![
            FormatCap {
                fourcc: FourCC::YUYV,
                width_min: 16,
                width_max: 1920,
                width_step: 2,
                height_min: 16,
                height_max: 1080,
                height_step: 1,
            },
            FormatCap::discrete(FourCC::MJPG, 1280, 720),
        ])
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn frame_interval(&self) -> Result<Fraction> {
        Ok(Fraction::new(1, 30))
    }

    fn frame_intervals(&self, _format: &Format) -> Result<Vec<FrameInterval>> {
        Ok(vec![
            FrameInterval::Discrete(Fraction::new(1, 30)),
            FrameInterval::Discrete(Fraction::new(1, 15)),
        ])
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        if format.width == 0 || format.height == 0 {
            return Err(CameraError::FormatError(format!(
                "unsupported size {}x{}",
                format.width, format.height
            )));
        }
        let fits = format
            .width
            .checked_mul(2)
            .and_then(|stride| stride.checked_mul(format.height))
            .is_some();
        if !fits {
            return Err(CameraError::FormatError(format!(
                "frame size {}x{} is too large",
                format.width, format.height
            )));
        }
        // Behave like a driver: the pitch is derived from the width.
        self.format = Format::new(format.width, format.height, format.fourcc);
        Ok(self.format.clone())
    }

    fn create_stream(&mut self, _buffer_count: u32) -> Result<Self::Stream<'_>> {
        Ok(MockStream {
            device: self,
            queued: VecDeque::new(),
            streaming: false,
        })
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock capture stream: a FIFO of queued buffers filled on dequeue.
pub struct MockStream<'a> {
    device: &'a mut MockDevice,
    queued: VecDeque<VideoBuffer>,
    streaming: bool,
}

impl MockStream<'_> {
    /// Number of buffers currently queued.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

impl CaptureStream for MockStream<'_> {
    fn enqueue(&mut self, buffer: VideoBuffer) -> Result<()> {
        trace!("mock enqueue buffer {}", buffer.index());
        self.queued.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, _timeout: Duration) -> Result<VideoBuffer> {
        if !self.streaming {
            return Err(CameraError::NotStreaming);
        }
        if self
            .device
            .frame_limit
            .is_some_and(|limit| self.device.frame_count >= limit)
        {
            return Err(CameraError::Timeout);
        }
        let mut buffer = self.queued.pop_front().ok_or(CameraError::Timeout)?;

        let format = &self.device.format;
        let data = generate_test_frame(format, self.device.pattern);
        let seq = self.device.frame_count;

        #[allow(clippy::cast_possible_truncation)]
        let metadata = FrameMetadata {
            sequence: seq,
            timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
            bytes_used: data.len() as u32,
        };

        if let Err(err) = buffer.fill(&data, metadata) {
            self.queued.push_front(buffer);
            return Err(err);
        }
        self.device.frame_count += 1;
        Ok(buffer)
    }

    fn start(&mut self) -> Result<()> {
        if self.queued.is_empty() {
            return Err(CameraError::NoBuffersAvailable);
        }
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<VideoBuffer>> {
        self.streaming = false;
        Ok(self.queued.drain(..).collect())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

/// Generate test frame data based on pattern.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let size = format.width as usize * format.height as usize * 2; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

/// Write one YUYV macropixel at `offset`, if it fits.
fn put_pair(data: &mut [u8], offset: usize, y: u8, u: u8, v: u8) {
    if let Some(pair) = data.get_mut(offset..offset + 4) {
        pair.copy_from_slice(&[y, u, y, v]);
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars.get(bar_idx).copied().unwrap_or(bars[7]);
            let offset = (y as usize * width as usize + x as usize) * 2;
            put_pair(data, offset, y_val, u_val, v_val);
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = (u64::from(x) * 255 / u64::from(width)) as u8;
            let offset = (y as usize * width as usize + x as usize) * 2;
            put_pair(data, offset, y_val, 128, 128);
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for pair in data.chunks_exact_mut(4) {
        pair.copy_from_slice(&[y, u, y, v]);
    }
}
