//! V4L2 device implementation using the v4l crate.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tracing::{debug, trace};
use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FormatCap, FourCC,
    Fraction, FrameInterval, FrameMetadata, Result, VideoBuffer,
};

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: u32) -> Result<Self> {
        let device = Device::new(index as usize)
            .map_err(|err| CameraError::DeviceOpenFailed(format!("/dev/video{index}: {err}")))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        Ok(Self {
            device,
            capabilities,
        })
    }
}

fn to_format(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

impl CameraDevice for V4L2Device {
    type Stream<'a> = V4L2Stream<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format_caps(&self) -> Result<Vec<FormatCap>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        let mut caps = Vec::new();
        for description in descriptions {
            let fourcc = FourCC::from(description.fourcc);
            let sizes = match self.device.enum_framesizes(description.fourcc) {
                Ok(sizes) => sizes,
                Err(err) => {
                    debug!("No frame sizes for {fourcc}: {err}");
                    continue;
                }
            };

            for size in sizes {
                let cap = match size.size {
                    FrameSizeEnum::Discrete(discrete) => {
                        FormatCap::discrete(fourcc, discrete.width, discrete.height)
                    }
                    FrameSizeEnum::Stepwise(stepwise) => FormatCap {
                        fourcc,
                        width_min: stepwise.min_width,
                        width_max: stepwise.max_width,
                        width_step: stepwise.step_width,
                        height_min: stepwise.min_height,
                        height_max: stepwise.max_height,
                        height_step: stepwise.step_height,
                    },
                };
                caps.push(cap);
            }
        }

        Ok(caps)
    }

    fn format(&self) -> Result<Format> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        Ok(to_format(&fmt))
    }

    fn frame_interval(&self) -> Result<Fraction> {
        let params = self
            .device
            .params()
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        Ok(Fraction::from(params.interval))
    }

    fn frame_intervals(&self, format: &Format) -> Result<Vec<FrameInterval>> {
        let intervals = self
            .device
            .enum_frameintervals(format.fourcc.into(), format.width, format.height)
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        Ok(intervals
            .into_iter()
            .map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(fraction) => {
                    FrameInterval::Discrete(Fraction::from(fraction))
                }
                FrameIntervalEnum::Stepwise(stepwise) => FrameInterval::Stepwise {
                    min: Fraction::from(stepwise.min),
                    max: Fraction::from(stepwise.max),
                    step: Fraction::from(stepwise.step),
                },
            })
            .collect())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();
        fmt.stride = format.stride;

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::FormatError(err.to_string()))?;

        Ok(to_format(&fmt))
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream<'_>> {
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;

        Ok(V4L2Stream {
            stream,
            queued: VecDeque::new(),
            streaming: false,
        })
    }
}

/// V4L2 capture stream wrapping mmap-based streaming.
///
/// The driver owns its own mmap ring; application buffers wait in `queued`
/// and receive a copy of each frame's payload as it is dequeued. The v4l
/// mmap and userptr streams both allocate their ring internally, so pool
/// buffers cannot be queued to the driver directly. `STREAMON` is issued
/// by the first dequeue after `start`, once the whole ring is queued.
pub struct V4L2Stream<'a> {
    stream: Stream<'a>,
    queued: VecDeque<VideoBuffer>,
    streaming: bool,
}

impl CaptureStream for V4L2Stream<'_> {
    fn enqueue(&mut self, buffer: VideoBuffer) -> Result<()> {
        trace!("enqueue buffer {}", buffer.index());
        self.queued.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<VideoBuffer> {
        if !self.streaming {
            return Err(CameraError::NotStreaming);
        }
        let mut buffer = self.queued.pop_front().ok_or(CameraError::Timeout)?;

        self.stream.set_timeout(timeout);
        let (data, meta) = match self.stream.next() {
            Ok(frame) => frame,
            Err(err) => {
                self.queued.push_front(buffer);
                return Err(if err.kind() == io::ErrorKind::TimedOut {
                    CameraError::Timeout
                } else {
                    CameraError::StreamError(err.to_string())
                });
            }
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let metadata = FrameMetadata {
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
            bytes_used: meta.bytesused,
        };

        // The mmap slice spans the whole driver buffer, only bytesused is payload.
        let payload = data.get(..meta.bytesused as usize).unwrap_or(data);
        if let Err(err) = buffer.fill(payload, metadata) {
            self.queued.push_front(buffer);
            return Err(err);
        }
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
        if self.streaming {
            V4lStream::stop(&mut self.stream)
                .map_err(|err| CameraError::StreamError(err.to_string()))?;
            self.streaming = false;
        }
        Ok(self.queued.drain(..).collect())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}
