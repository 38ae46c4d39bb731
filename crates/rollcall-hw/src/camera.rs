//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::GrayImage;
use rollcall_core::FrameSource;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const DARK_THRESHOLD: f32 = 0.95;
/// Dark frames skipped per pull before the last one is handed out anyway.
const MAX_DARK_SKIPS: usize = 3;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera may hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed; only the Y samples are kept.
    Yuyv,
    /// 8-bit luminance, common on IR sensors.
    Grey,
    /// 16-bit little-endian luminance.
    Y16,
}

impl PixelFormat {
    /// Formats requested from the driver, most preferred first.
    const PREFERRED: [&'static [u8; 4]; 2] = [b"YUYV", b"GREY"];

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Reduce a raw driver buffer to one luminance byte per pixel.
    fn to_gray(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            Self::Grey => {
                let pixels = (width * height) as usize;
                buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                    format!("GREY buffer holds {} bytes, frame needs {pixels}", buf.len())
                })
            }
            Self::Y16 => frame::y16_to_grayscale(buf, width, height).map_err(|e| e.to_string()),
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height).map_err(|e| e.to_string()),
        };
        converted.map_err(|reason| CameraError::CaptureFailed(format!("{self:?}: {reason}")))
    }
}

/// An opened V4L2 capture device. The mmap stream is created on the first
/// pull and dropped on release, so an idle camera holds no buffers.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and negotiate a grayscale-convertible format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (format, pixel_format) = negotiate(&device)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            stream: None,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    /// Dequeue one buffer and convert it to grayscale.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            slot => slot.insert(
                MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| CameraError::CaptureFailed(format!("starting stream: {e}")))?,
            ),
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;
        let data = self.pixel_format.to_gray(buf, self.width, self.height)?;

        Ok(Frame {
            is_dark: frame::is_dark_frame(&data, DARK_THRESHOLD),
            data,
            width: self.width,
            height: self.height,
            sequence: meta.sequence,
        })
    }

    /// Discard `count` frames while auto-exposure settles. Failures end the warm-up early.
    pub fn warm_up(&mut self, count: usize) {
        tracing::debug!(count, device = %self.device_path, "warming up camera");
        for n in 0..count {
            if let Err(err) = self.capture_frame() {
                tracing::warn!(error = %err, frame = n, "warm-up capture failed");
                return;
            }
        }
    }

    /// Every V4L2 node that advertises video capture.
    pub fn list_devices() -> Vec<DeviceInfo> {
        v4l::context::enum_devices()
            .into_iter()
            .filter_map(|node| {
                let path = node.path().to_string_lossy().into_owned();
                let caps = Device::with_path(node.path()).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Ask for each preferred format at the default resolution and keep the first
/// one the driver answers with something convertible.
fn negotiate(device: &Device) -> Result<(v4l::format::Format, PixelFormat), CameraError> {
    let mut last = None;
    for fourcc in PixelFormat::PREFERRED {
        let mut wanted = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
        wanted.width = REQUEST_WIDTH;
        wanted.height = REQUEST_HEIGHT;
        wanted.fourcc = FourCC::new(fourcc);

        let got = device
            .set_format(&wanted)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
        if let Some(pixel_format) = PixelFormat::from_fourcc(got.fourcc) {
            return Ok((got, pixel_format));
        }
        tracing::debug!(requested = ?wanted.fourcc, got = ?got.fourcc, "format refused");
        last = Some(got.fourcc);
    }
    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offers {last:?}; need YUYV, GREY or Y16"
    )))
}

impl FrameSource for Camera {
    type Error = CameraError;

    fn next_frame(&mut self) -> Result<Option<GrayImage>, CameraError> {
        let mut frame = self.capture_frame()?;
        let mut skipped = 0;
        while frame.is_dark && skipped < MAX_DARK_SKIPS {
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            frame = self.capture_frame()?;
            skipped += 1;
        }
        frame
            .into_image()
            .map(Some)
            .ok_or_else(|| CameraError::CaptureFailed("frame size does not match format".into()))
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "camera stream released");
        }
    }
}
