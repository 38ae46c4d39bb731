//! Frame type and pixel conversion: YUYV/Y16 to grayscale, dark detection.

use image::GrayImage;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Hand the pixels to the image crate. `None` if the buffer does not match the dimensions.
    pub fn into_image(self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data)
    }
}

/// Keep the Y sample of each packed YUYV pixel pair: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let buf = two_bytes_per_pixel(yuyv, width, height)?;
    Ok(buf.iter().step_by(2).copied().collect())
}

/// Keep the high byte of each little-endian 16-bit sample.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let buf = two_bytes_per_pixel(y16, width, height)?;
    Ok(buf.chunks_exact(2).map(|px| px[1]).collect())
}

fn two_bytes_per_pixel(buf: &[u8], width: u32, height: u32) -> Result<&[u8], FrameError> {
    let expected = width as usize * height as usize * 2;
    buf.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })
}

/// True if more than `threshold_pct` of pixels are in the darkest bucket (0–31).
///
/// Covered lenses and IR frames captured between emitter pulses look like this.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
