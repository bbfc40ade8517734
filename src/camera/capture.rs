//! Camera seam, frame type and the night-vision path.
//!
//! The camera driver is an external collaborator behind the `Camera` trait:
//! `capture_frame()` returns one frame, or an empty frame on transient
//! error. Night handling is shared crate code so every camera backend
//! behaves identically: a frame whose mean luma falls under the threshold is
//! considered night, and the enhancement path equalizes the luma histogram
//! and applies a small brightness/contrast bump.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    /// Camera could not be opened or configured. Fatal to startup.
    #[error("camera unavailable: {0}")]
    Camera(String),

    /// Detection backend could not be initialized. Fatal to startup.
    #[error("detector unavailable: {0}")]
    Detector(String),

    /// JPEG encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Stream server socket error.
    #[error("stream I/O error: {0}")]
    Stream(#[from] std::io::Error),

    /// Stream TLS context could not be built.
    #[error("stream TLS setup failed: {0}")]
    Tls(String),
}

/// One captured frame, RGB8 interleaved.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Frame {
            width,
            height,
            data,
        }
    }

    /// An empty frame signals a transient capture failure.
    pub fn empty() -> Self {
        Frame::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encodes the frame as JPEG at the given quality.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, VisionError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .write_image(&self.data, self.width, self.height, ColorType::Rgb8)
            .map_err(|e| VisionError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// A camera device.
pub trait Camera: Send {
    /// Opens and configures the device. Failure aborts service startup.
    fn open(&mut self) -> Result<(), VisionError>;

    /// Captures one frame; empty on transient error.
    fn capture_frame(&mut self) -> Frame;
}

/// ITU-R BT.601 luma of one RGB pixel.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

/// Mean luma over the whole frame; 0 for an empty frame.
pub fn mean_luma(frame: &Frame) -> u8 {
    if frame.is_empty() {
        return 0;
    }
    let mut sum: u64 = 0;
    for px in frame.data.chunks_exact(3) {
        sum += luma(px[0], px[1], px[2]) as u64;
    }
    (sum / (frame.data.len() as u64 / 3)) as u8
}

/// Night detection: mean luma below the configured threshold.
pub fn is_night(frame: &Frame, threshold: u8) -> bool {
    if frame.is_empty() {
        return false;
    }
    mean_luma(frame) < threshold
}

/// Night enhancement: luma-channel histogram equalization followed by a
/// brightness +10 / contrast +20 adjustment.
pub fn enhance_night(frame: &Frame) -> Frame {
    if frame.is_empty() {
        return frame.clone();
    }

    // Histogram over the luma channel.
    let mut histogram = [0u32; 256];
    for px in frame.data.chunks_exact(3) {
        histogram[luma(px[0], px[1], px[2]) as usize] += 1;
    }

    // Equalization lookup from the cumulative distribution.
    let total = (frame.data.len() / 3) as u32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (level, count) in histogram.iter().enumerate() {
        cumulative += count;
        lut[level] = ((cumulative as u64 * 255) / total as u64) as u8;
    }

    // Scale each pixel so its luma lands on the equalized value, keeping the
    // channel ratios (chroma) intact, then apply brightness/contrast.
    let mut data = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        let y = luma(px[0], px[1], px[2]);
        let target = lut[y as usize] as u32;
        for &channel in px {
            let scaled = if y == 0 {
                target
            } else {
                channel as u32 * target / y as u32
            };
            data.push(adjust(scaled.min(255) as u8, 10, 20));
        }
    }

    Frame::new(frame.width, frame.height, data)
}

/// Brightness/contrast in the `alpha * v + beta` form: contrast is percent
/// gain, brightness an additive offset.
fn adjust(value: u8, brightness: i32, contrast: i32) -> u8 {
    let alpha = 1.0 + contrast as f32 / 100.0;
    let adjusted = value as f32 * alpha + brightness as f32;
    adjusted.clamp(0.0, 255.0) as u8
}

/// Development camera: a slowly drifting gradient, paced at the target FPS.
///
/// Exercises the full capture/detect/stream path on hosts without a camera.
pub struct TestPatternCamera {
    width: u32,
    height: u32,
    fps: u32,
    tick: u32,
    opened: bool,
}

impl TestPatternCamera {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        TestPatternCamera {
            width,
            height,
            fps,
            tick: 0,
            opened: false,
        }
    }
}

impl Camera for TestPatternCamera {
    fn open(&mut self) -> Result<(), VisionError> {
        self.opened = true;
        Ok(())
    }

    fn capture_frame(&mut self) -> Frame {
        if !self.opened {
            return Frame::empty();
        }
        std::thread::sleep(std::time::Duration::from_secs_f64(1.0 / self.fps as f64));
        self.tick = self.tick.wrapping_add(1);

        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + self.tick) % 256) as u8);
                data.push(((y + self.tick) % 256) as u8);
                data.push(((x + y) % 256) as u8);
            }
        }
        Frame::new(self.width, self.height, data)
    }
}
