//! Audio capture seam.
//!
//! The PCM driver itself is an external collaborator; the pipeline only
//! depends on the `AudioSource` contract below. A source delivers fixed
//! 512-sample frames of signed 16-bit mono at 16 kHz, distinguishes
//! transient underruns (recoverable by `reset()`) from device faults, and is
//! expected to pace reads at capture speed.

use thiserror::Error;

/// Capture sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per short frame (~32 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 512;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Ring-buffer underrun; recoverable by resetting the device.
    #[error("capture underrun")]
    Underrun,

    /// Any other device fault. Logged and retried on the next iteration.
    #[error("capture device error: {0}")]
    Device(String),
}

/// A microphone-like frame source.
pub trait AudioSource: Send {
    /// Blocks until the next 512-sample frame is available.
    fn read_frame(&mut self) -> Result<Vec<i16>, CaptureError>;

    /// Recovers the device after an underrun.
    fn reset(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Development source: silence, paced at real capture speed.
///
/// Brings the voice service up end to end on machines without a microphone;
/// a hardware-backed source slots in behind the same trait.
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn read_frame(&mut self) -> Result<Vec<i16>, CaptureError> {
        let frame_duration =
            std::time::Duration::from_secs_f64(FRAME_SAMPLES as f64 / SAMPLE_RATE as f64);
        std::thread::sleep(frame_duration);
        Ok(vec![0; FRAME_SAMPLES])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_source_delivers_full_frames() {
        let mut source = SilenceSource;
        let frame = source.read_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);
        assert!(frame.iter().all(|&s| s == 0));
    }
}
