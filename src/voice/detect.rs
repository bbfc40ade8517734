//! Wake-word and intent detection seams.
//!
//! The models are external collaborators; the pipeline sees only these two
//! contracts. A wake detector classifies one short frame; an intent detector
//! classifies a multi-second buffer into the small command set.

use thiserror::Error;

/// Outcome of intent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    TurnOn,
    TurnOff,
    /// Nothing recognizable in the buffer.
    NoCommand,
    /// The backend is streaming and needs more audio. Treated as a wait
    /// signal, never published.
    Processing,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector backend error: {0}")]
    Backend(String),
}

/// Classifies a short audio frame as containing the activation phrase.
pub trait WakeDetector: Send {
    fn detect(&mut self, frame: &[i16]) -> Result<bool, DetectError>;
}

/// Classifies an accumulated command buffer into an `Intent`.
pub trait IntentDetector: Send {
    fn resolve(&mut self, samples: &[i16]) -> Result<Intent, DetectError>;
}

/// Mean absolute amplitude of a buffer; the crude loudness measure the
/// development detectors gate on.
fn mean_amplitude(samples: &[i16]) -> i64 {
    if samples.is_empty() {
        return 0;
    }
    let sum: i64 = samples.iter().map(|&s| (s as i64).abs()).sum();
    sum / samples.len() as i64
}

/// Development wake detector: fires when a frame's mean amplitude crosses a
/// threshold. Good enough to exercise the wake-then-command state machine
/// with a loopback source; a model-backed detector replaces it in the field.
pub struct LevelGate {
    threshold: i64,
}

impl LevelGate {
    pub fn new(threshold: i64) -> Self {
        LevelGate { threshold }
    }
}

impl WakeDetector for LevelGate {
    fn detect(&mut self, frame: &[i16]) -> Result<bool, DetectError> {
        Ok(mean_amplitude(frame) >= self.threshold)
    }
}

/// Development intent detector: alternates on/off for each loud-enough
/// buffer, `NoCommand` otherwise.
pub struct ToggleIntent {
    threshold: i64,
    next_on: bool,
}

impl ToggleIntent {
    pub fn new(threshold: i64) -> Self {
        ToggleIntent {
            threshold,
            next_on: true,
        }
    }
}

impl IntentDetector for ToggleIntent {
    fn resolve(&mut self, samples: &[i16]) -> Result<Intent, DetectError> {
        if mean_amplitude(samples) < self.threshold {
            return Ok(Intent::NoCommand);
        }
        let intent = if self.next_on {
            Intent::TurnOn
        } else {
            Intent::TurnOff
        };
        self.next_on = !self.next_on;
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_gate_stays_quiet_on_silence() {
        let mut gate = LevelGate::new(500);
        assert!(!gate.detect(&[0; 512]).unwrap());
    }

    #[test]
    fn level_gate_fires_on_loud_frame() {
        let mut gate = LevelGate::new(500);
        assert!(gate.detect(&[2_000; 512]).unwrap());
    }

    #[test]
    fn toggle_intent_alternates() {
        let mut intent = ToggleIntent::new(500);
        let loud = vec![2_000i16; 1024];
        assert_eq!(intent.resolve(&loud).unwrap(), Intent::TurnOn);
        assert_eq!(intent.resolve(&loud).unwrap(), Intent::TurnOff);
        assert_eq!(intent.resolve(&loud).unwrap(), Intent::TurnOn);
    }

    #[test]
    fn toggle_intent_ignores_silence() {
        let mut intent = ToggleIntent::new(500);
        assert_eq!(intent.resolve(&[0; 1024]).unwrap(), Intent::NoCommand);
        // Silence must not consume the toggle position.
        assert_eq!(intent.resolve(&[2_000; 1024]).unwrap(), Intent::TurnOn);
    }
}
