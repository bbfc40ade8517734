//! Voice core service: microphone to lighting commands.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hearth_bus::BusClient;
use serde_json::Value;
use tracing::debug;

use crate::config::VoiceConfig;
use crate::runtime::{RuntimeError, Service};

pub mod capture;
pub mod detect;
pub mod pipeline;

pub use capture::{AudioSource, SilenceSource};
pub use detect::{Intent, IntentDetector, LevelGate, ToggleIntent, WakeDetector};
pub use pipeline::AudioPipeline;

/// Client id of the voice service on the bus.
pub const CLIENT_ID: &str = "voice_core";

/// The voice core: hosts the audio pipeline behind the service runtime.
pub struct VoiceCore {
    #[allow(dead_code)]
    config: VoiceConfig,
    source: Option<Box<dyn AudioSource>>,
    wake: Option<Box<dyn WakeDetector>>,
    intent: Option<Box<dyn IntentDetector>>,
    pipeline: Option<AudioPipeline>,
}

impl VoiceCore {
    /// The config carries the model access key; it is handed to whichever
    /// detector backend is wired in (the development backends ignore it).
    pub fn new(
        config: VoiceConfig,
        source: Box<dyn AudioSource>,
        wake: Box<dyn WakeDetector>,
        intent: Box<dyn IntentDetector>,
    ) -> Self {
        VoiceCore {
            config,
            source: Some(source),
            wake: Some(wake),
            intent: Some(intent),
            pipeline: None,
        }
    }

    /// Development wiring: paced silence and amplitude-gate detectors.
    pub fn with_dev_backends(config: VoiceConfig) -> Self {
        Self::new(
            config,
            Box::new(SilenceSource),
            Box::new(LevelGate::new(500)),
            Box::new(ToggleIntent::new(500)),
        )
    }
}

impl Service for VoiceCore {
    fn start(
        &mut self,
        bus: Arc<BusClient>,
        running: Arc<AtomicBool>,
    ) -> Result<(), RuntimeError> {
        let (Some(source), Some(wake), Some(intent)) =
            (self.source.take(), self.wake.take(), self.intent.take())
        else {
            return Err(RuntimeError::Init("voice pipeline already started".into()));
        };

        let pipeline = AudioPipeline::spawn(source, wake, intent, bus, running)
            .map_err(|e| RuntimeError::Init(format!("cannot spawn audio pipeline: {e}")))?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn process_command(&mut self, payload: Value) {
        // The voice core subscribes to nothing today; anything that lands
        // here came from a wildcard broker ACL and is only worth a trace.
        debug!("ignoring inbound payload: {payload}");
    }

    fn stop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            pipeline.join();
        }
    }
}
