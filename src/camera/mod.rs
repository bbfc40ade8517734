//! Security camera service: capture, detection, snapshots and the
//! authenticated MJPEG stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hearth_bus::BusClient;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::CameraConfig;
use crate::runtime::{RuntimeError, Service, SignalQueue};

pub mod capture;
pub mod detect;
pub mod stream;
pub mod token;

pub use capture::{
    enhance_night, is_night, mean_luma, Camera, Frame, TestPatternCamera, VisionError,
};
pub use detect::{count_groups, Detection, DetectionReport, FrameProcessor, NoopProcessor};
pub use stream::{HttpsPaths, StreamServer, StreamSettings};
pub use token::TokenStore;

pub(crate) use token::epoch_seconds;

/// Client id of the camera service on the bus.
pub const CLIENT_ID: &str = "security_camera";

const DETECTIONS_TOPIC: &str = "home/services/security_camera/detections";
const SNAPSHOT_TOPIC: &str = "home/services/security_camera/snapshot";
const STREAM_TOPIC: &str = "home/services/security_camera/stream";
const TOKEN_TOPIC: &str = "home/services/security_camera/token";

/// Soft bound on frames waiting for detection; oldest dropped first.
const FRAME_QUEUE_BOUND: usize = 10;

/// JPEG quality for snapshots.
const SNAPSHOT_JPEG_QUALITY: u8 = 80;

/// The security camera service.
pub struct CameraService {
    config: CameraConfig,
    camera: Option<Box<dyn Camera>>,
    processor: Option<Box<dyn FrameProcessor>>,
    frames: Arc<SignalQueue<Frame>>,
    latest: Arc<Mutex<Option<Frame>>>,
    stream: StreamServer,
    bus: Option<Arc<BusClient>>,
    running: Option<Arc<AtomicBool>>,
    capture_thread: Option<thread::JoinHandle<()>>,
    processing_thread: Option<thread::JoinHandle<()>>,
}

impl CameraService {
    pub fn new(
        config: CameraConfig,
        camera: Box<dyn Camera>,
        processor: Box<dyn FrameProcessor>,
    ) -> Self {
        let latest = Arc::new(Mutex::new(None));
        let https = match (&config.https_cert_path, &config.https_key_path) {
            (Some(cert), Some(key)) if config.https_enabled => Some(HttpsPaths {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        };
        let stream = StreamServer::new(
            StreamSettings {
                port: config.stream_port,
                host_ip: config.host_ip.clone(),
                https,
            },
            Arc::clone(&latest),
        );

        CameraService {
            config,
            camera: Some(camera),
            processor: Some(processor),
            frames: Arc::new(SignalQueue::new()),
            latest,
            stream,
            bus: None,
            running: None,
            capture_thread: None,
            processing_thread: None,
        }
    }

    /// Development wiring: test-pattern camera, no-op detector.
    pub fn with_dev_backends(config: CameraConfig) -> Self {
        let camera = TestPatternCamera::new(config.frame_width, config.frame_height, config.fps_target);
        Self::new(config, Box::new(camera), Box::new(NoopProcessor))
    }

    fn handle_snapshot(&self) {
        let frame = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (frame, &self.bus) {
            (Some(frame), Some(bus)) if !frame.is_empty() => publish_snapshot(bus, &frame),
            _ => warn!("no frame available for snapshot"),
        }
    }

    fn handle_start_stream(&mut self) {
        let Some(running) = self.running.clone() else {
            return;
        };
        match self.stream.start_stream(running) {
            Ok(stream_info) => {
                if stream_info.tls_fallback {
                    warn!("stream running without TLS after HTTPS setup failure");
                }
                if let Some(bus) = &self.bus {
                    let payload = json!({
                        "streaming": true,
                        "url": stream_info.url,
                        "requires_token": true,
                        "timestamp": epoch_seconds(),
                    });
                    if let Err(e) = bus.publish(STREAM_TOPIC, &payload) {
                        error!("failed to publish stream info: {e}");
                    }
                }
            }
            Err(e) => error!("cannot start stream: {e}"),
        }
    }

    fn handle_stop_stream(&mut self) {
        if !self.stream.stop_stream() {
            debug!("stop_stream while not streaming");
            return;
        }
        self.publish_stream_ended();
    }

    fn publish_stream_ended(&self) {
        if let Some(bus) = &self.bus {
            let payload = json!({
                "streaming": false,
                "timestamp": epoch_seconds(),
            });
            if let Err(e) = bus.publish(STREAM_TOPIC, &payload) {
                error!("failed to publish stream termination: {e}");
            }
        }
    }

    fn handle_request_token(&self) {
        let (token, expires) = self.stream.tokens().issue();
        info!("issued stream token expiring at {expires}");
        if let Some(bus) = &self.bus {
            let payload = json!({ "token": token, "expires": expires });
            if let Err(e) = bus.publish(TOKEN_TOPIC, &payload) {
                error!("failed to publish stream token: {e}");
            }
        }
    }
}

impl Service for CameraService {
    fn subscriptions(&self) -> Vec<String> {
        vec![format!("home/services/{CLIENT_ID}/command")]
    }

    fn start(
        &mut self,
        bus: Arc<BusClient>,
        running: Arc<AtomicBool>,
    ) -> Result<(), RuntimeError> {
        let (Some(mut camera), Some(mut processor)) = (self.camera.take(), self.processor.take())
        else {
            return Err(RuntimeError::Init("camera service already started".into()));
        };

        // Camera and model failures are fatal before any thread spawns.
        camera.open()?;
        processor.init()?;

        self.bus = Some(Arc::clone(&bus));
        self.running = Some(Arc::clone(&running));

        let capture_thread = {
            let frames = Arc::clone(&self.frames);
            let latest = Arc::clone(&self.latest);
            let running = Arc::clone(&running);
            let threshold = self.config.night_mode_threshold;
            thread::Builder::new()
                .name("camera-capture".into())
                .spawn(move || capture_loop(camera, frames, latest, threshold, running))
                .map_err(|e| RuntimeError::Init(format!("cannot spawn capture thread: {e}")))?
        };

        let processing_thread = {
            let frames = Arc::clone(&self.frames);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("camera-detect".into())
                .spawn(move || processing_loop(processor, frames, bus, running))
                .map_err(|e| RuntimeError::Init(format!("cannot spawn processing thread: {e}")))?
        };

        self.capture_thread = Some(capture_thread);
        self.processing_thread = Some(processing_thread);
        Ok(())
    }

    fn process_command(&mut self, payload: Value) {
        let Some(action) = payload.get("action").and_then(Value::as_str) else {
            error!("camera command missing 'action' field: {payload}");
            return;
        };
        debug!("processing action: {action}");
        match action {
            "snapshot" => self.handle_snapshot(),
            "start_stream" => self.handle_start_stream(),
            "stop_stream" => self.handle_stop_stream(),
            "request_token" => self.handle_request_token(),
            other => error!("unknown camera action: {other}"),
        }
    }

    fn status_payload(&self) -> Value {
        json!({
            "status": "online",
            "timestamp": epoch_seconds(),
        })
    }

    fn stop(&mut self) {
        self.frames.shutdown();
        for handle in [self.processing_thread.take(), self.capture_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("camera thread panicked");
            }
        }
        if self.stream.stop_stream() {
            self.publish_stream_ended();
        }
    }
}

fn capture_loop(
    mut camera: Box<dyn Camera>,
    frames: Arc<SignalQueue<Frame>>,
    latest: Arc<Mutex<Option<Frame>>>,
    night_threshold: u8,
    running: Arc<AtomicBool>,
) {
    debug!("capture thread started");
    let mut night = false;

    while running.load(Ordering::Relaxed) {
        let frame = camera.capture_frame();
        if frame.is_empty() {
            warn!("empty frame captured");
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        let frame_is_dark = is_night(&frame, night_threshold);
        if frame_is_dark != night {
            night = frame_is_dark;
            info!("night mode {}", if night { "enabled" } else { "disabled" });
        }
        let frame = if night { enhance_night(&frame) } else { frame };

        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());

        let dropped = frames.push_bounded(frame, FRAME_QUEUE_BOUND);
        if dropped > 0 {
            debug!("detection backlog full, dropped {dropped} frames");
        }
    }
    debug!("capture thread stopped");
}

fn processing_loop(
    mut processor: Box<dyn FrameProcessor>,
    frames: Arc<SignalQueue<Frame>>,
    bus: Arc<BusClient>,
    running: Arc<AtomicBool>,
) {
    debug!("processing thread started");
    while running.load(Ordering::Relaxed) {
        let Some(frame) = frames.pop_wait() else {
            break;
        };

        let report = processor.process(&frame);
        if report.detections.is_empty() {
            continue;
        }

        let counts = count_groups(&report.detections);
        let mut payload = match serde_json::to_value(&report) {
            Ok(value) => value,
            Err(e) => {
                error!("cannot serialize detection report: {e}");
                continue;
            }
        };
        payload["person_count"] = counts.person_count.into();
        payload["vehicle_count"] = counts.vehicle_count.into();
        payload["animal_count"] = counts.animal_count.into();

        if let Err(e) = bus.publish(DETECTIONS_TOPIC, &payload) {
            error!("failed to publish detections: {e}");
        }

        // Something moved; push a snapshot alongside the detection event.
        publish_snapshot(&bus, &frame);
    }
    debug!("processing thread stopped");
}

/// Publishes a frame as a base64 JPEG data URI. Snapshots are rare; the
/// stream path never goes through here.
fn publish_snapshot(bus: &BusClient, frame: &Frame) {
    let jpeg = match frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY) {
        Ok(jpeg) => jpeg,
        Err(e) => {
            error!("snapshot encode failed: {e}");
            return;
        }
    };
    let payload = json!({
        "image": format!("data:image/jpeg;base64,{}", BASE64.encode(&jpeg)),
        "timestamp": epoch_seconds(),
        "width": frame.width,
        "height": frame.height,
    });
    if let Err(e) = bus.publish(SNAPSHOT_TOPIC, &payload) {
        error!("failed to publish snapshot: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_data_uri_is_base64_jpeg() {
        let mut data = Vec::new();
        for _ in 0..16 {
            data.extend_from_slice(&[200, 100, 50]);
        }
        let frame = Frame::new(4, 4, data);
        let jpeg = frame.encode_jpeg(SNAPSHOT_JPEG_QUALITY).unwrap();
        let uri = format!("data:image/jpeg;base64,{}", BASE64.encode(&jpeg));

        let encoded = uri.strip_prefix("data:image/jpeg;base64,").unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, jpeg);
        assert_eq!(&decoded[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn detection_payload_merges_group_counts() {
        let report = DetectionReport {
            detections: vec![
                Detection {
                    label: "person".into(),
                    confidence: 0.8,
                    bbox: [1, 2, 3, 4],
                },
                Detection {
                    label: "cat".into(),
                    confidence: 0.7,
                    bbox: [5, 6, 7, 8],
                },
            ],
            fps: 15.0,
            latency_ms: 20.0,
        };
        let counts = count_groups(&report.detections);
        let mut payload = serde_json::to_value(&report).unwrap();
        payload["person_count"] = counts.person_count.into();
        payload["vehicle_count"] = counts.vehicle_count.into();
        payload["animal_count"] = counts.animal_count.into();

        assert_eq!(payload["person_count"], 1);
        assert_eq!(payload["animal_count"], 1);
        assert_eq!(payload["vehicle_count"], 0);
        assert_eq!(payload["detections"][1]["label"], "cat");
    }

    #[test]
    fn camera_status_carries_timestamp() {
        let service = CameraService::with_dev_backends(CameraConfig::default());
        let status = service.status_payload();
        assert_eq!(status["status"], "online");
        assert!(status["timestamp"].as_u64().unwrap() > 0);
    }
}
