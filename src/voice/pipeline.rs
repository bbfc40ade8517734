//! Two-stage audio pipeline: capture producer, detection consumer.
//!
//! The producer pulls 512-sample frames from the capture device into a
//! bounded queue (soft bound 125, oldest dropped on overflow). The consumer
//! preprocesses each frame, gates on the wake detector, and on a positive
//! switches into a fixed-length command-collection phase: the backlog is
//! discarded once, the next 125 frames are concatenated (missed slots are
//! not refilled), and the buffer goes to the intent detector. Resolved
//! intents become command publishes for the lighting controller.
//!
//! The queue has exactly one producer and one consumer, and the consumer
//! never holds the queue lock while running detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hearth_bus::BusClient;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::capture::{AudioSource, CaptureError, FRAME_SAMPLES};
use super::detect::{Intent, IntentDetector, WakeDetector};
use crate::runtime::SignalQueue;

/// Soft bound on queued frames (~4 s of audio).
pub const QUEUE_BOUND: usize = 125;

/// Frames concatenated into one command buffer (~4 s).
pub const COMMAND_FRAMES: usize = 125;

/// Wait per frame slot while collecting the command buffer.
const COLLECT_WAIT: Duration = Duration::from_millis(100);

/// Topic commands are published to.
const LED_COMMAND_TOPIC: &str = "home/services/led_manager/command";

/// Removes DC bias and applies a fixed 1.5× gain with int16 saturation.
///
/// The integer mean is subtracted first so the gain amplifies signal, not
/// offset; microphone front-ends in the field sit a few hundred counts off
/// center.
pub fn condition_frame(samples: &mut [i16]) {
    if samples.is_empty() {
        return;
    }
    let mean = (samples.iter().map(|&s| s as i64).sum::<i64>() / samples.len() as i64) as i32;
    for sample in samples.iter_mut() {
        let centered = *sample as i32 - mean;
        let amplified = centered * 3 / 2;
        *sample = amplified.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

/// Handles to the two pipeline threads.
pub struct AudioPipeline {
    queue: Arc<SignalQueue<Vec<i16>>>,
    producer: Option<thread::JoinHandle<()>>,
    consumer: Option<thread::JoinHandle<()>>,
}

impl AudioPipeline {
    /// Spawns the producer and consumer threads.
    pub fn spawn(
        source: Box<dyn AudioSource>,
        wake: Box<dyn WakeDetector>,
        intent: Box<dyn IntentDetector>,
        bus: Arc<BusClient>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let queue = Arc::new(SignalQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || producer_loop(source, queue, running))?
        };

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("audio-detect".into())
                .spawn(move || consumer_loop(wake, intent, queue, bus, running))?
        };

        Ok(AudioPipeline {
            queue,
            producer: Some(producer),
            consumer: Some(consumer),
        })
    }

    /// Wakes blocked waiters and joins both threads. The caller must already
    /// have flipped the shared run flag.
    pub fn join(&mut self) {
        self.queue.shutdown();
        for handle in [self.consumer.take(), self.producer.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("audio pipeline thread panicked");
            }
        }
    }
}

fn producer_loop(
    mut source: Box<dyn AudioSource>,
    queue: Arc<SignalQueue<Vec<i16>>>,
    running: Arc<AtomicBool>,
) {
    debug!("audio capture thread started");
    while running.load(Ordering::Relaxed) {
        match source.read_frame() {
            Ok(frame) => {
                if frame.is_empty() {
                    warn!("empty frame from capture device");
                    continue;
                }
                let dropped = queue.push_bounded(frame, QUEUE_BOUND);
                if dropped > 0 {
                    warn!("audio queue overflow, dropped {dropped} oldest frames");
                }
            }
            Err(CaptureError::Underrun) => {
                warn!("capture underrun, resetting device");
                if let Err(e) = source.reset() {
                    error!("capture reset failed: {e}");
                }
            }
            Err(e) => {
                error!("capture error: {e}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("audio capture thread stopped");
}

fn consumer_loop(
    mut wake: Box<dyn WakeDetector>,
    mut intent: Box<dyn IntentDetector>,
    queue: Arc<SignalQueue<Vec<i16>>>,
    bus: Arc<BusClient>,
    running: Arc<AtomicBool>,
) {
    debug!("audio detection thread started");
    while running.load(Ordering::Relaxed) {
        // Idle phase: gate every frame through the wake detector.
        let Some(mut frame) = queue.pop_wait() else {
            break;
        };
        if !running.load(Ordering::Relaxed) {
            break;
        }

        condition_frame(&mut frame);

        match wake.detect(&frame) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("wake detection failed: {e}");
                continue;
            }
        }

        // Command phase: the backlog predates the wake word; drop it once.
        let discarded = queue.drain();
        info!("wake word detected, collecting command ({discarded} backlog frames discarded)");

        let buffer = collect_command(&queue, &running);
        if !running.load(Ordering::Relaxed) {
            break;
        }

        match intent.resolve(&buffer) {
            Ok(Intent::TurnOn) => publish_led_command(&bus, "turn_on"),
            Ok(Intent::TurnOff) => publish_led_command(&bus, "turn_off"),
            Ok(Intent::NoCommand) => warn!("no command detected"),
            Ok(Intent::Processing) => debug!("intent backend still processing; treating as no command"),
            Err(e) => error!("intent resolution failed: {e}"),
        }
    }
    debug!("audio detection thread stopped");
}

/// Concatenates up to `COMMAND_FRAMES` frames, waiting at most 100 ms per
/// slot. A slot that times out is lost, not refilled, so the buffer may come
/// back short.
fn collect_command(queue: &SignalQueue<Vec<i16>>, running: &AtomicBool) -> Vec<i16> {
    let mut buffer = Vec::with_capacity(COMMAND_FRAMES * FRAME_SAMPLES);
    for _ in 0..COMMAND_FRAMES {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match queue.pop_timeout(COLLECT_WAIT) {
            Some(frame) => buffer.extend_from_slice(&frame),
            None => warn!("missed audio frame during command collection"),
        }
    }
    buffer
}

fn publish_led_command(bus: &BusClient, command: &str) {
    info!("command detected: {command}");
    let payload = json!({ "command": command, "params": {} });
    if let Err(e) = bus.publish(LED_COMMAND_TOPIC, &payload) {
        error!("failed to publish {command}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditioning_removes_dc_bias() {
        // Constant offset with zero signal collapses to silence.
        let mut frame = vec![400i16; 512];
        condition_frame(&mut frame);
        assert!(frame.iter().all(|&s| s == 0));
    }

    #[test]
    fn conditioning_applies_gain() {
        let mut frame = vec![0i16; 4];
        frame[0] = 100;
        frame[1] = -100;
        // Mean is 0; samples scale by 1.5.
        condition_frame(&mut frame);
        assert_eq!(frame[0], 150);
        assert_eq!(frame[1], -150);
    }

    #[test]
    fn conditioning_saturates_at_int16_bounds() {
        let mut frame = vec![0i16; 4];
        frame[0] = i16::MAX;
        frame[1] = i16::MIN;
        condition_frame(&mut frame);
        assert_eq!(frame[0], i16::MAX);
        assert_eq!(frame[1], i16::MIN);
    }

    #[test]
    fn backlog_drop_keeps_queue_bounded_with_newest_frame() {
        let queue: SignalQueue<Vec<i16>> = SignalQueue::new();
        for i in 0..200u16 {
            queue.push_bounded(vec![i as i16; 4], QUEUE_BOUND);
        }
        assert!(queue.len() <= QUEUE_BOUND);
        let mut newest = Vec::new();
        while let Some(frame) = queue.try_pop() {
            newest = frame;
        }
        assert_eq!(newest, vec![199i16; 4]);
    }

    #[test]
    fn collect_command_returns_short_buffer_on_starvation() {
        // Producer supplies only 3 frames; the rest of the slots time out.
        let queue: SignalQueue<Vec<i16>> = SignalQueue::new();
        for _ in 0..3 {
            queue.push(vec![1i16; FRAME_SAMPLES]);
        }
        queue.shutdown(); // make the remaining waits return immediately
        let running = AtomicBool::new(true);
        let buffer = collect_command(&queue, &running);
        assert_eq!(buffer.len(), 3 * FRAME_SAMPLES);
    }

    #[test]
    fn collect_command_stops_on_shutdown_request() {
        let queue: SignalQueue<Vec<i16>> = SignalQueue::new();
        queue.push(vec![1i16; FRAME_SAMPLES]);
        let running = AtomicBool::new(false);
        let buffer = collect_command(&queue, &running);
        assert!(buffer.is_empty());
    }
}
