//! Shared service runtime.
//!
//! Every hearth service is one process embedding a `BusClient` and one domain
//! component behind the `Service` trait. The runtime owns the lifecycle:
//!
//! 1. `initialize()` installs the inbound sink, connects the bus, subscribes
//!    the service's topics, starts the domain threads and then the worker
//!    loop.
//! 2. The worker loop heartbeats `{"status":"online", ...}` every 5 s, drains
//!    the per-service command queue in receipt order, and sleeps 100 ms
//!    between iterations. Errors inside the loop are logged and the loop
//!    continues.
//! 3. `stop()` flips the run flag, wakes all waiters, joins the worker and
//!    then the domain threads, publishes a final offline status and
//!    disconnects. A second `stop()` is a no-op.
//!
//! Inbound dispatch is composition, not inheritance: the bus sink is a
//! closure that parses JSON and enqueues into the runtime's command queue;
//! malformed payloads are discarded with an error log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use hearth_bus::{BusClient, BusError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

pub mod queue;

pub use queue::SignalQueue;

/// Heartbeat cadence for the status topic.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Worker loop sleep between iterations.
const WORKER_TICK: Duration = Duration::from_millis(100);

/// Ceiling on blocking status publishes; past it the publish is abandoned
/// with an error log and the loop (or shutdown) moves on.
const STATUS_PUBLISH_DEADLINE: Duration = Duration::from_secs(10);

/// Errors surfaced by runtime initialization.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("device link error: {0}")]
    Link(#[from] crate::fleet::link::LinkError),

    #[error("vision error: {0}")]
    Vision(#[from] crate::camera::VisionError),

    #[error("initialization failed: {0}")]
    Init(String),
}

/// A domain component hosted by the runtime.
///
/// `start` spawns the component's own threads and must return quickly;
/// `stop` joins them. `process_command` runs on the runtime worker thread,
/// one payload at a time, in receipt order.
pub trait Service: Send {
    /// Topics this service consumes; subscribed during initialization.
    /// Subscription failures are fatal to startup.
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Starts domain threads. `running` is the shared run flag gating every
    /// loop; `bus` is the publish path.
    fn start(
        &mut self,
        bus: Arc<BusClient>,
        running: Arc<AtomicBool>,
    ) -> Result<(), RuntimeError>;

    /// Handles one inbound payload from this service's command topic.
    /// Must log-and-return on bad input, never abort the worker.
    fn process_command(&mut self, payload: Value);

    /// Payload for the periodic status heartbeat.
    fn status_payload(&self) -> Value {
        json!({ "status": "online" })
    }

    /// Joins domain threads. Called with the run flag already false and all
    /// queues shut down.
    fn stop(&mut self);
}

/// Runtime lifecycle states; transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Constructed,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Hosts one service on top of one bus client.
pub struct ServiceRuntime {
    bus: Arc<BusClient>,
    service: Arc<Mutex<Box<dyn Service>>>,
    commands: Arc<SignalQueue<Value>>,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ServiceRuntime {
    pub fn new(bus: BusClient, service: Box<dyn Service>) -> Self {
        ServiceRuntime {
            bus: Arc::new(bus),
            service: Arc::new(Mutex::new(service)),
            commands: Arc::new(SignalQueue::new()),
            running: Arc::new(AtomicBool::new(true)),
            lifecycle: Mutex::new(Lifecycle::Constructed),
            worker: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, next: Lifecycle) {
        let mut state = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*state <= next, "lifecycle must be monotonic");
        *state = next;
    }

    /// Brings the service online. On any failure the runtime tears down what
    /// it already started and propagates the error; the process should exit
    /// non-zero.
    pub fn initialize(&mut self) -> Result<(), RuntimeError> {
        if self.lifecycle() != Lifecycle::Constructed {
            return Err(RuntimeError::Init("initialize() called twice".into()));
        }
        self.advance(Lifecycle::Initializing);

        match self.bring_up() {
            Ok(()) => {
                self.advance(Lifecycle::Running);
                info!("service {} running", self.bus.client_id());
                Ok(())
            }
            Err(e) => {
                error!("initialization failed: {e}");
                self.advance(Lifecycle::Stopping);
                self.running.store(false, Ordering::Relaxed);
                self.commands.shutdown();
                self.service
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stop();
                self.bus.disconnect();
                self.advance(Lifecycle::Stopped);
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), RuntimeError> {
        let commands = Arc::clone(&self.commands);
        self.bus.set_inbound_sink(Box::new(move |topic, payload| {
            match serde_json::from_slice::<Value>(payload) {
                Ok(value) => commands.push(value),
                Err(e) => error!("discarding malformed JSON on {topic}: {e}"),
            }
        }))?;

        self.bus.connect()?;

        let topics = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions();
        for topic in topics {
            self.bus.subscribe(&topic)?;
        }

        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(Arc::clone(&self.bus), Arc::clone(&self.running))?;

        let worker = {
            let bus = Arc::clone(&self.bus);
            let service = Arc::clone(&self.service);
            let commands = Arc::clone(&self.commands);
            let running = Arc::clone(&self.running);
            thread::Builder::new()
                .name("runtime-worker".into())
                .spawn(move || worker_loop(bus, service, commands, running))
                .map_err(|e| RuntimeError::Init(format!("cannot spawn worker: {e}")))?
        };
        self.worker = Some(worker);
        Ok(())
    }

    /// Shuts the service down. Idempotent; safe to call from the main thread
    /// after the signal flag flips or on a failed startup.
    pub fn stop(&mut self) {
        {
            let mut state = self
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state >= Lifecycle::Stopping {
                return;
            }
            *state = Lifecycle::Stopping;
        }
        info!("stopping service {}", self.bus.client_id());

        self.running.store(false, Ordering::Relaxed);
        self.commands.shutdown();

        // Reverse spawn order: the worker went up last.
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("runtime worker panicked");
            }
        }
        self.service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();

        let offline = json!({ "status": "offline" });
        if let Err(e) =
            self.bus
                .publish_with_deadline(self.bus.status_topic(), &offline, STATUS_PUBLISH_DEADLINE)
        {
            error!("abandoning offline status publish: {e}");
        }
        self.bus.disconnect();
        self.advance(Lifecycle::Stopped);
        info!("service {} stopped", self.bus.client_id());
    }
}

impl Drop for ServiceRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    bus: Arc<BusClient>,
    service: Arc<Mutex<Box<dyn Service>>>,
    commands: Arc<SignalQueue<Value>>,
    running: Arc<AtomicBool>,
) {
    debug!("runtime worker started");
    let mut last_status = Instant::now();

    while running.load(Ordering::Relaxed) {
        if last_status.elapsed() >= STATUS_INTERVAL {
            let payload = service
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .status_payload();
            if let Err(e) =
                bus.publish_with_deadline(bus.status_topic(), &payload, STATUS_PUBLISH_DEADLINE)
            {
                error!("abandoning status publish: {e}");
            }
            last_status = Instant::now();
        }

        drain_commands(&service, &commands);

        thread::sleep(WORKER_TICK);
    }

    debug!("runtime worker stopped");
}

/// Dispatches every queued payload to the service, in receipt order.
fn drain_commands(service: &Mutex<Box<dyn Service>>, commands: &SignalQueue<Value>) {
    while let Some(payload) = commands.try_pop() {
        service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_command(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingService {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl RecordingService {
        fn new() -> (Self, Arc<Mutex<Vec<Value>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                RecordingService {
                    seen: Arc::clone(&seen),
                },
                seen,
            )
        }
    }

    impl Service for RecordingService {
        fn start(
            &mut self,
            _bus: Arc<BusClient>,
            _running: Arc<AtomicBool>,
        ) -> Result<(), RuntimeError> {
            Ok(())
        }

        fn process_command(&mut self, payload: Value) {
            self.seen.lock().unwrap().push(payload);
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn drain_dispatches_in_receipt_order() {
        let (service, seen) = RecordingService::new();
        let service: Mutex<Box<dyn Service>> = Mutex::new(Box::new(service));
        let commands = SignalQueue::new();

        commands.push(json!({"command": "turn_on"}));
        commands.push(json!({"command": "turn_off"}));
        drain_commands(&service, &commands);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["command"], "turn_on");
        assert_eq!(seen[1]["command"], "turn_off");
    }

    #[test]
    fn stop_before_initialize_is_a_no_op() {
        let bus =
            BusClient::new(hearth_bus::BusConfig::new("tcp://localhost:1883", "rt_test")).unwrap();
        let (service, _) = RecordingService::new();
        let mut runtime = ServiceRuntime::new(bus, Box::new(service));

        assert_eq!(runtime.lifecycle(), Lifecycle::Constructed);
        runtime.stop();
        assert_eq!(runtime.lifecycle(), Lifecycle::Stopped);
        // Idempotent.
        runtime.stop();
        assert_eq!(runtime.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn default_status_payload_is_online() {
        let (service, _) = RecordingService::new();
        assert_eq!(service.status_payload(), json!({"status": "online"}));
    }
}
