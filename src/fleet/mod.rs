//! Lighting controller: the device fleet manager.
//!
//! The fleet owns an ordered population of wireless peripherals and
//! reconciles it against reality on a fixed cadence: an initial discovery
//! scan at startup, a reinit sweep every 60 s for configured addresses that
//! never registered, a reconnect sweep every 10 s for registered peripherals
//! that dropped, and a 1 s bounded wait on the command queue in between.
//!
//! Commands arrive pre-parsed as `LedCommand`; the bus payload is parsed
//! once at ingress and anything malformed is rejected there. Peripheral
//! failures are isolated per device: a write error is logged with the
//! address and the batch continues.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use hearth_bus::BusClient;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::runtime::{RuntimeError, Service, SignalQueue};

pub mod device;
pub mod link;
pub mod protocol;

pub use device::Peripheral;
pub use link::{Adapter, EmptyEtherAdapter, Endpoint, LinkError};

/// Client id of the lighting controller on the bus.
pub const CLIENT_ID: &str = "led_manager";

const SCAN_WINDOW: Duration = Duration::from_secs(5);
const REINIT_INTERVAL: Duration = Duration::from_secs(60);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
const COMMAND_WAIT: Duration = Duration::from_secs(1);

/// One configured peripheral: station address plus protocol identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub address: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
}

/// Color parameters for `set_color`; each channel is 0-255 by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ColorParams {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// The fleet command set, parsed once at ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LedCommand {
    TurnOn,
    TurnOff,
    SetColor { params: ColorParams },
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// The payload uses the camera-style `action` key. Only `command` is the
    /// fleet's dispatch key; the other form is rejected, not silently read.
    #[error("fleet commands are dispatched by 'command', not 'action'")]
    DispatchKey,

    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parses an inbound bus payload into a fleet command.
pub fn parse_command(payload: &Value) -> Result<LedCommand, CommandError> {
    if payload.get("command").is_none() && payload.get("action").is_some() {
        return Err(CommandError::DispatchKey);
    }
    Ok(serde_json::from_value(payload.clone())?)
}

/// Registered peripherals, slot-aligned with the configured spec order so
/// command application walks devices in configured order.
type DeviceSlots = Mutex<Vec<Option<Peripheral>>>;

/// The lighting controller service.
pub struct FleetManager {
    specs: Arc<Vec<DeviceSpec>>,
    devices: Arc<DeviceSlots>,
    commands: Arc<SignalQueue<LedCommand>>,
    device_count: Arc<AtomicUsize>,
    adapter: Option<Box<dyn Adapter>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FleetManager {
    /// The adapter must already be acquired; a host without one fails the
    /// service at startup.
    pub fn new(specs: Vec<DeviceSpec>, adapter: Box<dyn Adapter>) -> Self {
        let slots = specs.iter().map(|_| None).collect();
        FleetManager {
            specs: Arc::new(specs),
            devices: Arc::new(Mutex::new(slots)),
            commands: Arc::new(SignalQueue::new()),
            device_count: Arc::new(AtomicUsize::new(0)),
            adapter: Some(adapter),
            worker: None,
        }
    }

    pub fn device_count(&self) -> usize {
        self.device_count.load(Ordering::Relaxed)
    }
}

impl Service for FleetManager {
    fn subscriptions(&self) -> Vec<String> {
        vec![format!("home/services/{CLIENT_ID}/command")]
    }

    fn start(
        &mut self,
        _bus: Arc<BusClient>,
        running: Arc<AtomicBool>,
    ) -> Result<(), RuntimeError> {
        let adapter = self
            .adapter
            .take()
            .ok_or_else(|| RuntimeError::Init("fleet worker already started".into()))?;

        let worker = {
            let specs = Arc::clone(&self.specs);
            let devices = Arc::clone(&self.devices);
            let commands = Arc::clone(&self.commands);
            let device_count = Arc::clone(&self.device_count);
            thread::Builder::new()
                .name("fleet-worker".into())
                .spawn(move || {
                    worker_loop(adapter, specs, devices, commands, device_count, running)
                })
                .map_err(|e| RuntimeError::Init(format!("cannot spawn fleet worker: {e}")))?
        };
        self.worker = Some(worker);
        Ok(())
    }

    fn process_command(&mut self, payload: Value) {
        match parse_command(&payload) {
            Ok(command) => {
                debug!("queueing fleet command: {command:?}");
                self.commands.push(command);
            }
            Err(e) => error!("rejecting fleet payload: {e}"),
        }
    }

    fn status_payload(&self) -> Value {
        json!({
            "status": "online",
            "device_count": self.device_count(),
        })
    }

    fn stop(&mut self) {
        self.commands.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("fleet worker panicked");
            }
        }
    }
}

fn worker_loop(
    mut adapter: Box<dyn Adapter>,
    specs: Arc<Vec<DeviceSpec>>,
    devices: Arc<DeviceSlots>,
    commands: Arc<SignalQueue<LedCommand>>,
    device_count: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    info!("fleet worker started ({} configured devices)", specs.len());
    discover(adapter.as_mut(), &specs, &devices, &device_count);

    let mut last_reinit = Instant::now();
    let mut last_reconnect = Instant::now();

    while running.load(Ordering::Relaxed) {
        if last_reinit.elapsed() >= REINIT_INTERVAL {
            reinit_missing(adapter.as_mut(), &specs, &devices, &device_count);
            last_reinit = Instant::now();
        }
        if last_reconnect.elapsed() >= RECONNECT_INTERVAL {
            reconnect_registered(&devices);
            last_reconnect = Instant::now();
        }

        if let Some(command) = commands.pop_timeout(COMMAND_WAIT) {
            apply_command(&devices, command);
        }
    }

    // Drop every peripheral; disconnect happens in Drop.
    for slot in devices
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter_mut()
    {
        *slot = None;
    }
    device_count.store(0, Ordering::Relaxed);
    info!("fleet worker stopped");
}

/// Initial discovery: one scan window, then registration of every configured
/// address found in the results. Missing devices are warned, not fatal; the
/// reinit sweep keeps looking.
fn discover(
    adapter: &mut dyn Adapter,
    specs: &[DeviceSpec],
    devices: &DeviceSlots,
    device_count: &AtomicUsize,
) {
    let found = match adapter.scan(SCAN_WINDOW) {
        Ok(found) => found,
        Err(e) => {
            error!("discovery scan failed: {e}");
            return;
        }
    };
    debug!("discovery scan heard {} endpoints", found.len());

    let mut endpoints: Vec<Option<Box<dyn Endpoint>>> = found.into_iter().map(Some).collect();
    for (index, spec) in specs.iter().enumerate() {
        let position = endpoints
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.address() == spec.address));
        match position.and_then(|p| endpoints[p].take()) {
            Some(endpoint) => register(index, endpoint, spec, devices, device_count),
            None => warn!("device not found: {}", spec.address),
        }
    }
}

fn register(
    index: usize,
    endpoint: Box<dyn Endpoint>,
    spec: &DeviceSpec,
    devices: &DeviceSlots,
    device_count: &AtomicUsize,
) {
    let mut peripheral = Peripheral::new(endpoint, spec);
    if let Err(e) = peripheral.connect() {
        // Registration survives a failed first connect; the reconnect sweep
        // retries every 10 s.
        warn!("initial connect to {} failed: {e}", spec.address);
    }
    let mut slots = devices.lock().unwrap_or_else(PoisonError::into_inner);
    slots[index] = Some(peripheral);
    device_count.store(
        slots.iter().filter(|s| s.is_some()).count(),
        Ordering::Relaxed,
    );
    info!("registered device {}", spec.address);
}

/// Reinit sweep: one scan per configured address that never registered.
fn reinit_missing(
    adapter: &mut dyn Adapter,
    specs: &[DeviceSpec],
    devices: &DeviceSlots,
    device_count: &AtomicUsize,
) {
    let missing: Vec<usize> = {
        let slots = devices.lock().unwrap_or_else(PoisonError::into_inner);
        (0..specs.len()).filter(|&i| slots[i].is_none()).collect()
    };

    for index in missing {
        let spec = &specs[index];
        debug!("rescanning for missing device {}", spec.address);
        match adapter.scan(SCAN_WINDOW) {
            Ok(found) => {
                match found.into_iter().find(|e| e.address() == spec.address) {
                    Some(endpoint) => register(index, endpoint, spec, devices, device_count),
                    None => warn!("device not found: {}", spec.address),
                }
            }
            Err(e) => error!("reinit scan failed: {e}"),
        }
    }
}

/// Reconnect sweep: idempotent connect on every registered peripheral.
fn reconnect_registered(devices: &DeviceSlots) {
    let mut slots = devices.lock().unwrap_or_else(PoisonError::into_inner);
    for peripheral in slots.iter_mut().flatten() {
        if let Err(e) = peripheral.connect() {
            warn!("reconnect to {} failed: {e}", peripheral.address());
        }
    }
}

/// Applies one command to every registered peripheral in configured order.
/// Failures are logged with the device address; the batch continues.
fn apply_command(devices: &DeviceSlots, command: LedCommand) {
    info!("applying fleet command: {command:?}");
    let mut slots = devices.lock().unwrap_or_else(PoisonError::into_inner);
    for peripheral in slots.iter_mut().flatten() {
        let result = match command {
            LedCommand::TurnOn => peripheral.turn_on(),
            LedCommand::TurnOff => peripheral.turn_off(),
            LedCommand::SetColor { params } => {
                peripheral.set_color(params.r, params.g, params.b)
            }
        };
        if let Err(e) = result {
            error!("device {} write failed: {e}", peripheral.address());
        }
    }
}
