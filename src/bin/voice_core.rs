//! Voice core service binary.

use std::process;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use hearth::config::{bus_config_from_env, logger::LoggerConfig, VoiceConfig};
use hearth::logger::LoggerManager;
use hearth::runtime::ServiceRuntime;
use hearth::signals::install_shutdown_flag;
use hearth::voice::{self, VoiceCore};
use hearth_bus::BusClient;
use tracing::{error, info};

fn main() {
    let logger_config = LoggerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("logger configuration error: {e}");
        process::exit(1);
    });
    let mut logger = LoggerManager::new(logger_config).unwrap_or_else(|e| {
        eprintln!("failed to set up logging: {e}");
        process::exit(1);
    });
    if let Err(e) = logger.init() {
        eprintln!("failed to init logging: {e}");
        process::exit(1);
    }
    info!("starting voice_core {}", env!("CARGO_PKG_VERSION"));

    let should_run = install_shutdown_flag().unwrap_or_else(|e| {
        error!("cannot install signal handlers: {e}");
        process::exit(1);
    });

    let voice_config = VoiceConfig::from_env().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    let bus_config = bus_config_from_env(voice::CLIENT_ID).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    let bus = BusClient::new(bus_config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let service = VoiceCore::with_dev_backends(voice_config);
    let mut runtime = ServiceRuntime::new(bus, Box::new(service));

    if let Err(e) = runtime.initialize() {
        error!("voice_core failed to initialize: {e}");
        process::exit(1);
    }

    while should_run.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
    }

    info!("initiating shutdown sequence");
    runtime.stop();
    info!("shutdown complete");
}
