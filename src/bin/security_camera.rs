//! Security camera service binary.

use std::process;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use hearth::camera::{self, CameraService};
use hearth::config::{bus_config_from_env, logger::LoggerConfig, CameraConfig};
use hearth::logger::LoggerManager;
use hearth::runtime::ServiceRuntime;
use hearth::signals::install_shutdown_flag;
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
    info!("starting security_camera {}", env!("CARGO_PKG_VERSION"));

    let should_run = install_shutdown_flag().unwrap_or_else(|e| {
        error!("cannot install signal handlers: {e}");
        process::exit(1);
    });

    let camera_config = CameraConfig::from_env().unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    info!(
        "camera {} at {}x{} targeting {} fps",
        camera_config.camera_id,
        camera_config.frame_width,
        camera_config.frame_height,
        camera_config.fps_target
    );

    let bus_config = bus_config_from_env(camera::CLIENT_ID).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });
    let bus = BusClient::new(bus_config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    let service = CameraService::with_dev_backends(camera_config);
    let mut runtime = ServiceRuntime::new(bus, Box::new(service));

    if let Err(e) = runtime.initialize() {
        error!("security_camera failed to initialize: {e}");
        process::exit(1);
    }

    while should_run.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
    }

    info!("initiating shutdown sequence");
    runtime.stop();
    info!("shutdown complete");
}
