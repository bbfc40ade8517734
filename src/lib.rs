//! hearth — a small distributed home-automation fabric.
//!
//! Three cooperating services communicate over a TLS-secured MQTT bus:
//!
//! * `voice_core` — listens to a microphone, detects a wake word and an
//!   intent, and publishes lighting commands.
//! * `led_manager` — owns a fleet of short-range wireless LED peripherals
//!   and drives them per received commands.
//! * `security_camera` — streams a camera, runs object detection, and serves
//!   snapshots plus an authenticated MJPEG stream.
//!
//! ## Modules
//!
//! * `config` — Environment-sourced, validated configuration per service.
//! * `runtime` — The shared lifecycle/worker/messaging substrate every
//!   service embeds (heartbeat, command queue, graceful shutdown).
//! * `voice`, `fleet`, `camera` — The domain components.
//! * `logger` — Centralized `tracing` initialization.
//! * `signals` — SIGINT/SIGTERM handling for the binaries.
//!
//! The bus client itself lives in the `hearth-bus` workspace crate.

pub mod camera;
pub mod config;
pub mod fleet;
pub mod logger;
pub mod runtime;
pub mod signals;
pub mod voice;
