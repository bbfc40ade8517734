//! Service configuration loading and validation.
//!
//! Every service is configured purely from the environment (§ deployment:
//! the fabric runs as supervised processes with per-service env files). This
//! module provides typed, validated configuration structs with `from_env()`
//! constructors; a missing or malformed required variable is a configuration
//! error that aborts startup with a non-zero exit.

use std::fmt::Display;
use std::str::FromStr;

use hearth_bus::BusConfig;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::fleet::DeviceSpec;

pub mod logger;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("environment variable not set: {0}")]
    Missing(String),

    /// An environment variable is set but cannot be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },

    /// Validation failure after successful parsing.
    #[error("validation error: {0}")]
    Validation(String),
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::Invalid {
                name: name.to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Builds the bus client config shared by all services.
///
/// `MQTT_BROKER` is required. Credentials are optional (anonymous brokers in
/// development); `MQTT_CA_DIR` points at a directory containing `ca.crt` and
/// is required whenever the broker URL uses a TLS scheme.
pub fn bus_config_from_env(client_id: &str) -> Result<BusConfig, ConfigError> {
    let broker_url = required("MQTT_BROKER")?;
    let mut config = BusConfig::new(broker_url, client_id);

    if let (Ok(username), Ok(password)) =
        (std::env::var("MQTT_USERNAME"), std::env::var("MQTT_PASSWORD"))
    {
        config = config.credentials(username, password);
    }
    if let Ok(ca_dir) = std::env::var("MQTT_CA_DIR") {
        config = config.ca_path(format!("{}/ca.crt", ca_dir.trim_end_matches('/')));
    }

    config
        .check()
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(config)
}

/// Voice core configuration.
#[derive(Debug, Clone, Validate)]
pub struct VoiceConfig {
    /// Access key handed to the wake/intent model backend.
    #[validate(length(min = 1))]
    pub access_key: String,
}

impl VoiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = VoiceConfig {
            access_key: required("PICOVOICE_ACCESS_KEY")?,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }
}

/// Default fleet wired into the house today; overridable via `LED_DEVICES`.
const DEFAULT_ADDRESSES: [&str; 2] = ["BE:67:00:AC:C8:82", "BE:67:00:6A:B5:A6"];
const DEFAULT_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
const DEFAULT_CHAR_UUID: &str = "0000fff3-0000-1000-8000-00805f9b34fb";

/// Lighting controller configuration: the ordered peripheral fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub devices: Vec<DeviceSpec>,
}

impl FleetConfig {
    /// Reads `LED_DEVICES` (comma-separated addresses, order preserved) and
    /// the shared `LED_SERVICE_UUID` / `LED_CHAR_UUID` pair. Addresses must
    /// be unique within the fleet.
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_uuid =
            std::env::var("LED_SERVICE_UUID").unwrap_or_else(|_| DEFAULT_SERVICE_UUID.into());
        let char_uuid =
            std::env::var("LED_CHAR_UUID").unwrap_or_else(|_| DEFAULT_CHAR_UUID.into());

        let addresses: Vec<String> = match std::env::var("LED_DEVICES") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => DEFAULT_ADDRESSES.iter().map(|s| s.to_string()).collect(),
        };

        if addresses.is_empty() {
            return Err(ConfigError::Invalid {
                name: "LED_DEVICES".into(),
                reason: "fleet must contain at least one device".into(),
            });
        }
        for (i, addr) in addresses.iter().enumerate() {
            if addresses[..i].contains(addr) {
                return Err(ConfigError::Invalid {
                    name: "LED_DEVICES".into(),
                    reason: format!("duplicate address {addr}"),
                });
            }
        }

        let devices = addresses
            .into_iter()
            .map(|address| DeviceSpec {
                address,
                service_uuid: service_uuid.clone(),
                characteristic_uuid: char_uuid.clone(),
            })
            .collect();

        Ok(FleetConfig { devices })
    }
}

/// Security camera configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_camera_config"))]
pub struct CameraConfig {
    pub camera_id: u32,
    #[validate(range(min = 16, max = 7680))]
    pub frame_width: u32,
    #[validate(range(min = 16, max = 4320))]
    pub frame_height: u32,
    #[validate(range(min = 1, max = 120))]
    pub fps_target: u32,
    /// Mean-luma threshold under which night mode engages.
    pub night_mode_threshold: u8,
    pub stream_port: u16,
    /// Address advertised in stream-info messages.
    #[validate(length(min = 1))]
    pub host_ip: String,
    pub https_enabled: bool,
    pub https_cert_path: Option<String>,
    pub https_key_path: Option<String>,
}

fn validate_camera_config(config: &CameraConfig) -> Result<(), ValidationError> {
    if config.https_enabled
        && (config.https_cert_path.is_none() || config.https_key_path.is_none())
    {
        let mut err = ValidationError::new("https_paths");
        err.message =
            Some("HTTPS_ENABLED requires HTTPS_CERT_PATH and HTTPS_KEY_PATH".into());
        return Err(err);
    }
    Ok(())
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            camera_id: 0,
            frame_width: 640,
            frame_height: 480,
            fps_target: 15,
            night_mode_threshold: 50,
            stream_port: 8080,
            host_ip: "127.0.0.1".into(),
            https_enabled: false,
            https_cert_path: None,
            https_key_path: None,
        }
    }
}

impl CameraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = CameraConfig::default();
        let config = CameraConfig {
            camera_id: parse_var("CAMERA_ID", defaults.camera_id)?,
            frame_width: parse_var("FRAME_WIDTH", defaults.frame_width)?,
            frame_height: parse_var("FRAME_HEIGHT", defaults.frame_height)?,
            fps_target: parse_var("FPS_TARGET", defaults.fps_target)?,
            night_mode_threshold: parse_var(
                "NIGHT_MODE_THRESHOLD",
                defaults.night_mode_threshold,
            )?,
            stream_port: parse_var("STREAM_PORT", defaults.stream_port)?,
            host_ip: std::env::var("HOST_IP").unwrap_or(defaults.host_ip),
            https_enabled: parse_bool("HTTPS_ENABLED", false)?,
            https_cert_path: std::env::var("HTTPS_CERT_PATH").ok(),
            https_key_path: std::env::var("HTTPS_KEY_PATH").ok(),
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }
}
