//! # hearth-bus: MQTT bus client for the hearth fabric
//!
//! Every hearth service talks to the world through exactly one `BusClient`.
//! The client owns the broker session end to end:
//!
//! - **Identity**: broker URL, client id, credential pair and CA trust anchor
//!   are fixed at construction for the process lifetime.
//! - **Last will**: `home/services/<client_id>/status` = `offline` (QoS 1,
//!   not retained), installed before the first connect and never modified.
//! - **Connect**: `connect()` blocks up to 5 s for the session; credential
//!   and trust failures are reported as `auth` / `tls`, everything else as
//!   `transport`.
//! - **Reconnection**: automatic, with exponential backoff (1 s initial,
//!   ×1.1, 60 s cap) and subscription replay on every fresh session.
//! - **Messaging**: `publish` and `subscribe` at QoS 1. A publish blocks
//!   until the broker acknowledges it, abandoning the wait with a `publish`
//!   error after a deadline (10 s by default, caller-tunable via
//!   `publish_with_deadline`). A single inbound sink receives
//!   `(topic, payload)` for every matched message and must not block.
//!
//! The crate is built on `rumqttc`'s synchronous client: one dedicated
//! network thread per service drives the event connection with bounded
//! waits, matching the fabric's thread-per-loop concurrency model.
//!
//! ```ignore
//! use hearth_bus::{BusClient, BusConfig};
//!
//! let config = BusConfig::new("ssl://broker.lan:8883", "led_manager")
//!     .credentials("hearth", "secret")
//!     .ca_path("/etc/hearth/ca.crt");
//!
//! let bus = BusClient::new(config)?;
//! bus.set_inbound_sink(Box::new(|topic, payload| {
//!     // parse and enqueue; runs on the network thread
//! }))?;
//! bus.connect()?;
//! bus.subscribe("home/services/led_manager/command")?;
//! bus.publish("home/services/led_manager/status", &serde_json::json!({
//!     "status": "online",
//! }))?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod state;

pub use backoff::Backoff;
pub use client::status_topic;
pub use config::{parse_broker_url, BrokerEndpoint, BusConfig};
pub use connection::{BusClient, InboundSink};
pub use error::BusError;
pub use state::LinkState;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
