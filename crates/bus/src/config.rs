//! Bus client configuration and broker URL parsing.
//!
//! A `BusConfig` carries the service identity (broker endpoint, client id,
//! credential pair, trust anchor) fixed for the process lifetime. Fields are
//! validated with the `validator` crate so malformed settings surface as
//! `config` errors before any network activity.

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::error::BusError;

/// Endpoint parsed from a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    /// True for `ssl://`, `mqtts://` and `tls://` schemes.
    pub tls: bool,
}

/// Parses a broker URL of the form `scheme://host[:port]`.
///
/// Accepted schemes: `tcp`, `mqtt` (plain, default port 1883) and `ssl`,
/// `mqtts`, `tls` (TLS, default port 8883).
pub fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, BusError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| BusError::Config(format!("broker URL missing scheme: {url}")))?;

    let tls = match scheme {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" | "tls" => true,
        other => {
            return Err(BusError::Config(format!(
                "unsupported broker URL scheme: {other}"
            )))
        }
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BusError::Config(format!("invalid broker port in URL: {url}")))?;
            (host, port)
        }
        None => (rest, if tls { 8883 } else { 1883 }),
    };

    if host.is_empty() {
        return Err(BusError::Config(format!("broker URL missing host: {url}")));
    }

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Immutable service identity and session policy for one bus client.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BusConfig {
    /// Broker URL, e.g. `ssl://broker.lan:8883` or `tcp://localhost:1883`.
    #[validate(length(min = 1))]
    pub broker_url: String,

    /// Unique client identifier; also names the status topic. If empty a
    /// random UUID is used (the status topic then follows the UUID).
    #[validate(length(max = 36))]
    pub client_id: String,

    /// Optional credential pair sent in CONNECT.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Path to the broker CA certificate (PEM). Required for TLS schemes.
    pub ca_path: Option<String>,

    /// Keep-alive interval in seconds.
    #[validate(range(min = 5, max = 3600))]
    pub keep_alive: u64,

    /// Whether the broker should discard session state between connects.
    pub clean_session: bool,

    /// Capacity of the request channel between client handles and the
    /// network thread.
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            broker_url: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            ca_path: None,
            keep_alive: 20,
            clean_session: true,
            channel_capacity: 10,
        }
    }
}

impl BusConfig {
    /// Convenience constructor for the common identity fields.
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        BusConfig {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn ca_path(mut self, path: impl Into<String>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Validates the config and checks scheme/trust-anchor consistency.
    pub fn check(&self) -> Result<BrokerEndpoint, BusError> {
        self.validate()?;
        let endpoint = parse_broker_url(&self.broker_url)?;
        if endpoint.tls && self.ca_path.is_none() {
            return Err(BusError::Config(
                "TLS broker URL requires a CA certificate path".into(),
            ));
        }
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_url_with_port() {
        let ep = parse_broker_url("tcp://localhost:1883").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 1883);
        assert!(!ep.tls);
    }

    #[test]
    fn parses_tls_url_with_default_port() {
        let ep = parse_broker_url("ssl://broker.lan").unwrap();
        assert_eq!(ep.host, "broker.lan");
        assert_eq!(ep.port, 8883);
        assert!(ep.tls);

        let ep = parse_broker_url("mqtts://broker.lan").unwrap();
        assert!(ep.tls);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(parse_broker_url("localhost:1883").is_err());
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_broker_url("http://localhost").is_err());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_broker_url("tcp://localhost:notaport").is_err());
        assert!(parse_broker_url("tcp://localhost:70000").is_err());
    }

    #[test]
    fn check_requires_ca_for_tls() {
        let config = BusConfig::new("ssl://broker.lan:8883", "voice_core");
        assert!(matches!(config.check(), Err(BusError::Config(_))));

        let config = config.ca_path("/etc/hearth/ca.crt");
        assert!(config.check().is_ok());
    }

    #[test]
    fn check_accepts_plain_without_ca() {
        let config = BusConfig::new("tcp://localhost:1883", "led_manager");
        let ep = config.check().unwrap();
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn validation_rejects_oversized_client_id() {
        let config = BusConfig::new("tcp://localhost:1883", "x".repeat(64));
        assert!(config.check().is_err());
    }
}
