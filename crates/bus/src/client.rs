//! Construction of the underlying MQTT client.
//!
//! `ClientBuilder` turns a validated `BusConfig` into rumqttc's synchronous
//! `Client` and `Connection` pair. It owns the protocol details: keep-alive,
//! clean session, credentials, the CA-only TLS transport, and the last-will
//! message that announces an unclean exit.
//!
//! The last will is installed here, before the first connect, and is never
//! modified afterwards: topic `home/services/<client_id>/status`, literal
//! payload `offline`, QoS 1, not retained.

use std::{fs, time::Duration};

use rumqttc::{Client, Connection, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};

use super::{
    config::{BrokerEndpoint, BusConfig},
    error::BusError,
};

/// Builds the topic every service heartbeats and wills on.
pub fn status_topic(client_id: &str) -> String {
    format!("home/services/{client_id}/status")
}

#[derive(Debug)]
pub(crate) struct ClientBuilder {
    opts: MqttOptions,
    capacity: usize,
}

impl ClientBuilder {
    /// Assembles MQTT options from a checked config and its parsed endpoint.
    /// Returns the builder together with the effective client id.
    ///
    /// An empty client id is replaced with a random UUID; the MQTT spec
    /// allows empty ids but the will/status topic needs a stable name.
    pub(crate) fn from_config(
        config: &BusConfig,
        endpoint: &BrokerEndpoint,
    ) -> Result<(Self, String), BusError> {
        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut opts = MqttOptions::new(&client_id, endpoint.host.clone(), endpoint.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            opts.set_credentials(username.clone(), password.clone());
        }

        opts.set_last_will(LastWill::new(
            status_topic(&client_id),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        if endpoint.tls {
            let ca_path = config
                .ca_path
                .as_deref()
                .ok_or_else(|| BusError::Config("TLS transport requires a CA path".into()))?;
            let ca = fs::read(ca_path).map_err(|e| {
                BusError::Config(format!("cannot read CA certificate at {ca_path}: {e}"))
            })?;
            opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        Ok((
            Self {
                opts,
                capacity: config.channel_capacity,
            },
            client_id,
        ))
    }

    /// Creates the client and its event connection. The connection must be
    /// driven by a dedicated network thread; the client handle is cloneable
    /// and thread-safe.
    pub(crate) fn build(self) -> (Client, Connection) {
        Client::new(self.opts, self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::parse_broker_url;

    fn plain_config(client_id: &str) -> (BusConfig, BrokerEndpoint) {
        let config = BusConfig::new("tcp://localhost:1883", client_id);
        let endpoint = parse_broker_url(&config.broker_url).unwrap();
        (config, endpoint)
    }

    #[test]
    fn status_topic_embeds_client_id() {
        assert_eq!(
            status_topic("led_manager"),
            "home/services/led_manager/status"
        );
    }

    #[test]
    fn builds_plain_client() {
        let (config, endpoint) = plain_config("test_client");
        let (builder, client_id) = ClientBuilder::from_config(&config, &endpoint).unwrap();
        assert_eq!(client_id, "test_client");
        let (_client, _connection) = builder.build();
    }

    #[test]
    fn empty_client_id_gets_a_uuid() {
        let (config, endpoint) = plain_config("");
        let (_builder, client_id) = ClientBuilder::from_config(&config, &endpoint).unwrap();
        assert!(!client_id.is_empty());
        assert!(uuid::Uuid::parse_str(&client_id).is_ok());
    }

    #[test]
    fn builds_tls_client_with_ca_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::File::create(&ca_path)
            .unwrap()
            .write_all(b"ca certificate content")
            .unwrap();

        let config = BusConfig::new("ssl://broker.lan:8883", "test_client")
            .credentials("user", "pass")
            .ca_path(ca_path.to_string_lossy());
        let endpoint = parse_broker_url(&config.broker_url).unwrap();

        assert!(ClientBuilder::from_config(&config, &endpoint).is_ok());
    }

    #[test]
    fn missing_ca_file_is_config_error() {
        let config = BusConfig::new("ssl://broker.lan:8883", "test_client")
            .ca_path("/nonexistent/ca.crt");
        let endpoint = parse_broker_url(&config.broker_url).unwrap();

        let err = ClientBuilder::from_config(&config, &endpoint).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }
}
