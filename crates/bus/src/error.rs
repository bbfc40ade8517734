//! Error handling for bus operations.
//!
//! `BusError` is the unified error type for the bus client. Variants map onto
//! the failure kinds the services care about: configuration problems are
//! caught at startup and abort initialization, while transport, publish and
//! subscribe failures are carried as values so in-loop callers can log and
//! continue.

use thiserror::Error;

/// The unified error type for bus client operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker URL, client id or TLS paths are invalid or incomplete.
    ///
    /// Caught during client construction; the process should exit non-zero.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration struct validation failed.
    #[error("configuration error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// The broker could not be reached, or the session was lost and the
    /// connect deadline expired before it was re-established.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker rejected the credentials or the client id.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// TLS handshake or certificate validation failed.
    #[error("TLS failure: {0}")]
    Tls(String),

    /// A publish could not be handed to the broker session.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A subscribe could not be handed to the broker session. Subscribe
    /// failures during startup are fatal to the service.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Payload serialization failed before publishing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O failed, typically while loading the CA certificate.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure categories recorded by the network thread so that a blocked
/// `connect()` can report *why* the session never established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Auth,
    Tls,
}

impl FailureKind {
    /// Classifies a rumqttc connection error into a failure category.
    pub fn classify(err: &rumqttc::ConnectionError) -> Self {
        use rumqttc::ConnectionError;
        use rumqttc::ConnectReturnCode;

        match err {
            ConnectionError::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                    FailureKind::Auth
                }
                _ => FailureKind::Transport,
            },
            ConnectionError::Tls(_) => FailureKind::Tls,
            _ => FailureKind::Transport,
        }
    }

    /// Converts the recorded category into a `BusError` with the given detail.
    pub fn into_error(self, detail: String) -> BusError {
        match self {
            FailureKind::Transport => BusError::Transport(detail),
            FailureKind::Auth => BusError::Auth(detail),
            FailureKind::Tls => BusError::Tls(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = BusError::Transport("broker unreachable".into());
        assert_eq!(err.to_string(), "transport error: broker unreachable");

        let err = BusError::Auth("bad credentials".into());
        assert_eq!(err.to_string(), "authentication rejected: bad credentials");
    }

    #[test]
    fn classify_refused_credentials_as_auth() {
        let err = rumqttc::ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::BadUserNamePassword,
        );
        assert_eq!(FailureKind::classify(&err), FailureKind::Auth);

        let err = rumqttc::ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::NotAuthorized,
        );
        assert_eq!(FailureKind::classify(&err), FailureKind::Auth);
    }

    #[test]
    fn classify_refused_service_as_transport() {
        let err = rumqttc::ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::ServiceUnavailable,
        );
        assert_eq!(FailureKind::classify(&err), FailureKind::Transport);
    }

    #[test]
    fn failure_kind_maps_to_error_variant() {
        let err = FailureKind::Tls.into_error("handshake failed".into());
        assert!(matches!(err, BusError::Tls(_)));
        assert_eq!(err.to_string(), "TLS failure: handshake failed");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "ca.crt");
        let err: BusError = io.into();
        assert!(err.to_string().contains("ca.crt"));
    }
}
