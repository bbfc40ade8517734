//! Short-range wireless link seam.
//!
//! The transport library is an external collaborator; the fleet depends only
//! on the two contracts below. An `Adapter` discovers endpoints by scanning
//! the ether for a bounded window; an `Endpoint` is one wireless peripheral
//! supporting idempotent connect and GATT-style unacknowledged writes to a
//! `(service, characteristic)` pair.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// No usable radio adapter on this host. Fatal to startup.
    #[error("link adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The endpoint is out of range or the connection dropped. Transient;
    /// the next reconnect sweep retries.
    #[error("endpoint not connected")]
    NotConnected,

    /// A transport operation failed.
    #[error("link operation failed: {0}")]
    Operation(String),
}

/// A radio adapter capable of discovery scans.
pub trait Adapter: Send {
    /// Scans for the given window and returns every endpoint heard.
    fn scan(&mut self, window: Duration) -> Result<Vec<Box<dyn Endpoint>>, LinkError>;
}

/// One wireless peripheral endpoint.
pub trait Endpoint: Send {
    /// Stable station address, unique within a fleet.
    fn address(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Establishes the connection; must be a no-op when already connected.
    fn connect(&mut self) -> Result<(), LinkError>;

    fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Write-without-response to the characteristic. Fails with
    /// `NotConnected` when there is no live connection.
    fn write_without_response(
        &mut self,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: &[u8],
    ) -> Result<(), LinkError>;
}

/// Development adapter: a radio that hears nothing.
///
/// Lets the lighting controller run on hosts without the transport stack;
/// the fleet reports `device_count` 0 and keeps re-scanning on its normal
/// cadence. A hardware adapter slots in behind the same trait.
pub struct EmptyEtherAdapter;

impl Adapter for EmptyEtherAdapter {
    fn scan(&mut self, _window: Duration) -> Result<Vec<Box<dyn Endpoint>>, LinkError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scriptable in-memory link used by the fleet tests.

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared journal of every write that reached a fake endpoint.
    pub type WriteLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    pub struct FakeEndpoint {
        address: String,
        connected: bool,
        /// When true, `connect()` fails and writes report `NotConnected`.
        pub unreachable: bool,
        log: WriteLog,
    }

    impl FakeEndpoint {
        pub fn new(address: &str, log: WriteLog) -> Self {
            FakeEndpoint {
                address: address.to_string(),
                connected: false,
                unreachable: false,
                log,
            }
        }
    }

    impl Endpoint for FakeEndpoint {
        fn address(&self) -> &str {
            &self.address
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn connect(&mut self) -> Result<(), LinkError> {
            if self.unreachable {
                return Err(LinkError::Operation("out of range".into()));
            }
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), LinkError> {
            self.connected = false;
            Ok(())
        }

        fn write_without_response(
            &mut self,
            _service_uuid: &str,
            _characteristic_uuid: &str,
            payload: &[u8],
        ) -> Result<(), LinkError> {
            if !self.connected {
                return Err(LinkError::NotConnected);
            }
            self.log
                .lock()
                .unwrap()
                .push((self.address.clone(), payload.to_vec()));
            Ok(())
        }
    }

    /// Adapter whose scans return a fixed set of addresses.
    pub struct ScriptedAdapter {
        pub addresses: Vec<String>,
        pub log: WriteLog,
        pub scans: usize,
    }

    impl ScriptedAdapter {
        pub fn new(addresses: &[&str]) -> Self {
            ScriptedAdapter {
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
                log: Arc::new(Mutex::new(Vec::new())),
                scans: 0,
            }
        }
    }

    impl Adapter for ScriptedAdapter {
        fn scan(&mut self, _window: Duration) -> Result<Vec<Box<dyn Endpoint>>, LinkError> {
            self.scans += 1;
            Ok(self
                .addresses
                .iter()
                .map(|a| Box::new(FakeEndpoint::new(a, Arc::clone(&self.log))) as Box<dyn Endpoint>)
                .collect())
        }
    }
}
