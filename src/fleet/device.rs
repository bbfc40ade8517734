//! Peripheral wrapper: one wireless endpoint plus its protocol identifiers.

use tracing::{debug, info};

use super::link::{Endpoint, LinkError};
use super::protocol::{color_frame, POWER_ON_FRAME};
use super::DeviceSpec;

/// Cyan, written after the power-on frame so a fresh `turn_on` is visible.
const TURN_ON_COLOR: (u8, u8, u8) = (0, 255, 255);

/// A peripheral owned exclusively by the fleet.
///
/// Connection is checked before every write and `connect()` is idempotent;
/// the endpoint is disconnected when the peripheral is dropped.
pub struct Peripheral {
    endpoint: Box<dyn Endpoint>,
    address: String,
    service_uuid: String,
    characteristic_uuid: String,
}

impl Peripheral {
    pub fn new(endpoint: Box<dyn Endpoint>, spec: &DeviceSpec) -> Self {
        Peripheral {
            endpoint,
            address: spec.address.clone(),
            service_uuid: spec.service_uuid.clone(),
            characteristic_uuid: spec.characteristic_uuid.clone(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    /// Connects if not already connected.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        if self.endpoint.is_connected() {
            return Ok(());
        }
        self.endpoint.connect()?;
        info!("connected to device {}", self.address);
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.connect()?;
        self.endpoint
            .write_without_response(&self.service_uuid, &self.characteristic_uuid, frame)
    }

    /// Power-on frame followed by the cyan color frame. The two-write
    /// sequence is what the firmware expects; collapsing it breaks older
    /// controllers.
    pub fn turn_on(&mut self) -> Result<(), LinkError> {
        self.write(&POWER_ON_FRAME)?;
        let (r, g, b) = TURN_ON_COLOR;
        self.set_color(r, g, b)?;
        info!("turned on device {}", self.address);
        Ok(())
    }

    /// Off is color (0, 0, 0); the firmware has no distinct off-frame.
    pub fn turn_off(&mut self) -> Result<(), LinkError> {
        debug!("turning off device {}", self.address);
        self.set_color(0, 0, 0)
    }

    pub fn set_color(&mut self, r: u8, g: u8, b: u8) -> Result<(), LinkError> {
        self.write(&color_frame(r, g, b))?;
        debug!("set color ({r}, {g}, {b}) on device {}", self.address);
        Ok(())
    }
}

impl Drop for Peripheral {
    fn drop(&mut self) {
        if self.endpoint.is_connected() {
            let _ = self.endpoint.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::link::testing::{FakeEndpoint, WriteLog};
    use super::super::protocol::frame_hex;
    use super::*;

    fn spec(address: &str) -> DeviceSpec {
        DeviceSpec {
            address: address.into(),
            service_uuid: "0000fff0-0000-1000-8000-00805f9b34fb".into(),
            characteristic_uuid: "0000fff3-0000-1000-8000-00805f9b34fb".into(),
        }
    }

    fn peripheral(log: &WriteLog) -> Peripheral {
        let endpoint = FakeEndpoint::new("BE:67:00:AC:C8:82", Arc::clone(log));
        Peripheral::new(Box::new(endpoint), &spec("BE:67:00:AC:C8:82"))
    }

    #[test]
    fn turn_on_writes_power_frame_then_cyan() {
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let mut device = peripheral(&log);
        device.turn_on().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(frame_hex(&log[0].1), "7e0704ff00010201ef");
        assert_eq!(frame_hex(&log[1].1), "7e07050300ffff10ef");
    }

    #[test]
    fn turn_off_writes_black() {
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let mut device = peripheral(&log);
        device.turn_off().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(frame_hex(&log[0].1), "7e07050300000010ef");
    }

    #[test]
    fn set_color_round_trip_matches_wire_format() {
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let mut device = peripheral(&log);
        device.set_color(0xab, 0x00, 0x7f).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(frame_hex(&log[0].1), "7e070503ab007f10ef");
    }

    #[test]
    fn writes_connect_first() {
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let mut device = peripheral(&log);
        assert!(!device.is_connected());
        device.set_color(1, 2, 3).unwrap();
        assert!(device.is_connected());
    }

    #[test]
    fn unreachable_endpoint_surfaces_link_error() {
        let log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let mut endpoint = FakeEndpoint::new("BE:67:00:AC:C8:82", Arc::clone(&log));
        endpoint.unreachable = true;
        let mut device = Peripheral::new(Box::new(endpoint), &spec("BE:67:00:AC:C8:82"));

        assert!(device.turn_on().is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
