//! Simulated buses
//!
//! [`SimulatedBus`] stands in for the serial ports and TCP gateways of a
//! site. It implements [`Connector`], so a `TransportRegistry` built on it
//! behaves exactly as it would on hardware: devices answer only at their own
//! rate, absent units time out, and every request is recorded.
//!
//! Each port also checks that requests never overlap. Two requests in flight
//! on one line at the same time would garble each other on a real RS-485 bus,
//! so the simulator counts such overlaps and tests assert the count is zero.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mb_bus::{
    BusClient, Connector, Endpoint, EndpointId, LinkError, Request, Response, TransportConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::device::{VirtualDevice, VirtualDeviceConfig};

/// One request as seen by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub endpoint: EndpointId,
    /// Line rate the request was sent at (serial only)
    pub baud_rate: Option<u32>,
    pub request: Request,
    /// Whether some device answered
    pub answered: bool,
}

/// Configuration for one simulated port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPortConfig {
    /// Serial device path, or `host:port` for a TCP gateway
    pub endpoint: String,
    #[serde(default)]
    pub devices: Vec<VirtualDeviceConfig>,
}

/// Configuration for a simulated site
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedBusConfig {
    /// Delay before each answer (milliseconds)
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub ports: Vec<SimulatedPortConfig>,
}

#[derive(Debug, Default)]
struct SimPort {
    devices: Vec<VirtualDevice>,
    busy: bool,
    open_links: usize,
    /// Fail the next request with an I/O error
    broken: bool,
}

#[derive(Debug, Default)]
struct SimState {
    ports: BTreeMap<EndpointId, SimPort>,
    calls: Vec<CallRecord>,
    latency: Duration,
    connects: usize,
    overlaps: usize,
}

/// A set of simulated ports with virtual devices attached
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus from configuration
    pub fn from_config(config: SimulatedBusConfig) -> Self {
        let bus = Self::new();
        bus.set_latency(Duration::from_millis(config.latency_ms));
        for port in config.ports {
            let id = parse_endpoint_id(&port.endpoint);
            bus.add_port(id.clone());
            for device in port.devices {
                bus.attach(id.clone(), VirtualDevice::from_config(device));
            }
        }
        bus
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a port exist (connects to unknown ports fail)
    pub fn add_port(&self, id: EndpointId) {
        self.state().ports.entry(id).or_default();
    }

    /// Attach a device to a port, creating the port if needed
    pub fn attach(&self, id: EndpointId, device: VirtualDevice) {
        debug!("Simulating {} (unit {}) on {}", device.name(), device.unit(), id);
        self.state().ports.entry(id).or_default().devices.push(device);
    }

    /// Shorthand for attaching to a serial port by path
    pub fn attach_serial(&self, path: &str, device: VirtualDevice) {
        self.attach(EndpointId::Serial(path.to_string()), device);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Make the next request on `id` fail as if the adapter was unplugged
    pub fn break_port(&self, id: &EndpointId) {
        if let Some(port) = self.state().ports.get_mut(id) {
            port.broken = true;
        }
    }

    /// Every request so far, in order
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of times a connection was opened
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Links currently open on `id`
    pub fn open_links(&self, id: &EndpointId) -> usize {
        self.state().ports.get(id).map(|p| p.open_links).unwrap_or(0)
    }

    /// Number of times two requests were in flight on one port together
    pub fn overlaps(&self) -> usize {
        self.state().overlaps
    }

    /// Apply `f` to the device with `unit` on `id`
    pub fn with_device<R>(
        &self,
        id: &EndpointId,
        unit: u8,
        f: impl FnOnce(&mut VirtualDevice) -> R,
    ) -> Option<R> {
        let mut state = self.state();
        let device = state
            .ports
            .get_mut(id)?
            .devices
            .iter_mut()
            .find(|d| d.unit() == unit)?;
        Some(f(device))
    }
}

#[async_trait]
impl Connector for SimulatedBus {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _config: &TransportConfig,
    ) -> Result<Box<dyn BusClient>, LinkError> {
        let id = endpoint.id();
        let mut state = self.state();
        let port = state
            .ports
            .get_mut(&id)
            .ok_or_else(|| LinkError::Open(format!("{}: no such device", id)))?;
        port.open_links += 1;
        state.connects += 1;

        debug!("Simulated link opened on {}", endpoint);
        Ok(Box::new(SimulatedLink {
            bus: self.clone(),
            id,
            baud_rate: endpoint.baud_rate(),
        }))
    }
}

/// A client link to one simulated port
#[derive(Debug)]
struct SimulatedLink {
    bus: SimulatedBus,
    id: EndpointId,
    baud_rate: Option<u32>,
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        if let Some(port) = self.bus.state().ports.get_mut(&self.id) {
            port.open_links = port.open_links.saturating_sub(1);
        }
    }
}

/// Clears the port's busy flag however the request ends
struct InFlight<'a> {
    bus: &'a SimulatedBus,
    id: &'a EndpointId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(port) = self.bus.state().ports.get_mut(self.id) {
            port.busy = false;
        }
    }
}

#[async_trait]
impl BusClient for SimulatedLink {
    async fn call(&mut self, request: &Request) -> Result<Response, LinkError> {
        let (latency, broken, answer) = {
            let mut state = self.bus.state();
            let latency = state.latency;
            let Some(port) = state.ports.get_mut(&self.id) else {
                return Err(LinkError::Io(std::io::Error::other("port vanished")));
            };

            let overlapped = std::mem::replace(&mut port.busy, true);
            let broken = std::mem::take(&mut port.broken);
            let answer = if broken {
                None
            } else {
                port.devices
                    .iter_mut()
                    .find(|d| d.hears(request.unit, self.baud_rate))
                    .map(|d| d.handle(&request.operation))
            };

            if overlapped {
                state.overlaps += 1;
            }
            state.calls.push(CallRecord {
                endpoint: self.id.clone(),
                baud_rate: self.baud_rate,
                request: request.clone(),
                answered: answer.is_some(),
            });
            (latency, broken, answer)
        };
        let _in_flight = InFlight {
            bus: &self.bus,
            id: &self.id,
        };

        trace!("{} unit {}: {:?}", self.id, request.unit, request.operation);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if broken {
            return Err(LinkError::Io(std::io::Error::other("adapter unplugged")));
        }

        match answer {
            Some(result) => result,
            // Absent units never answer; the caller's timeout fires
            None => std::future::pending().await,
        }
    }
}

/// `host:port` is a TCP gateway, anything else a serial device path
fn parse_endpoint_id(text: &str) -> EndpointId {
    if let Some((host, port)) = text.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return EndpointId::Tcp {
                host: host.to_string(),
                port,
            };
        }
    }
    EndpointId::Serial(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_bus::{BusMode, TransportRegistry};
    use mb_register::Access;

    fn registry(bus: &SimulatedBus) -> TransportRegistry {
        TransportRegistry::new(Arc::new(bus.clone()), TransportConfig::default())
    }

    #[tokio::test]
    async fn test_device_answers_at_its_rate() {
        let bus = SimulatedBus::new();
        bus.attach_serial(
            "/dev/ttyUSB0",
            VirtualDevice::new("meter", 2)
                .at_rate(9600)
                .with_holding(0x001c, &[16384]),
        );
        let registry = registry(&bus);

        let handle = registry
            .acquire(&Endpoint::serial("/dev/ttyUSB0", 9600, BusMode::Rtu))
            .await
            .unwrap();
        let response = handle
            .execute(Request::read(2, Access::Holding, 0x001c, 1))
            .await
            .unwrap();
        assert_eq!(response, Response::Registers(vec![16384]));
        handle.release();

        let calls = bus.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].answered);
        assert_eq!(calls[0].baud_rate, Some(9600));
        assert_eq!(bus.open_links(&EndpointId::Serial("/dev/ttyUSB0".into())), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_rate_times_out() {
        let bus = SimulatedBus::new();
        bus.attach_serial("/dev/ttyUSB0", VirtualDevice::new("meter", 2).at_rate(9600));
        let registry = registry(&bus);

        let handle = registry
            .acquire(&Endpoint::serial("/dev/ttyUSB0", 19200, BusMode::Rtu))
            .await
            .unwrap();
        let err = handle
            .execute(Request::read(2, Access::Holding, 0, 1).with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!bus.calls()[0].answered);
    }

    #[tokio::test]
    async fn test_unknown_port_fails_to_open() {
        let bus = SimulatedBus::new();
        let err = registry(&bus)
            .acquire(&Endpoint::serial("/dev/ttyUSB9", 9600, BusMode::Rtu))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_broken_port() {
        let bus = SimulatedBus::new();
        let id = EndpointId::Serial("/dev/ttyUSB0".into());
        bus.attach(id.clone(), VirtualDevice::new("meter", 1));
        let registry = registry(&bus);

        let handle = registry
            .acquire(&Endpoint::serial("/dev/ttyUSB0", 9600, BusMode::Rtu))
            .await
            .unwrap();
        bus.break_port(&id);
        let err = handle
            .execute(Request::read(1, Access::Holding, 0, 1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(registry.is_empty());
        assert_eq!(bus.open_links(&id), 0);
    }

    #[test]
    fn test_config_parsing() {
        let config: SimulatedBusConfig = serde_json::from_str(
            r#"{
                "latency_ms": 5,
                "ports": [
                    {"endpoint": "/dev/ttyUSB0", "devices": [{"unit": 2, "baud_rate": 9600}]},
                    {"endpoint": "192.168.1.50:502", "devices": [{"unit": 1}]}
                ]
            }"#,
        )
        .unwrap();
        let bus = SimulatedBus::from_config(config);

        let tcp = EndpointId::Tcp {
            host: "192.168.1.50".into(),
            port: 502,
        };
        assert_eq!(bus.with_device(&tcp, 1, |d| d.unit()), Some(1));
        assert_eq!(
            bus.with_device(&EndpointId::Serial("/dev/ttyUSB0".into()), 2, |d| d.baud_rate()),
            Some(Some(9600))
        );
    }
}
