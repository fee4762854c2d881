//! Polling service
//!
//! The service owns every known device and ticks every 100 ms: devices found
//! by the background scan are adopted, each device is initialised if needed
//! and then updated. A device that keeps failing is logged at most every ten
//! minutes and dropped after an hour of silence.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use mb_bus::TransportRegistry;
use mb_detect::{Device, DeviceError, Scanner};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);
pub const WARN_TIMEOUT: Duration = Duration::from_secs(600);
pub const FAIL_TIMEOUT: Duration = Duration::from_secs(3600);
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// A device and its polling history
#[derive(Debug)]
struct Managed {
    device: Box<dyn Device>,
    ready: bool,
    last_seen: Instant,
    last_warn: Option<Instant>,
}

impl Managed {
    fn new(device: Box<dyn Device>) -> Self {
        Self {
            device,
            ready: false,
            last_seen: Instant::now(),
            last_warn: None,
        }
    }

    async fn refresh(&mut self, registry: &Arc<TransportRegistry>) -> Result<(), DeviceError> {
        if !self.ready {
            self.device.init(Arc::clone(registry)).await?;
            self.ready = true;
        }
        self.device.update().await
    }
}

/// Scan-and-poll loop over one bus
pub struct Service {
    registry: Arc<TransportRegistry>,
    scanner: Option<Scanner>,
    devices: Vec<Managed>,
    auto_scan: bool,
    exit_on_error: bool,
    last_scan: Option<Instant>,
}

impl Service {
    pub fn new(registry: Arc<TransportRegistry>) -> Self {
        Self {
            registry,
            scanner: None,
            devices: Vec::new(),
            auto_scan: false,
            exit_on_error: false,
            last_scan: None,
        }
    }

    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Rescan every minute while no device is known
    pub fn set_auto_scan(&mut self, enabled: bool) {
        self.auto_scan = enabled;
    }

    /// Fail the service when a device is dropped
    pub fn set_exit_on_error(&mut self, enabled: bool) {
        self.exit_on_error = enabled;
    }

    /// Add a device unless one with the same spec is already known
    pub fn add_device(&mut self, device: Box<dyn Device>) -> bool {
        if self.devices.iter().any(|m| m.device.spec() == device.spec()) {
            debug!("{} already known", device.spec());
            return false;
        }
        info!("Adding {} at {}", device.model(), device.spec());
        self.devices.push(Managed::new(device));
        true
    }

    pub fn devices(&self) -> impl Iterator<Item = &dyn Device> {
        self.devices.iter().map(|m| m.device.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Start a background scan; returns `false` if one is running or there is no scanner
    pub fn start_scan(&mut self, full: bool) -> bool {
        let Some(scanner) = &self.scanner else {
            return false;
        };
        if !scanner.start(full) {
            return false;
        }
        info!("Scanning {}{}", scanner.target(), if full { " (full)" } else { "" });
        self.last_scan = Some(Instant::now());
        true
    }

    pub fn scanning(&self) -> bool {
        self.scanner.as_ref().is_some_and(Scanner::running)
    }

    /// One service iteration
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        self.adopt_scanned();

        let mut failed = Vec::new();
        for (i, managed) in self.devices.iter_mut().enumerate() {
            if !Self::poll(managed, &self.registry).await {
                failed.push(i);
            }
        }

        let mut dropped = Vec::new();
        for i in failed.into_iter().rev() {
            let mut managed = self.devices.remove(i);
            managed.device.destroy();
            dropped.push(managed.device.spec().to_string());
        }
        if self.exit_on_error && !dropped.is_empty() {
            bail!("Device failed: {}", dropped.join(", "));
        }

        self.maybe_rescan();
        Ok(())
    }

    /// Run until `shutdown` resolves or a tick fails
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(UPDATE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        break Err(e);
                    }
                }
            }
        };

        self.shutdown();
        result
    }

    /// Stop scanning and release every transport
    pub fn shutdown(&mut self) {
        if let Some(scanner) = &self.scanner {
            scanner.stop();
        }
        info!("Releasing {} device(s)", self.devices().count());
        for managed in &mut self.devices {
            managed.device.destroy();
        }
        self.devices.clear();
    }

    fn adopt_scanned(&mut self) {
        let found = match &self.scanner {
            Some(scanner) => scanner.get_devices(),
            None => return,
        };
        for device in found {
            self.add_device(device);
        }
    }

    /// Refresh one device; `false` once it has been silent for too long
    async fn poll(managed: &mut Managed, registry: &Arc<TransportRegistry>) -> bool {
        let now = Instant::now();
        match managed.refresh(registry).await {
            Ok(()) => {
                managed.last_seen = now;
                managed.last_warn = None;
                for (path, value) in managed.device.readings() {
                    trace!("{} {} = {}", managed.device.spec(), path, value);
                }
                true
            }
            Err(e) => {
                let silent = now.saturating_duration_since(managed.last_seen);
                if silent >= FAIL_TIMEOUT {
                    error!(
                        "{} silent for {} seconds, dropping: {}",
                        managed.device.spec(),
                        silent.as_secs(),
                        e
                    );
                    return false;
                }
                let due = managed
                    .last_warn
                    .map_or(true, |t| now.saturating_duration_since(t) >= WARN_TIMEOUT);
                if due && e.is_timeout() {
                    warn!("{} not responding", managed.device.spec());
                    managed.last_warn = Some(now);
                } else if due {
                    warn!("{} failed: {}", managed.device.spec(), e);
                    managed.last_warn = Some(now);
                } else {
                    debug!("{} failed: {}", managed.device.spec(), e);
                }
                true
            }
        }
    }

    fn maybe_rescan(&mut self) {
        if !self.auto_scan || !self.devices.is_empty() || self.scanning() {
            return;
        }
        let due = self
            .last_scan
            .map_or(true, |t| t.elapsed() >= SCAN_INTERVAL);
        if due {
            self.start_scan(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{self, eastron};
    use mb_bus::{BusMode, EndpointId, TransportConfig};
    use mb_detect::{DeviceSpec, ScanTarget};
    use mb_register::Access;
    use mb_sim::{SimulatedBus, VirtualDevice};

    const PORT: &str = "/dev/ttyUSB0";

    fn meter(unit: u8) -> VirtualDevice {
        VirtualDevice::new("sdm230", unit)
            .at_rate(9600)
            .with_holding(0x001c, &[16384])
            .with_holding(0xfc00, &[0, 4242])
            .with_f32(Access::Input, 0x000c, 800.0)
    }

    fn setup(bus: &SimulatedBus) -> (Service, Arc<TransportRegistry>) {
        let registry = Arc::new(TransportRegistry::new(
            Arc::new(bus.clone()),
            TransportConfig::default(),
        ));
        let table = Arc::new(models::model_table());
        let scanner = Scanner::new(ScanTarget::serial(PORT), Arc::clone(&table), Arc::clone(&registry));
        let service = Service::new(Arc::clone(&registry)).with_scanner(scanner);
        (service, registry)
    }

    async fn tick_until(service: &mut Service, done: impl Fn(&Service) -> bool) {
        for _ in 0..200 {
            service.tick().await.unwrap();
            if done(service) {
                return;
            }
            tokio::time::sleep(UPDATE_INTERVAL).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanned_device_is_polled() {
        let bus = SimulatedBus::new();
        bus.attach_serial(PORT, meter(2));
        let (mut service, _registry) = setup(&bus);

        assert!(service.start_scan(false));
        tick_until(&mut service, |s| {
            s.devices().any(|d| d.ident().is_some())
        })
        .await;

        let device = service.devices().next().unwrap();
        assert_eq!(device.model(), eastron::MODEL);
        assert_eq!(device.ident(), Some("cg_4242".to_string()));
        assert!(device
            .readings()
            .contains(&("/Ac/Power".to_string(), "800.0 W".to_string())));

        service.shutdown();
        assert!(service.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_specs_are_ignored() {
        let bus = SimulatedBus::new();
        let (mut service, _registry) = setup(&bus);
        let spec = DeviceSpec::serial(BusMode::Rtu, PORT, 9600, 2);
        let model = models::model_table();
        let entry = model.find_model(eastron::MODEL).unwrap();

        assert!(service.add_device(entry.create(spec.clone())));
        assert!(!service.add_device(entry.create(spec)));
        assert_eq!(service.devices().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_is_dropped() {
        let bus = SimulatedBus::new();
        bus.add_port(EndpointId::Serial(PORT.to_string()));
        let (mut service, registry) = setup(&bus);
        service.set_exit_on_error(true);

        let table = models::model_table();
        let entry = table.find_model(eastron::MODEL).unwrap();
        service.add_device(entry.create(DeviceSpec::serial(BusMode::Rtu, PORT, 9600, 9)));

        // Failures are tolerated for a while
        service.tick().await.unwrap();
        assert_eq!(service.devices().count(), 1);

        tokio::time::advance(FAIL_TIMEOUT).await;
        let err = service.tick().await.unwrap_err();
        assert!(err.to_string().contains("Device failed"));
        assert!(service.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_scan_repeats_while_empty() {
        let bus = SimulatedBus::new();
        bus.add_port(EndpointId::Serial(PORT.to_string()));
        let (mut service, _registry) = setup(&bus);
        service.set_auto_scan(true);

        service.tick().await.unwrap();
        assert!(service.scanning());
        tick_until(&mut service, |s| !s.scanning()).await;
        let first = bus.calls().len();
        assert_eq!(first, 2);

        // Not again until the interval has passed
        service.tick().await.unwrap();
        assert!(!service.scanning());

        tokio::time::advance(SCAN_INTERVAL).await;
        service.tick().await.unwrap();
        assert!(service.scanning());
    }
}
