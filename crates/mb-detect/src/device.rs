//! Devices
//!
//! A [`Device`] is what probing produces and what the service loop polls.
//! Optional capabilities (a user-settable name, an AC position) are exposed
//! through the `as_*` accessors rather than through a class hierarchy.
//!
//! [`RegisterDevice`] implements the common case: a table of info registers
//! read once at init and a table of data registers polled on every update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mb_bus::{RegisterCoder, TransportHandle, TransportRegistry};
use mb_register::{ReadPlanner, RegisterDescriptor, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::spec::DeviceSpec;

/// Path of the serial-number info register, used to build the ident
pub const SERIAL_PATH: &str = "/Serial";

/// A discovered or configured device
#[async_trait]
pub trait Device: Send + fmt::Debug {
    /// Where the device lives
    fn spec(&self) -> &DeviceSpec;

    /// Model name from the signature table
    fn model(&self) -> &str;

    /// Connect and read static information
    async fn init(&mut self, registry: Arc<TransportRegistry>) -> Result<(), DeviceError>;

    /// Poll live values
    async fn update(&mut self) -> Result<(), DeviceError>;

    /// Release the transport; the device may be initialised again later
    fn destroy(&mut self);

    /// Stable identifier (available after init)
    fn ident(&self) -> Option<String>;

    /// Latest values as (path, formatted value) pairs
    fn readings(&self) -> Vec<(String, String)>;

    fn as_custom_name(&self) -> Option<&dyn HasCustomName> {
        None
    }

    fn as_custom_name_mut(&mut self) -> Option<&mut dyn HasCustomName> {
        None
    }

    fn as_position(&self) -> Option<&dyn HasPosition> {
        None
    }

    fn as_position_mut(&mut self) -> Option<&mut dyn HasPosition> {
        None
    }
}

/// Devices whose display name the user may change
pub trait HasCustomName {
    fn custom_name(&self) -> Option<&str>;
    fn set_custom_name(&mut self, name: Option<String>);
}

/// Where an AC device is wired in the installation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcPosition {
    #[default]
    AcInput1,
    AcOutput,
    AcInput2,
}

impl AcPosition {
    /// Numeric code (0 = input 1, 1 = output, 2 = input 2)
    pub fn code(&self) -> u8 {
        match self {
            AcPosition::AcInput1 => 0,
            AcPosition::AcOutput => 1,
            AcPosition::AcInput2 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AcPosition::AcInput1),
            1 => Some(AcPosition::AcOutput),
            2 => Some(AcPosition::AcInput2),
            _ => None,
        }
    }
}

pub trait HasPosition {
    fn position(&self) -> AcPosition;
    fn set_position(&mut self, position: AcPosition);
}

/// A device described entirely by register tables
pub struct RegisterDevice {
    spec: DeviceSpec,
    model: String,
    ident_prefix: String,
    info_regs: Vec<RegisterDescriptor>,
    data_regs: Vec<RegisterDescriptor>,
    coder: RegisterCoder,
    info: BTreeMap<String, Value>,
    values: BTreeMap<String, Value>,
    registry: Option<Arc<TransportRegistry>>,
    handle: Option<Arc<TransportHandle>>,
}

impl fmt::Debug for RegisterDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterDevice")
            .field("spec", &self.spec.to_string())
            .field("model", &self.model)
            .field("connected", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl RegisterDevice {
    /// Create a device with empty register tables
    pub fn new(spec: DeviceSpec, model: impl Into<String>, ident_prefix: impl Into<String>) -> Self {
        Self {
            spec,
            model: model.into(),
            ident_prefix: ident_prefix.into(),
            info_regs: Vec::new(),
            data_regs: Vec::new(),
            coder: RegisterCoder::new(),
            info: BTreeMap::new(),
            values: BTreeMap::new(),
            registry: None,
            handle: None,
        }
    }

    /// Registers read once during init
    pub fn with_info_regs(mut self, regs: Vec<RegisterDescriptor>) -> Self {
        self.info_regs = regs;
        self
    }

    /// Registers polled on every update
    pub fn with_data_regs(mut self, regs: Vec<RegisterDescriptor>) -> Self {
        self.data_regs = regs;
        self
    }

    /// Block planning (size limit, barriers) and response timeout
    pub fn with_planner(mut self, planner: ReadPlanner, timeout: Duration) -> Self {
        self.coder = RegisterCoder::with_planner(planner).with_timeout(timeout);
        self
    }

    pub fn info(&self, path: &str) -> Option<&Value> {
        self.info.get(path)
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Set a derived value (one not read from a register)
    pub fn set_value(&mut self, path: impl Into<String>, value: Value) {
        self.values.insert(path.into(), value);
    }

    pub fn data_regs(&self) -> &[RegisterDescriptor] {
        &self.data_regs
    }

    /// The shared transport, acquired again if the last one failed
    async fn transport(&mut self) -> Result<Arc<TransportHandle>, DeviceError> {
        if let Some(handle) = &self.handle {
            if !handle.is_closed() {
                return Ok(Arc::clone(handle));
            }
        }
        if let Some(stale) = self.handle.take() {
            stale.release();
        }

        let registry = self.registry.as_ref().ok_or(DeviceError::NotInitialised)?;
        let handle = registry.acquire(&self.spec.endpoint).await?;
        debug!("{} acquired {}", self.spec, handle.endpoint());
        self.handle = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Read the info registers; undecodable entries are skipped
    pub async fn read_info(&mut self) -> Result<(), DeviceError> {
        if self.info_regs.is_empty() {
            return Ok(());
        }
        let handle = self.transport().await?;
        let results = self
            .coder
            .read(&handle, self.spec.unit, &self.info_regs)
            .await?;

        for (reg, result) in self.info_regs.iter().zip(results) {
            match result {
                Ok(value) => {
                    self.info.insert(reg.path.clone(), value);
                }
                Err(e) => debug!("{}: info {} unreadable: {}", self.spec, reg.path, e),
            }
        }
        Ok(())
    }

    /// Poll the data registers
    ///
    /// Values that fail to decode keep their previous reading.
    pub async fn poll(&mut self) -> Result<(), DeviceError> {
        if self.registry.is_none() {
            return Err(DeviceError::NotInitialised);
        }
        let handle = self.transport().await?;
        let results = self
            .coder
            .read(&handle, self.spec.unit, &self.data_regs)
            .await?;

        for (reg, result) in self.data_regs.iter().zip(results) {
            match result {
                Ok(value) => {
                    self.values.insert(reg.path.clone(), value);
                }
                Err(e) => debug!("{}: {} unreadable: {}", self.spec, reg.path, e),
            }
        }
        Ok(())
    }

    /// Write a data register by path
    pub async fn write(&mut self, path: &str, value: &Value) -> Result<(), DeviceError> {
        let reg = self
            .data_regs
            .iter()
            .find(|r| r.path == path)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownPath(path.to_string()))?;
        let handle = self.transport().await?;
        self.coder.write(&handle, self.spec.unit, &reg, value).await?;
        self.values.insert(reg.path, value.clone());
        Ok(())
    }

    /// Format the latest value at `path` with its unit label
    pub fn display(&self, path: &str) -> Option<String> {
        let value = self.values.get(path)?;
        let reg = self.data_regs.iter().find(|r| r.path == path);
        Some(match reg {
            Some(reg) => reg.display(value),
            None => value.to_string(),
        })
    }
}

#[async_trait]
impl Device for RegisterDevice {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn init(&mut self, registry: Arc<TransportRegistry>) -> Result<(), DeviceError> {
        self.registry = Some(registry);
        self.coder.invalidate();
        self.read_info().await?;
        info!(
            "Initialised {} at {} ({})",
            self.model,
            self.spec,
            self.ident().unwrap_or_else(|| "no serial".to_string())
        );
        Ok(())
    }

    async fn update(&mut self) -> Result<(), DeviceError> {
        self.poll().await
    }

    fn destroy(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        self.registry = None;
    }

    fn ident(&self) -> Option<String> {
        let serial = self.info.get(SERIAL_PATH)?;
        Some(format!("{}_{}", self.ident_prefix, serial))
    }

    fn readings(&self) -> Vec<(String, String)> {
        self.values
            .keys()
            .filter_map(|path| Some((path.clone(), self.display(path)?)))
            .collect()
    }
}

impl Drop for RegisterDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("{} dropped without destroy", self.spec);
            handle.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_bus::{BusMode, TransportConfig};
    use mb_register::Access;
    use mb_sim::{SimulatedBus, VirtualDevice};

    const PORT: &str = "/dev/ttyUSB0";

    fn meter_device() -> RegisterDevice {
        RegisterDevice::new(
            DeviceSpec::serial(BusMode::Rtu, PORT, 9600, 2),
            "Test Meter",
            "cg",
        )
        .with_info_regs(vec![RegisterDescriptor::u32_be(0xfc00).with_path(SERIAL_PATH)])
        .with_data_regs(vec![
            RegisterDescriptor::f32_be(0x0000)
                .input()
                .with_path("/Ac/Voltage")
                .with_unit("V"),
            RegisterDescriptor::u16(0x0100).with_path("/Setpoint"),
        ])
    }

    fn simulated() -> (SimulatedBus, Arc<TransportRegistry>) {
        let bus = SimulatedBus::new();
        bus.attach_serial(
            PORT,
            VirtualDevice::new("meter", 2)
                .at_rate(9600)
                .with_holding(0xfc00, &[0, 12345])
                .with_f32(Access::Input, 0x0000, 231.5),
        );
        let registry = Arc::new(TransportRegistry::new(
            Arc::new(bus.clone()),
            TransportConfig::default(),
        ));
        (bus, registry)
    }

    #[tokio::test]
    async fn test_init_update_destroy() {
        let (bus, registry) = simulated();
        let mut device = meter_device();

        device.init(Arc::clone(&registry)).await.unwrap();
        assert_eq!(device.ident(), Some("cg_12345".to_string()));

        device.update().await.unwrap();
        assert_eq!(device.value("/Ac/Voltage"), Some(&Value::Float(231.5)));
        assert_eq!(device.display("/Ac/Voltage"), Some("231.5 V".to_string()));
        assert_eq!(device.readings().len(), 2);

        device.destroy();
        assert!(registry.is_empty());
        assert_eq!(bus.open_links(&device.spec().endpoint.id()), 0);
    }

    #[tokio::test]
    async fn test_update_before_init() {
        let mut device = meter_device();
        assert!(matches!(
            device.update().await,
            Err(DeviceError::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_write_by_path() {
        let (bus, registry) = simulated();
        let mut device = meter_device();
        device.init(registry).await.unwrap();

        device.write("/Setpoint", &Value::Int(42)).await.unwrap();
        let id = device.spec().endpoint.id();
        assert_eq!(
            bus.with_device(&id, 2, |d| d.register(Access::Holding, 0x0100)),
            Some(Some(42))
        );
        assert!(matches!(
            device.write("/Nope", &Value::Int(1)).await,
            Err(DeviceError::UnknownPath(_))
        ));
        device.destroy();
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_failure() {
        let (bus, registry) = simulated();
        let mut device = meter_device();
        device.init(Arc::clone(&registry)).await.unwrap();

        let id = device.spec().endpoint.id();
        bus.break_port(&id);
        assert!(device.update().await.is_err());

        device.update().await.unwrap();
        assert_eq!(bus.connects(), 2);
        device.destroy();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_position_codes() {
        assert_eq!(AcPosition::from_code(1), Some(AcPosition::AcOutput));
        assert_eq!(AcPosition::AcInput2.code(), 2);
        assert_eq!(AcPosition::from_code(3), None);
        assert_eq!(AcPosition::default(), AcPosition::AcInput1);
    }
}
