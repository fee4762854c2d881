//! Growatt MIN 4200-TL PV inverter (protocol v1.20)
//!
//! Live values are scaled integers in input registers 0-124. Identification
//! strings are ASCII in holding registers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mb_bus::{BusMode, TransportRegistry};
use mb_detect::{
    AcPosition, Device, DeviceError, DeviceSpec, HasCustomName, HasPosition, ModelSignature,
    ModelTable, RegisterDevice, SERIAL_PATH,
};
use mb_register::{ReadPlanner, RegisterDescriptor, Value, MAX_BLOCK_SIZE};

pub const MODEL: &str = "Growatt MIN 4200-TL";
pub const PRODUCT_NAME: &str = "Growatt MIN 4200-TL";

/// Model code in holding register 43
const MODEL_CODE: i64 = 5100;

const TIMEOUT: Duration = Duration::from_millis(500);
const TRACKERS: u16 = 2;

const STATUS_PATH: &str = "/Internal/Status";

pub fn register(table: &mut ModelTable) {
    table.register(
        ModelSignature::new(RegisterDescriptor::u16(43).holding())
            .with_model(MODEL_CODE, MODEL, create)
            .with_modes([BusMode::Rtu])
            .with_units([1])
            .with_rates([9600]),
    );
}

fn create(spec: DeviceSpec, model: &str) -> Box<dyn Device> {
    Box::new(GrowattInverter::new(spec, model))
}

/// Inverter state (0 waiting, 1 normal, 2 fault) as a platform status code
fn status_code(raw: i64) -> Option<i64> {
    match raw {
        0 => Some(0),
        1 => Some(7),
        2 => Some(10),
        _ => None,
    }
}

fn scaled(reg: RegisterDescriptor, path: &str, unit: &str) -> RegisterDescriptor {
    reg.input().with_path(path).with_unit(unit).with_scale(10.0)
}

fn tracker_regs(n: u16) -> Vec<RegisterDescriptor> {
    let s = 4 * n;
    vec![
        scaled(RegisterDescriptor::u16(3 + s), &format!("/Internal/Pv/{}/V", n), "V"),
        scaled(RegisterDescriptor::u16(4 + s), &format!("/Internal/Pv/{}/I", n), "A"),
        scaled(RegisterDescriptor::u32_be(5 + s), &format!("/Internal/Pv/{}/P", n), "W"),
        scaled(
            RegisterDescriptor::u32_be(59 + s),
            &format!("/Internal/Pv/{}/Energy/Today", n),
            "kWh",
        ),
        scaled(
            RegisterDescriptor::u32_be(61 + s),
            &format!("/Internal/Pv/{}/Energy/Total", n),
            "kWh",
        ),
    ]
}

fn data_regs() -> Vec<RegisterDescriptor> {
    let mut regs = vec![
        scaled(RegisterDescriptor::u32_be(35), "/Ac/Power", "W"),
        scaled(RegisterDescriptor::u16(39), "/Ac/Current", "A"),
        scaled(RegisterDescriptor::u16(38), "/Ac/Voltage", "V"),
        scaled(RegisterDescriptor::u32_be(55), "/Ac/Energy/Forward", "kWh"),
        scaled(RegisterDescriptor::u16(39), "/Ac/L1/Current", "A"),
        scaled(RegisterDescriptor::u32_be(35), "/Ac/L1/Power", "W"),
        scaled(RegisterDescriptor::u32_be(53), "/Ac/L1/Energy/Forward", "kWh"),
        scaled(RegisterDescriptor::u16(38), "/Ac/L1/Voltage", "V"),
        RegisterDescriptor::u16(105).input().with_path("/ErrorCode"),
        scaled(RegisterDescriptor::u16(93), "/Internal/InverterTemp", "C"),
        scaled(RegisterDescriptor::u16(94), "/Internal/IPMTemp", "C"),
        scaled(RegisterDescriptor::u16(95), "/Internal/BoostTemp", "C"),
        RegisterDescriptor::u16(104).input().with_path("/Internal/DerateMode"),
        RegisterDescriptor::u16(122).with_path("/Internal/ExportLimitType"),
        RegisterDescriptor::u16(123)
            .with_path("/Internal/ExportLimitPowerRate")
            .with_unit("%")
            .with_scale(10.0),
        RegisterDescriptor::u16(0).input().with_path(STATUS_PATH),
    ];
    for n in 0..TRACKERS {
        regs.extend(tracker_regs(n));
    }
    regs
}

/// Growatt MIN series single-phase PV inverter
#[derive(Debug)]
pub struct GrowattInverter {
    inner: RegisterDevice,
    custom_name: Option<String>,
    position: AcPosition,
}

impl GrowattInverter {
    pub fn new(spec: DeviceSpec, model: &str) -> Self {
        let inner = RegisterDevice::new(spec, model, "pv")
            .with_info_regs(vec![
                RegisterDescriptor::text(12, 2).with_path("/HardwareVersion"),
                RegisterDescriptor::text(9, 3).with_path("/FirmwareVersion"),
                RegisterDescriptor::text(209, 15).with_path(SERIAL_PATH),
            ])
            .with_data_regs(data_regs())
            .with_planner(ReadPlanner::new(MAX_BLOCK_SIZE), TIMEOUT);
        Self {
            inner,
            custom_name: None,
            position: AcPosition::default(),
        }
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.inner.value(path)
    }

    fn update_status(&mut self) {
        let code = self
            .inner
            .value(STATUS_PATH)
            .and_then(Value::as_i64)
            .and_then(status_code);
        if let Some(code) = code {
            self.inner.set_value("/StatusCode", Value::Int(code));
        }
    }
}

#[async_trait]
impl Device for GrowattInverter {
    fn spec(&self) -> &DeviceSpec {
        self.inner.spec()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn init(&mut self, registry: Arc<TransportRegistry>) -> Result<(), DeviceError> {
        self.inner.init(registry).await?;
        self.inner
            .set_value("/DeviceName", Value::Text(PRODUCT_NAME.to_string()));
        self.inner.set_value("/NrOfPhases", Value::Int(1));
        self.inner
            .set_value("/Position", Value::Int(self.position.code() as i64));
        Ok(())
    }

    async fn update(&mut self) -> Result<(), DeviceError> {
        self.inner.update().await?;
        self.update_status();
        Ok(())
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }

    fn ident(&self) -> Option<String> {
        self.inner.ident()
    }

    fn readings(&self) -> Vec<(String, String)> {
        self.inner.readings()
    }

    fn as_custom_name(&self) -> Option<&dyn HasCustomName> {
        Some(self)
    }

    fn as_custom_name_mut(&mut self) -> Option<&mut dyn HasCustomName> {
        Some(self)
    }

    fn as_position(&self) -> Option<&dyn HasPosition> {
        Some(self)
    }

    fn as_position_mut(&mut self) -> Option<&mut dyn HasPosition> {
        Some(self)
    }
}

impl HasCustomName for GrowattInverter {
    fn custom_name(&self) -> Option<&str> {
        self.custom_name.as_deref()
    }

    fn set_custom_name(&mut self, name: Option<String>) {
        self.custom_name = name;
    }
}

impl HasPosition for GrowattInverter {
    fn position(&self) -> AcPosition {
        self.position
    }

    fn set_position(&mut self, position: AcPosition) {
        self.position = position;
        self.inner
            .set_value("/Position", Value::Int(position.code() as i64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_bus::TransportConfig;
    use mb_sim::{SimulatedBus, VirtualDevice};

    const PORT: &str = "/dev/ttyUSB0";

    /// Pack ASCII into registers, two characters each
    fn ascii(text: &str) -> Vec<u16> {
        text.as_bytes()
            .chunks(2)
            .map(|c| (c[0] as u16) << 8 | c.get(1).copied().unwrap_or(0) as u16)
            .collect()
    }

    fn inverter() -> VirtualDevice {
        VirtualDevice::new("min4200", 1)
            .at_rate(9600)
            .with_holding(43, &[5100])
            .with_holding(209, &ascii("QBB1234567"))
            .with_holding(9, &ascii("GH1.0"))
            .with_input(0, &[1])
            .with_input(35, &[0, 21500])
            .with_input(38, &[2301, 93])
            .with_input(3, &[3105, 35, 0, 10868])
    }

    #[tokio::test]
    async fn test_poll_scales_and_maps_status() {
        let bus = SimulatedBus::new();
        bus.attach_serial(PORT, inverter());
        let registry = Arc::new(TransportRegistry::new(
            Arc::new(bus.clone()),
            TransportConfig::default(),
        ));

        let mut device =
            GrowattInverter::new(DeviceSpec::serial(BusMode::Rtu, PORT, 9600, 1), MODEL);
        device.init(Arc::clone(&registry)).await.unwrap();
        assert_eq!(device.ident(), Some("pv_QBB1234567".to_string()));

        device.update().await.unwrap();
        assert_eq!(device.value("/Ac/Power"), Some(&Value::Float(2150.0)));
        assert_eq!(device.value("/Ac/L1/Voltage"), Some(&Value::Float(230.1)));
        assert_eq!(device.value("/Internal/Pv/0/V"), Some(&Value::Float(310.5)));
        assert_eq!(device.value("/StatusCode"), Some(&Value::Int(7)));
        assert_eq!(device.value("/Position"), Some(&Value::Int(0)));

        device.destroy();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_code(0), Some(0));
        assert_eq!(status_code(1), Some(7));
        assert_eq!(status_code(2), Some(10));
        assert_eq!(status_code(3), None);
    }

    #[test]
    fn test_position_capability() {
        let mut device = create(DeviceSpec::serial(BusMode::Rtu, PORT, 9600, 1), MODEL);
        let position = device.as_position_mut().unwrap();
        assert_eq!(position.position(), AcPosition::AcInput1);
        position.set_position(AcPosition::AcOutput);
        assert_eq!(device.as_position().unwrap().position(), AcPosition::AcOutput);
        assert!(device.as_custom_name().is_some());
    }
}
