//! Eastron SDM230-Modbus v2 single-phase energy meter
//!
//! Measurements are IEEE-754 floats in input registers. Fast-changing values
//! (voltage, current, power) are re-read every poll; energy counters are
//! cached for up to half a minute. Read barriers keep the groups with
//! different ages in separate requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mb_bus::{BusMode, TransportRegistry};
use mb_detect::{
    Device, DeviceError, DeviceSpec, HasCustomName, ModelSignature, ModelTable, RegisterDevice,
    SERIAL_PATH,
};
use mb_register::{ReadPlanner, RegisterDescriptor, Value, MAX_BLOCK_SIZE};

pub const MODEL: &str = "SDM230Modbusv2";
pub const PRODUCT_NAME: &str = "Eastron SDM230-Modbus v2";

/// Model code in holding register 0x001c
const MODEL_CODE: i64 = 16384;

const TIMEOUT: Duration = Duration::from_secs(1);
const BARRIERS: [u16; 3] = [0x12, 0x46, 0x156];

const FAST: Duration = Duration::from_millis(280);
const SLOW: Duration = Duration::from_secs(5);
const ENERGY: Duration = Duration::from_secs(15);
const TOTALS: Duration = Duration::from_secs(30);

pub fn register(table: &mut ModelTable) {
    table.register(
        ModelSignature::new(RegisterDescriptor::u16(0x001c).holding())
            .with_model(MODEL_CODE, MODEL, create)
            .with_modes([BusMode::Rtu])
            .with_units([2])
            .with_rates([9600]),
    );
}

fn create(spec: DeviceSpec, model: &str) -> Box<dyn Device> {
    Box::new(EastronSdm230::new(spec, model))
}

fn float(address: u16, path: &str, unit: &str, max_age: Duration) -> RegisterDescriptor {
    RegisterDescriptor::f32_be(address)
        .input()
        .with_path(path)
        .with_unit(unit)
        .with_max_age(max_age)
}

fn data_regs() -> Vec<RegisterDescriptor> {
    vec![
        float(0x0000, "/Ac/Voltage", "V", FAST),
        float(0x0006, "/Ac/Current", "A", FAST),
        float(0x000c, "/Ac/Power", "W", FAST),
        float(0x0012, "/Ac/ApparentPower", "VA", SLOW),
        float(0x0018, "/Ac/ReactivePower", "VAr", SLOW),
        RegisterDescriptor::f32_be(0x001e)
            .input()
            .with_path("/Ac/PowerFactor")
            .with_max_age(SLOW),
        float(0x0046, "/Ac/Frequency", "Hz", ENERGY),
        float(0x0048, "/Ac/Energy/Forward", "kWh", ENERGY),
        float(0x004a, "/Ac/Energy/Reverse", "kWh", ENERGY),
        float(0x004c, "/Ac/Energy/ReactiveForward", "VArh", ENERGY),
        float(0x004e, "/Ac/Energy/ReactiveReverse", "VArh", ENERGY),
        float(0x0156, "/Ac/Energy/Total", "kWh", TOTALS),
        float(0x0158, "/Ac/Energy/ReactiveTotal", "VArh", TOTALS),
        // Single phase: L1 mirrors the totals
        float(0x0000, "/Ac/L1/Voltage", "V", FAST),
        float(0x0006, "/Ac/L1/Current", "A", FAST),
        float(0x000c, "/Ac/L1/Power", "W", FAST),
        float(0x0048, "/Ac/L1/Energy/Forward", "kWh", ENERGY),
        float(0x004a, "/Ac/L1/Energy/Reverse", "kWh", ENERGY),
    ]
}

/// Eastron SDM230-Modbus v2
#[derive(Debug)]
pub struct EastronSdm230 {
    inner: RegisterDevice,
    custom_name: Option<String>,
}

impl EastronSdm230 {
    pub fn new(spec: DeviceSpec, model: &str) -> Self {
        let inner = RegisterDevice::new(spec, model, "cg")
            .with_info_regs(vec![
                RegisterDescriptor::u16(0xfc02).with_path("/HardwareVersion"),
                RegisterDescriptor::u16(0xfc03).with_path("/FirmwareVersion"),
                RegisterDescriptor::u32_be(0xfc00).with_path(SERIAL_PATH),
            ])
            .with_data_regs(data_regs())
            .with_planner(ReadPlanner::new(MAX_BLOCK_SIZE).with_barriers(BARRIERS), TIMEOUT);
        Self {
            inner,
            custom_name: None,
        }
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.inner.value(path)
    }

    /// Net consumption: imported minus exported energy
    fn update_consumption(&mut self) {
        let energy = |path| self.inner.value(path).and_then(Value::as_f64);
        if let (Some(forward), Some(reverse)) = (
            energy("/Ac/L1/Energy/Forward"),
            energy("/Ac/L1/Energy/Reverse"),
        ) {
            let consumption = Value::Float(forward - reverse);
            self.inner
                .set_value("/Ac/L1/Energy/Consumption", consumption.clone());
            self.inner.set_value("/Ac/Energy/Consumption", consumption);
        }
    }
}

#[async_trait]
impl Device for EastronSdm230 {
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
        Ok(())
    }

    async fn update(&mut self) -> Result<(), DeviceError> {
        self.inner.update().await?;
        self.update_consumption();
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
}

impl HasCustomName for EastronSdm230 {
    fn custom_name(&self) -> Option<&str> {
        self.custom_name.as_deref()
    }

    fn set_custom_name(&mut self, name: Option<String>) {
        self.custom_name = name;
    }
}
