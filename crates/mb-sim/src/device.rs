//! Virtual Modbus slaves
//!
//! A virtual device answers on one unit address at one line rate, exactly
//! like a real meter configured through its front panel. Requests at any
//! other rate get no answer at all.

use std::collections::BTreeMap;

use mb_bus::{LinkError, Operation, Response};
use mb_register::Access;
use serde::{Deserialize, Serialize};

/// A block of consecutive registers in a device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBlock {
    #[serde(default = "default_access")]
    pub access: Access,
    pub address: u16,
    pub values: Vec<u16>,
}

fn default_access() -> Access {
    Access::Holding
}

/// Configuration for creating a virtual device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDeviceConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Unit address the device answers on
    pub unit: u8,
    /// Line rate (ignored for TCP)
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub registers: Vec<RegisterBlock>,
    /// Answer reads of unmapped registers with an exception instead of zero
    #[serde(default)]
    pub strict: bool,
}

/// A simulated slave device
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    name: String,
    unit: u8,
    baud_rate: Option<u32>,
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
    strict: bool,
    requests: u64,
}

impl VirtualDevice {
    /// Create a device with an empty register map
    pub fn new(name: impl Into<String>, unit: u8) -> Self {
        Self {
            name: name.into(),
            unit,
            baud_rate: None,
            holding: BTreeMap::new(),
            input: BTreeMap::new(),
            strict: false,
            requests: 0,
        }
    }

    /// Create a device from configuration
    pub fn from_config(config: VirtualDeviceConfig) -> Self {
        let mut device = Self::new(config.name, config.unit);
        device.baud_rate = config.baud_rate;
        device.strict = config.strict;
        for block in config.registers {
            device.set_registers(block.access, block.address, &block.values);
        }
        device
    }

    /// Only answer at this line rate
    pub fn at_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    pub fn with_holding(mut self, address: u16, values: &[u16]) -> Self {
        self.set_registers(Access::Holding, address, values);
        self
    }

    pub fn with_input(mut self, address: u16, values: &[u16]) -> Self {
        self.set_registers(Access::Input, address, values);
        self
    }

    /// Store a big-endian float in two registers
    pub fn with_f32(mut self, access: Access, address: u16, value: f32) -> Self {
        self.set_f32(access, address, value);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    /// Requests answered so far
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn set_registers(&mut self, access: Access, address: u16, values: &[u16]) {
        let table = self.table_mut(access);
        for (offset, value) in values.iter().enumerate() {
            table.insert(address.wrapping_add(offset as u16), *value);
        }
    }

    pub fn set_f32(&mut self, access: Access, address: u16, value: f32) {
        let bits = value.to_bits();
        self.set_registers(access, address, &[(bits >> 16) as u16, bits as u16]);
    }

    pub fn register(&self, access: Access, address: u16) -> Option<u16> {
        self.table(access).get(&address).copied()
    }

    /// Whether a request at this rate reaches the device
    pub fn hears(&self, unit: u8, baud_rate: Option<u32>) -> bool {
        if unit != self.unit {
            return false;
        }
        match (self.baud_rate, baud_rate) {
            (Some(own), Some(line)) => own == line,
            _ => true,
        }
    }

    /// Carry out an operation against the register map
    pub fn handle(&mut self, operation: &Operation) -> Result<Response, LinkError> {
        self.requests += 1;

        match operation {
            Operation::ReadHolding { address, count } => self.read(Access::Holding, *address, *count),
            Operation::ReadInput { address, count } => self.read(Access::Input, *address, *count),
            Operation::WriteSingle { address, value } => {
                self.holding.insert(*address, *value);
                Ok(Response::Written)
            }
            Operation::WriteMultiple { address, values } => {
                self.set_registers(Access::Holding, *address, values);
                Ok(Response::Written)
            }
        }
    }

    fn read(&self, access: Access, address: u16, count: u16) -> Result<Response, LinkError> {
        let table = self.table(access);
        let mut words = Vec::with_capacity(count as usize);

        for offset in 0..count {
            let reg = address.wrapping_add(offset);
            match table.get(&reg) {
                Some(value) => words.push(*value),
                None if self.strict => {
                    return Err(LinkError::Exception(format!(
                        "IllegalDataAddress ({} register {})",
                        access, reg
                    )))
                }
                None => words.push(0),
            }
        }

        Ok(Response::Registers(words))
    }

    fn table(&self, access: Access) -> &BTreeMap<u16, u16> {
        match access {
            Access::Holding => &self.holding,
            Access::Input => &self.input,
        }
    }

    fn table_mut(&mut self, access: Access) -> &mut BTreeMap<u16, u16> {
        match access {
            Access::Holding => &mut self.holding,
            Access::Input => &mut self.input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_write() {
        let mut device = VirtualDevice::new("meter", 2).with_holding(0x001c, &[16384]);

        let response = device
            .handle(&Operation::ReadHolding {
                address: 0x001c,
                count: 2,
            })
            .unwrap();
        assert_eq!(response, Response::Registers(vec![16384, 0]));

        device
            .handle(&Operation::WriteSingle {
                address: 0x001d,
                value: 9,
            })
            .unwrap();
        assert_eq!(device.register(Access::Holding, 0x001d), Some(9));
        assert_eq!(device.requests(), 2);
    }

    #[test]
    fn test_strict_device_rejects_unmapped() {
        let mut device = VirtualDevice::new("inverter", 1).with_input(0, &[1]).strict();
        let err = device
            .handle(&Operation::ReadInput { address: 0, count: 2 })
            .unwrap_err();
        assert!(matches!(err, LinkError::Exception(_)));
    }

    #[test]
    fn test_rate_filter() {
        let device = VirtualDevice::new("meter", 2).at_rate(9600);
        assert!(device.hears(2, Some(9600)));
        assert!(!device.hears(2, Some(19200)));
        assert!(!device.hears(3, Some(9600)));
        assert!(device.hears(2, None));
    }

    #[test]
    fn test_f32_layout() {
        let device = VirtualDevice::new("meter", 2).with_f32(Access::Input, 0, 230.0);
        assert_eq!(device.register(Access::Input, 0), Some(0x4366));
        assert_eq!(device.register(Access::Input, 1), Some(0x0000));
    }

    #[test]
    fn test_from_config_json() {
        let config: VirtualDeviceConfig = serde_json::from_str(
            r#"{
                "name": "SDM230",
                "unit": 2,
                "baud_rate": 9600,
                "registers": [
                    {"address": 28, "values": [16384]},
                    {"access": "input", "address": 0, "values": [17254, 0]}
                ]
            }"#,
        )
        .unwrap();

        let device = VirtualDevice::from_config(config);
        assert_eq!(device.name(), "SDM230");
        assert_eq!(device.baud_rate(), Some(9600));
        assert_eq!(device.register(Access::Holding, 28), Some(16384));
        assert_eq!(device.register(Access::Input, 0), Some(17254));
    }
}
