//! Device specs
//!
//! A [`DeviceSpec`] says where a device lives: which endpoint, with which
//! line settings, at which unit address. It doubles as the device's stable
//! identity, so it is totally ordered and has a round-trippable text form:
//!
//! ```text
//! rtu:/dev/ttyUSB0:9600:2
//! ascii:/dev/ttyS1:19200:7
//! tcp:192.168.1.50:502:1
//! ```

use std::fmt;
use std::str::FromStr;

use mb_bus::{BusMode, Endpoint};
use mb_register::{UNIT_MAX, UNIT_MIN};

use crate::error::DetectError;

/// Location of one device on a bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSpec {
    pub endpoint: Endpoint,
    /// Unit (slave) address
    pub unit: u8,
}

impl DeviceSpec {
    pub fn new(endpoint: Endpoint, unit: u8) -> Self {
        Self { endpoint, unit }
    }

    /// Serial device spec with 8N1 line settings
    pub fn serial(mode: BusMode, path: impl Into<String>, baud_rate: u32, unit: u8) -> Self {
        Self::new(Endpoint::serial(path, baud_rate, mode), unit)
    }

    pub fn tcp(host: impl Into<String>, port: u16, unit: u8) -> Self {
        Self::new(Endpoint::tcp(host, port), unit)
    }

    pub fn mode(&self) -> BusMode {
        self.endpoint.mode()
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.endpoint.baud_rate()
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Serial(link) => write!(
                f,
                "{}:{}:{}:{}",
                self.mode(),
                link.path,
                link.baud_rate,
                self.unit
            ),
            Endpoint::Tcp(link) => write!(f, "tcp:{}:{}:{}", link.host, link.port, self.unit),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DetectError::InvalidSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (mode, rest) = s.split_once(':').ok_or_else(|| invalid("missing mode"))?;
        let mode: BusMode = mode.parse().map_err(|e: String| invalid(&e))?;

        // Paths and host names may contain ':', so split from the right
        let mut fields = rest.rsplitn(3, ':');
        let unit = fields.next().ok_or_else(|| invalid("missing unit"))?;
        let middle = fields.next().ok_or_else(|| invalid("missing rate or port"))?;
        let location = fields
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| invalid("missing device or host"))?;

        let unit: u8 = unit.parse().map_err(|_| invalid("bad unit address"))?;

        match mode {
            BusMode::Tcp => {
                let port: u16 = middle.parse().map_err(|_| invalid("bad port"))?;
                Ok(DeviceSpec::tcp(location, port, unit))
            }
            BusMode::Rtu | BusMode::Ascii => {
                let rate: u32 = middle.parse().map_err(|_| invalid("bad baud rate"))?;
                if !(UNIT_MIN..=UNIT_MAX).contains(&unit) {
                    return Err(invalid("serial unit must be 1-247"));
                }
                Ok(DeviceSpec::serial(mode, location, rate, unit))
            }
        }
    }
}
