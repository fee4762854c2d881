//! Serial port enumeration
//!
//! Lists the serial ports that could carry an RS-485 bus, so a scan can be
//! pointed at every USB adapter without naming them up front.

use serialport::{available_ports, SerialPortType};
use tracing::info;

use crate::error::DetectError;

/// Information about a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialPortInfo {
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        match port_type {
            SerialPortType::UsbPort(usb) => Self {
                port: name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number.clone(),
                manufacturer: usb.manufacturer.clone(),
                product: usb.product.clone(),
            },
            _ => Self {
                port: name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        }
    }

    pub fn is_usb(&self) -> bool {
        self.vid.is_some()
    }

    /// One-line description for listings
    pub fn describe(&self) -> String {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => format!(
                "{} [{:04x}:{:04x}] {}",
                self.port,
                vid,
                pid,
                self.product.as_deref().unwrap_or("Unknown")
            ),
            _ => self.port.clone(),
        }
    }
}

/// Serial port lister
#[derive(Debug, Clone)]
pub struct PortLister {
    /// Skip ports whose name contains any of these
    skip_patterns: Vec<String>,
    usb_only: bool,
}

impl Default for PortLister {
    fn default() -> Self {
        Self::new()
    }
}

impl PortLister {
    /// Create a lister that skips Bluetooth and debug ports
    pub fn new() -> Self {
        Self {
            skip_patterns: vec!["Bluetooth".to_string(), "debug".to_string()],
            usb_only: false,
        }
    }

    /// Only list USB adapters
    pub fn usb_only(mut self) -> Self {
        self.usb_only = true;
        self
    }

    pub fn skip(mut self, pattern: impl Into<String>) -> Self {
        self.skip_patterns.push(pattern.into());
        self
    }

    /// Enumerate available serial ports
    pub fn enumerate(&self) -> Result<Vec<SerialPortInfo>, DetectError> {
        let ports =
            available_ports().map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;

        let result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| self.accepts(p))
            .collect();

        info!("Found {} serial port(s)", result.len());
        Ok(result)
    }

    fn accepts(&self, port: &SerialPortInfo) -> bool {
        if self.usb_only && !port.is_usb() {
            return false;
        }
        !self.skip_patterns.iter().any(|p| port.port.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb_adapter() -> SerialPortInfo {
        let usb = SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial_number: Some("A10K3Z".to_string()),
            manufacturer: Some("FTDI".to_string()),
            product: Some("USB-RS485".to_string()),
        });
        SerialPortInfo::from_serialport("/dev/ttyUSB0".to_string(), &usb)
    }

    #[test]
    fn test_usb_port_info() {
        let info = usb_adapter();
        assert!(info.is_usb());
        assert_eq!(info.describe(), "/dev/ttyUSB0 [0403:6001] USB-RS485");
    }

    #[test]
    fn test_non_usb_port() {
        let info =
            SerialPortInfo::from_serialport("/dev/ttyS0".to_string(), &SerialPortType::Unknown);
        assert!(!info.is_usb());
        assert_eq!(info.describe(), "/dev/ttyS0");
    }

    #[test]
    fn test_filters() {
        let lister = PortLister::new().usb_only();
        assert!(lister.accepts(&usb_adapter()));

        let builtin =
            SerialPortInfo::from_serialport("/dev/ttyS0".to_string(), &SerialPortType::Unknown);
        assert!(!lister.accepts(&builtin));
        assert!(PortLister::new().accepts(&builtin));

        let bt = SerialPortInfo::from_serialport(
            "/dev/cu.Bluetooth-Incoming-Port".to_string(),
            &SerialPortType::Unknown,
        );
        assert!(!PortLister::new().accepts(&bt));
        assert!(!PortLister::new().skip("ttyUSB").accepts(&usb_adapter()));
    }
}
