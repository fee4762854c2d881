//! Bus endpoints
//!
//! An endpoint is everything needed to open a connection: the serial device
//! and its line settings, or a TCP host and port. The registry keys shared
//! handles by [`EndpointId`], which deliberately leaves the line settings
//! out so that a second opener asking for a different baud rate on the same
//! port is detected as a conflict rather than silently opening twice.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Above this rate the inter-frame timings are fixed rather than scaled
const FIXED_TIMING_BAUD: u32 = 19_200;

/// How requests are framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    /// Binary serial framing with CRC-16
    Rtu,
    /// Hex-text serial framing with LRC
    Ascii,
    /// Modbus TCP (MBAP header)
    Tcp,
}

impl BusMode {
    /// Returns a human-readable name for the mode
    pub fn name(&self) -> &'static str {
        match self {
            BusMode::Rtu => "rtu",
            BusMode::Ascii => "ascii",
            BusMode::Tcp => "tcp",
        }
    }

    /// Whether the mode runs over a serial line
    pub fn is_serial(&self) -> bool {
        !matches!(self, BusMode::Tcp)
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtu" => Ok(BusMode::Rtu),
            "ascii" => Ok(BusMode::Ascii),
            "tcp" => Ok(BusMode::Tcp),
            other => Err(format!("unknown bus mode '{}'", other)),
        }
    }
}

/// Serial framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Rtu,
    Ascii,
}

impl From<Framing> for BusMode {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Rtu => BusMode::Rtu,
            Framing::Ascii => BusMode::Ascii,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line settings for one port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SerialLink {
    /// Device path (e.g., /dev/ttyUSB0)
    pub path: String,
    /// Line rate in bits per second
    pub baud_rate: u32,
    pub framing: Framing,
    /// Data bits per character (7 or 8)
    pub data_bits: u8,
    pub parity: Parity,
    /// Stop bits per character (1 or 2)
    pub stop_bits: u8,
}

impl SerialLink {
    /// 8N1 line with the given rate and framing
    pub fn new(path: impl Into<String>, baud_rate: u32, framing: Framing) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            framing,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Time to transmit one character (start, data, parity and stop bits)
    pub fn char_time(&self) -> Duration {
        let parity_bits = if self.parity == Parity::None { 0 } else { 1 };
        let bits = 1 + self.data_bits as u64 + parity_bits + self.stop_bits as u64;
        Duration::from_micros(bits * 1_000_000 / self.baud_rate.max(1) as u64)
    }

    /// Silent interval that marks the end of an RTU frame (3.5 characters)
    pub fn inter_frame_delay(&self) -> Duration {
        if self.baud_rate > FIXED_TIMING_BAUD {
            Duration::from_micros(1750)
        } else {
            self.char_time() * 7 / 2
        }
    }

    /// Line settings that differ from `other`, if any
    pub fn conflict(&self, other: &SerialLink) -> Option<String> {
        if self.baud_rate != other.baud_rate {
            return Some(format!(
                "open at {} baud, requested {}",
                self.baud_rate, other.baud_rate
            ));
        }
        if self.framing != other.framing {
            return Some(format!(
                "open with {:?} framing, requested {:?}",
                self.framing, other.framing
            ));
        }
        if (self.data_bits, self.parity, self.stop_bits)
            != (other.data_bits, other.parity, other.stop_bits)
        {
            return Some("line settings differ".to_string());
        }
        None
    }
}

/// TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TcpLink {
    pub host: String,
    pub port: u16,
}

/// A connectable bus endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    Serial(SerialLink),
    Tcp(TcpLink),
}

impl Endpoint {
    /// Serial endpoint with 8N1 line settings
    pub fn serial(path: impl Into<String>, baud_rate: u32, mode: BusMode) -> Self {
        let framing = if mode == BusMode::Ascii {
            Framing::Ascii
        } else {
            Framing::Rtu
        };
        Endpoint::Serial(SerialLink::new(path, baud_rate, framing))
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp(TcpLink {
            host: host.into(),
            port,
        })
    }

    /// Registry key for this endpoint
    pub fn id(&self) -> EndpointId {
        match self {
            Endpoint::Serial(link) => EndpointId::Serial(link.path.clone()),
            Endpoint::Tcp(link) => EndpointId::Tcp {
                host: link.host.clone(),
                port: link.port,
            },
        }
    }

    pub fn mode(&self) -> BusMode {
        match self {
            Endpoint::Serial(link) => link.framing.into(),
            Endpoint::Tcp(_) => BusMode::Tcp,
        }
    }

    /// Line rate, for serial endpoints
    pub fn baud_rate(&self) -> Option<u32> {
        match self {
            Endpoint::Serial(link) => Some(link.baud_rate),
            Endpoint::Tcp(_) => None,
        }
    }

    /// Why `requested` cannot share a connection opened for `self`
    pub fn conflict(&self, requested: &Endpoint) -> Option<String> {
        match (self, requested) {
            (Endpoint::Serial(open), Endpoint::Serial(req)) => open.conflict(req),
            (Endpoint::Tcp(_), Endpoint::Tcp(_)) => None,
            _ => Some("endpoint kind differs".to_string()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial(link) => write!(f, "{}@{}", link.path, link.baud_rate),
            Endpoint::Tcp(link) => write!(f, "{}:{}", link.host, link.port),
        }
    }
}

/// Identity of a physical endpoint, independent of line settings
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointId {
    Serial(String),
    Tcp { host: String, port: u16 },
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Serial(path) => f.write_str(path),
            EndpointId::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}
