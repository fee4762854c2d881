//! Shared Modbus Transports
//!
//! Several devices often sit on one RS-485 line or behind one TCP gateway.
//! This crate lets them share a single connection safely:
//!
//! - **Registry**: one open connection per physical endpoint, handed out as
//!   reference-counted [`TransportHandle`]s
//! - **Transactions**: requests on a handle are serialized, and a handle is
//!   never closed under a request that is still running
//! - **Register coding**: [`RegisterCoder`] reads typed descriptors with
//!   block coalescing and a max-age cache
//!
//! # Example
//!
//! ```rust,no_run
//! use mb_bus::{BusMode, Endpoint, RegisterCoder, TransportConfig, TransportRegistry};
//! use mb_register::RegisterDescriptor;
//!
//! # async fn example() -> Result<(), mb_bus::BusError> {
//! let registry = TransportRegistry::with_config(TransportConfig::default());
//! let handle = registry
//!     .acquire(&Endpoint::serial("/dev/ttyUSB0", 9600, BusMode::Rtu))
//!     .await?;
//!
//! let mut coder = RegisterCoder::new();
//! let values = coder
//!     .read(&handle, 2, &[RegisterDescriptor::f32_be(0x0000).input()])
//!     .await?;
//! println!("voltage: {:?}", values[0]);
//!
//! handle.release();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod coder;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod modbus;
pub mod registry;

#[cfg(test)]
mod testing;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::{BusClient, Connector, Operation, Request, Response};
pub use coder::RegisterCoder;
pub use endpoint::{BusMode, Endpoint, EndpointId, Framing, Parity, SerialLink, TcpLink};
pub use error::{BusError, LinkError};
pub use handle::{HandleState, HandleStatus, TransportHandle};
pub use modbus::ModbusConnector;
pub use registry::TransportRegistry;

/// Connection settings shared by every transport of a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default response timeout (milliseconds)
    pub timeout_ms: u64,
    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Broadcast frames sent after opening a serial port
    pub warmup_frames: usize,
    /// Pause between warm-up frames (milliseconds)
    pub warmup_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            connect_timeout_ms: 5000,
            warmup_frames: 12,
            warmup_interval_ms: 100,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn warmup_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.warmup_frames, 12);
        assert_eq!(config.warmup_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_config_partial_json() {
        let config: TransportConfig = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.warmup_frames, 12);
    }
}
