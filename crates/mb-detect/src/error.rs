//! Error types for device detection

use mb_bus::BusError;
use thiserror::Error;

/// Errors that can occur during detection
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// A device spec string could not be parsed
    #[error("invalid device spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// No registered signature knows this model
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// Errors raised by a device while initialising or updating
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Bus error talking to the device
    #[error(transparent)]
    Bus(#[from] BusError),

    /// `update` called before a successful `init`
    #[error("device not initialised")]
    NotInitialised,

    /// No data register with this path
    #[error("no register at {0}")]
    UnknownPath(String),
}

impl DeviceError {
    /// Whether the device simply did not answer this time
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Bus(e) if e.is_timeout())
    }
}
