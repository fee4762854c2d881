//! Error types for register coding

use thiserror::Error;

/// Errors that can occur while decoding or encoding register values
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Response slice does not have the number of words the format needs
    #[error("wrong register count: expected {expected}, got {actual}")]
    WrongCount { expected: u16, actual: usize },

    /// Value does not fit the register format
    #[error("value {value} out of range for {format}")]
    OutOfRange { value: String, format: &'static str },

    /// Value kind cannot be stored in the register format
    #[error("cannot encode {kind} value as {format}")]
    WrongKind {
        kind: &'static str,
        format: &'static str,
    },

    /// Register is not writable
    #[error("{0} registers are read-only")]
    ReadOnly(&'static str),
}
