//! Error types for shared transports

use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointId;

/// Errors reported by a client link (no endpoint context yet)
#[derive(Debug, Error)]
pub enum LinkError {
    /// Failed to open the physical connection
    #[error("failed to open: {0}")]
    Open(String),

    /// The requested framing or feature is not available on this link
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error on an open connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The slave answered with a Modbus exception
    #[error("exception response: {0}")]
    Exception(String),

    /// The response did not match the request
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl LinkError {
    /// Whether the connection is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Open(_) | LinkError::Io(_))
    }
}

/// Errors surfaced by the transport registry and its handles
#[derive(Debug, Error)]
pub enum BusError {
    /// Endpoint is already open with different connection parameters
    #[error("configuration error on {endpoint}: {reason}")]
    Configuration { endpoint: EndpointId, reason: String },

    /// Connect failure or I/O error; the handle has been closed
    #[error("transport error on {endpoint}: {source}")]
    Transport {
        endpoint: EndpointId,
        #[source]
        source: LinkError,
    },

    /// Nothing answered within the request timeout
    #[error("no response from unit {unit} on {endpoint} within {timeout:?}")]
    Timeout {
        endpoint: EndpointId,
        unit: u8,
        timeout: Duration,
    },

    /// The slave answered, but not with the data requested
    #[error("unit {unit} on {endpoint}: {source}")]
    Protocol {
        endpoint: EndpointId,
        unit: u8,
        #[source]
        source: LinkError,
    },

    /// The handle was closed before or during the request
    #[error("transport {0} is closed")]
    Closed(EndpointId),

    /// A value could not be encoded for writing
    #[error("register coding error: {0}")]
    Codec(#[from] mb_register::CodecError),
}

impl BusError {
    /// Wrap a link error with the endpoint and unit it happened on
    pub fn from_link(error: LinkError, endpoint: &EndpointId, unit: u8) -> Self {
        if error.is_fatal() || matches!(error, LinkError::Unsupported(_)) {
            BusError::Transport {
                endpoint: endpoint.clone(),
                source: error,
            }
        } else {
            BusError::Protocol {
                endpoint: endpoint.clone(),
                unit,
                source: error,
            }
        }
    }

    /// No answer at all (absence of a device looks exactly like this)
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    /// The connection is gone; callers must acquire the endpoint again
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport { .. } | BusError::Closed(_))
    }
}
