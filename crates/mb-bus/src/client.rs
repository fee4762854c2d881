//! Client link abstraction
//!
//! A [`Connector`] opens a [`BusClient`] for an endpoint. The client carries
//! out one request at a time; serialization between callers and timeouts are
//! the handle's job, not the client's.

use std::time::Duration;

use async_trait::async_trait;
use mb_register::Access;

use crate::endpoint::Endpoint;
use crate::error::LinkError;
use crate::TransportConfig;

/// A register operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ReadHolding { address: u16, count: u16 },
    ReadInput { address: u16, count: u16 },
    WriteSingle { address: u16, value: u16 },
    WriteMultiple { address: u16, values: Vec<u16> },
}

/// One request to one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Slave unit address
    pub unit: u8,
    pub operation: Operation,
    /// Overrides the transport's default response timeout
    pub timeout: Option<Duration>,
}

impl Request {
    /// Read `count` registers from the given table
    pub fn read(unit: u8, access: Access, address: u16, count: u16) -> Self {
        let operation = match access {
            Access::Holding => Operation::ReadHolding { address, count },
            Access::Input => Operation::ReadInput { address, count },
        };
        Self {
            unit,
            operation,
            timeout: None,
        }
    }

    /// Write one or more holding registers
    pub fn write(unit: u8, address: u16, values: Vec<u16>) -> Self {
        let operation = match values.as_slice() {
            [value] => Operation::WriteSingle {
                address,
                value: *value,
            },
            _ => Operation::WriteMultiple { address, values },
        };
        Self {
            unit,
            operation,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Number of registers the response should carry (0 for writes)
    pub fn expected_words(&self) -> usize {
        match &self.operation {
            Operation::ReadHolding { count, .. } | Operation::ReadInput { count, .. } => {
                *count as usize
            }
            _ => 0,
        }
    }
}

/// Response to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registers(Vec<u16>),
    Written,
}

impl Response {
    pub fn into_registers(self) -> Option<Vec<u16>> {
        match self {
            Response::Registers(words) => Some(words),
            Response::Written => None,
        }
    }
}

/// An open connection to a bus
#[async_trait]
pub trait BusClient: Send + std::fmt::Debug {
    /// Send one request and wait for its response
    async fn call(&mut self, request: &Request) -> Result<Response, LinkError>;
}

/// Opens client links
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &TransportConfig,
    ) -> Result<Box<dyn BusClient>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let req = Request::read(2, Access::Input, 0x001c, 2);
        assert_eq!(
            req.operation,
            Operation::ReadInput {
                address: 0x001c,
                count: 2
            }
        );
        assert_eq!(req.expected_words(), 2);

        let req = Request::write(1, 100, vec![7]);
        assert!(matches!(req.operation, Operation::WriteSingle { value: 7, .. }));
        assert_eq!(req.expected_words(), 0);

        let req = Request::write(1, 100, vec![7, 8]).with_timeout(Duration::from_millis(50));
        assert!(matches!(req.operation, Operation::WriteMultiple { .. }));
        assert_eq!(req.timeout, Some(Duration::from_millis(50)));
    }
}
