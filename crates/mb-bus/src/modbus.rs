//! Real bus links backed by tokio-modbus
//!
//! Serial ports are opened through tokio-serial and warmed up with a burst
//! of broadcast frames before the RTU client is attached. TCP endpoints are
//! resolved and connected with the connect timeout of the transport config.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::lookup_host;
use tokio::time::{sleep, timeout, Instant};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::*;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::client::{BusClient, Connector, Operation, Request, Response};
use crate::endpoint::{Endpoint, Framing, Parity, SerialLink, TcpLink};
use crate::error::LinkError;
use crate::TransportConfig;

/// Opens RTU and TCP links with tokio-modbus
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &TransportConfig,
    ) -> Result<Box<dyn BusClient>, LinkError> {
        match endpoint {
            Endpoint::Serial(link) => open_serial(link, config).await,
            Endpoint::Tcp(link) => open_tcp(link, config).await,
        }
    }
}

async fn open_serial(
    link: &SerialLink,
    config: &TransportConfig,
) -> Result<Box<dyn BusClient>, LinkError> {
    if link.framing == Framing::Ascii {
        return Err(LinkError::Unsupported(format!(
            "ASCII framing on {}",
            link.path
        )));
    }

    let data_bits = match link.data_bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match link.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match link.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let mut port = tokio_serial::new(&link.path, link.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| LinkError::Open(format!("{}: {}", link.path, e)))?;

    info!("Opened {} at {} baud", link.path, link.baud_rate);
    warm_up(&mut port, &link.path, config).await;

    let ctx = rtu::attach(port);
    Ok(Box::new(ModbusLink {
        ctx,
        frame_gap: Some(link.inter_frame_delay()),
        last_frame: None,
    }))
}

/// Send broadcast frames so auto-baud slaves can lock on to the line rate
///
/// Failures are logged and otherwise ignored; the port is still usable.
async fn warm_up(port: &mut SerialStream, path: &str, config: &TransportConfig) {
    let frame = mb_register::warmup_frame();

    for i in 0..config.warmup_frames {
        if i > 0 {
            sleep(config.warmup_interval()).await;
        }
        if let Err(e) = port.write_all(&frame).await {
            warn!("Warm-up write on {} failed: {}", path, e);
            return;
        }
    }

    if config.warmup_frames > 0 {
        debug!("Sent {} warm-up frames on {}", config.warmup_frames, path);
    }
}

async fn open_tcp(
    link: &TcpLink,
    config: &TransportConfig,
) -> Result<Box<dyn BusClient>, LinkError> {
    let addr = lookup_host((link.host.as_str(), link.port))
        .await
        .map_err(|e| LinkError::Open(format!("{}: {}", link.host, e)))?
        .next()
        .ok_or_else(|| LinkError::Open(format!("{}: no address", link.host)))?;

    let ctx = timeout(config.connect_timeout(), tcp::connect(addr))
        .await
        .map_err(|_| LinkError::Open(format!("{}: connect timed out", addr)))?
        .map_err(|e| LinkError::Open(format!("{}: {}", addr, e)))?;

    info!("Connected to {}", addr);
    Ok(Box::new(ModbusLink {
        ctx,
        frame_gap: None,
        last_frame: None,
    }))
}

/// A tokio-modbus client context
struct ModbusLink {
    ctx: Context,
    /// Minimum bus silence between frames (serial only)
    frame_gap: Option<std::time::Duration>,
    last_frame: Option<Instant>,
}

impl std::fmt::Debug for ModbusLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusLink")
            .field("frame_gap", &self.frame_gap)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BusClient for ModbusLink {
    async fn call(&mut self, request: &Request) -> Result<Response, LinkError> {
        if let (Some(gap), Some(last)) = (self.frame_gap, self.last_frame) {
            let idle = last.elapsed();
            if idle < gap {
                sleep(gap - idle).await;
            }
        }

        self.ctx.set_slave(Slave(request.unit));

        let result = match &request.operation {
            Operation::ReadHolding { address, count } => self
                .ctx
                .read_holding_registers(*address, *count)
                .await
                .map(|r| r.map(Response::Registers)),
            Operation::ReadInput { address, count } => self
                .ctx
                .read_input_registers(*address, *count)
                .await
                .map(|r| r.map(Response::Registers)),
            Operation::WriteSingle { address, value } => self
                .ctx
                .write_single_register(*address, *value)
                .await
                .map(|r| r.map(|()| Response::Written)),
            Operation::WriteMultiple { address, values } => self
                .ctx
                .write_multiple_registers(*address, values)
                .await
                .map(|r| r.map(|()| Response::Written)),
        };

        self.last_frame = Some(Instant::now());

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(exception)) => Err(LinkError::Exception(format!("{:?}", exception))),
            Err(tokio_modbus::Error::Transport(e)) => Err(LinkError::Io(e)),
            Err(other) => Err(LinkError::Unexpected(other.to_string())),
        }
    }
}
