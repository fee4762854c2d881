//! Modbus Bus Simulation Library
//!
//! This crate provides a simulation layer for testing discovery and polling
//! without physical meters or RS-485 adapters. It includes:
//!
//! - **VirtualDevice**: a slave with holding and input register maps that
//!   answers on one unit address at one line rate
//! - **SimulatedBus**: a [`Connector`](mb_bus::Connector) whose ports carry
//!   virtual devices, recording every request and flagging overlapping ones
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mb_bus::{BusMode, Endpoint, Request, TransportConfig, TransportRegistry};
//! use mb_register::Access;
//! use mb_sim::{SimulatedBus, VirtualDevice};
//!
//! # tokio_test_block_on(async {
//! let bus = SimulatedBus::new();
//! bus.attach_serial(
//!     "/dev/ttyUSB0",
//!     VirtualDevice::new("SDM230", 2).at_rate(9600).with_holding(0x001c, &[16384]),
//! );
//!
//! let registry = TransportRegistry::new(Arc::new(bus.clone()), TransportConfig::default());
//! let handle = registry
//!     .acquire(&Endpoint::serial("/dev/ttyUSB0", 9600, BusMode::Rtu))
//!     .await
//!     .unwrap();
//! let response = handle.execute(Request::read(2, Access::Holding, 0x001c, 1)).await.unwrap();
//! assert_eq!(response.into_registers(), Some(vec![16384]));
//! handle.release();
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

pub mod bus;
pub mod device;

pub use bus::{CallRecord, SimulatedBus, SimulatedBusConfig, SimulatedPortConfig};
pub use device::{RegisterBlock, VirtualDevice, VirtualDeviceConfig};
