//! Modbus Device Detection Library
//!
//! This crate identifies energy devices on a Modbus bus without prior
//! configuration:
//!
//! - **Signatures**: per-family identifying registers with a value → model
//!   map and mode/unit/rate filters, kept in registration order
//! - **Probing**: read the applicable signatures at one bus address and
//!   construct the matching device
//! - **Scanning**: sweep unit addresses and line rates on a background task
//!   with incremental progress and a drainable result queue
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mb_bus::{TransportConfig, TransportRegistry};
//! use mb_detect::{ModelTable, ScanTarget, Scanner};
//!
//! # async fn example(table: ModelTable) {
//! let registry = Arc::new(TransportRegistry::with_config(TransportConfig::default()));
//! let scanner = Scanner::new(ScanTarget::serial("/dev/ttyUSB0"), Arc::new(table), registry);
//!
//! scanner.start(false);
//! while scanner.running() {
//!     println!("{}/{}", scanner.done(), scanner.total());
//!     tokio::time::sleep(std::time::Duration::from_millis(500)).await;
//! }
//! for device in scanner.get_devices() {
//!     println!("Found {} at {}", device.model(), device.spec());
//! }
//! # }
//! ```

pub mod device;
pub mod error;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod signature;
pub mod spec;

pub use device::{AcPosition, Device, HasCustomName, HasPosition, RegisterDevice, SERIAL_PATH};
pub use error::{DetectError, DeviceError};
pub use ports::{PortLister, SerialPortInfo};
pub use probe::{Absence, ModelProbe, ProbeOutcome, DEFAULT_PROBE_TIMEOUT};
pub use scanner::{ScanState, ScanTarget, Scanner, ScannerConfig};
pub use signature::{DeviceFactory, ModelEntry, ModelSignature, ModelTable, UnitScope};
pub use spec::DeviceSpec;
