//! Client settings
//!
//! Settings come from an optional JSON file; every field has a default so a
//! partial file is fine. Command-line flags override the file.

use std::path::Path;

use anyhow::Context;
use mb_bus::TransportConfig;
use mb_detect::ScannerConfig;
use serde::{Deserialize, Serialize};

/// A device configured by hand instead of discovered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForcedDevice {
    /// Model name as listed by `--models`
    pub model: String,
    /// Unit address on the configured bus
    pub unit: u8,
    /// Line rate (defaults to the client's rate)
    #[serde(default)]
    pub rate: Option<u32>,
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Transport timeouts and warm-up
    pub transport: TransportConfig,
    /// Scan timing and candidate rates
    pub scanner: ScannerConfig,
    /// Rescan periodically while no device is known
    pub auto_scan: bool,
    /// Devices constructed without probing
    pub devices: Vec<ForcedDevice>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            scanner: ScannerConfig::default(),
            auto_scan: true,
            devices: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }
}
