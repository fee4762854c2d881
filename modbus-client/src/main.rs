//! Modbus energy-device client
//!
//! Finds the meters and inverters on one RS-485 bus or Modbus TCP gateway and
//! polls them. Devices come from three places: a background scan of the bus,
//! explicit `--probe` specs, and devices forced in the settings file.

mod config;
mod models;
mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use mb_bus::{BusMode, TransportConfig, TransportRegistry};
use mb_detect::{DeviceSpec, ModelProbe, ModelTable, PortLister, ScanTarget, Scanner};
use mb_sim::{SimulatedBus, SimulatedBusConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Settings;
use service::Service;

const MODBUS_TCP_PORT: u16 = 502;

#[derive(Parser, Debug)]
#[command(name = "modbus-client", version, about = "Discover and poll Modbus energy devices")]
struct Args {
    /// Serial port the bus is attached to
    #[arg(short, long, conflicts_with = "tcp")]
    serial: Option<String>,

    /// Modbus TCP gateway (host or host:port)
    #[arg(long)]
    tcp: Option<String>,

    /// Line rate to scan at (default: rates of the known models)
    #[arg(short, long)]
    rate: Option<u32>,

    /// Serial framing
    #[arg(short, long, default_value = "rtu")]
    mode: BusMode,

    /// Sweep every unit address, not just the well-known ones
    #[arg(long)]
    full: bool,

    /// Scan even when devices are already configured
    #[arg(short, long)]
    force_scan: bool,

    /// Probe a device spec, e.g. rtu:/dev/ttyUSB0:9600:2 (repeatable)
    #[arg(short = 'P', long = "probe", value_name = "SPEC")]
    probe: Vec<DeviceSpec>,

    /// List supported device models and exit
    #[arg(long)]
    models: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// JSON settings file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Exit when a device fails
    #[arg(short = 'x', long)]
    exit_on_error: bool,

    /// Run against a simulated site described in a JSON file
    #[arg(long, value_name = "FILE")]
    simulate: Option<PathBuf>,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let default = ["modbus_client", "mb_bus", "mb_detect", "mb_register", "mb_sim"]
        .iter()
        .map(|krate| format!("{}={}", krate, level))
        .collect::<Vec<_>>()
        .join(",");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn list_models(table: &ModelTable) {
    for (entry, signature) in table.models() {
        let modes: Vec<_> = signature.modes.iter().map(|m| m.name()).collect();
        println!(
            "{:24} modes {:10} units {:?} rates {:?}",
            entry.name,
            modes.join(","),
            signature.units,
            signature.rates
        );
    }
}

fn list_ports() -> anyhow::Result<()> {
    let ports = PortLister::new().enumerate()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port.describe());
    }
    Ok(())
}

/// Bus to scan, from `--serial` or `--tcp`
fn scan_target(args: &Args) -> anyhow::Result<Option<ScanTarget>> {
    if let Some(path) = &args.serial {
        if args.mode == BusMode::Tcp {
            bail!("--mode tcp needs --tcp, not --serial");
        }
        return Ok(Some(ScanTarget::Serial {
            path: path.clone(),
            mode: args.mode,
        }));
    }
    let Some(addr) = &args.tcp else {
        return Ok(None);
    };
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse()
                .with_context(|| format!("Invalid TCP port in {}", addr))?,
        ),
        None => (addr.clone(), MODBUS_TCP_PORT),
    };
    Ok(Some(ScanTarget::tcp(host, port)))
}

fn open_registry(simulate: Option<&Path>, config: TransportConfig) -> anyhow::Result<TransportRegistry> {
    let Some(path) = simulate else {
        return Ok(TransportRegistry::with_config(config));
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read simulation from {}", path.display()))?;
    let site: SimulatedBusConfig = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse simulation in {}", path.display()))?;
    info!("Simulating {} port(s) from {}", site.ports.len(), path.display());
    Ok(TransportRegistry::new(
        Arc::new(SimulatedBus::from_config(site)),
        config,
    ))
}

/// Spec for a forced device on the scan target
fn forced_spec(
    target: &ScanTarget,
    table: &ModelTable,
    unit: u8,
    rate: Option<u32>,
) -> anyhow::Result<DeviceSpec> {
    match target {
        ScanTarget::Serial { path, mode } => {
            let rate = rate
                .or_else(|| table.rates(*mode).first().copied())
                .context("No line rate configured for forced device")?;
            Ok(DeviceSpec::serial(*mode, path.clone(), rate, unit))
        }
        ScanTarget::Tcp { host, port } => Ok(DeviceSpec::tcp(host.clone(), *port, unit)),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted, shutting down"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let table = Arc::new(models::model_table());
    if args.models {
        list_models(&table);
        return Ok(());
    }
    if args.list_ports {
        return list_ports();
    }

    info!("modbus-client v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(rate) = args.rate {
        settings.scanner.rates = vec![rate];
    }

    let target = scan_target(&args)?;
    if target.is_none() && args.probe.is_empty() {
        bail!("Nothing to do: give --serial, --tcp or --probe");
    }

    let registry = Arc::new(open_registry(args.simulate.as_deref(), settings.transport.clone())?);
    let mut service = Service::new(Arc::clone(&registry));
    service.set_auto_scan(settings.auto_scan);
    service.set_exit_on_error(args.exit_on_error);

    if !settings.devices.is_empty() {
        let Some(target) = &target else {
            bail!("Forced devices need --serial or --tcp");
        };
        for forced in &settings.devices {
            let entry = table.find_model(&forced.model)?;
            let spec = forced_spec(target, &table, forced.unit, forced.rate.or(args.rate))?;
            service.add_device(entry.create(spec));
        }
    }

    if !args.probe.is_empty() {
        let probe = ModelProbe::new(Arc::clone(&table)).with_timeout(settings.scanner.probe_timeout());
        let found = probe
            .probe_specs(&registry, &args.probe, |spec, device| {
                if device.is_none() {
                    info!("Nothing found at {}", spec);
                }
            })
            .await;
        for device in found {
            service.add_device(device);
        }
    }

    if let Some(target) = target {
        let scanner = Scanner::with_config(
            target,
            Arc::clone(&table),
            Arc::clone(&registry),
            settings.scanner.clone(),
        );
        service = service.with_scanner(scanner);
        if args.force_scan || args.full || service.is_empty() {
            service.start_scan(args.full);
        }
    }

    service.run(shutdown_signal()).await
}
