//! Background bus scanning
//!
//! A [`Scanner`] sweeps one bus for devices on a background task. The owner
//! polls [`running`], [`done`] and [`total`] for progress and drains found
//! devices with [`get_devices`] whenever convenient.
//!
//! # Sweep Order
//!
//! The quick sweep tries the default units of every registered signature at
//! each candidate line rate in turn, and stops trying rates as soon as one
//! produces a device. The optional full sweep then tries every remaining unit
//! address (1-247) at the rates that worked, or at all rates if the quick
//! sweep found nothing. A device configured for a rate that was never tried
//! after the first success is therefore not found.
//!
//! [`running`]: Scanner::running
//! [`done`]: Scanner::done
//! [`total`]: Scanner::total
//! [`get_devices`]: Scanner::get_devices

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mb_bus::{BusMode, Endpoint, TransportHandle, TransportRegistry};
use mb_register::{UNIT_MAX, UNIT_MIN};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::probe::{ModelProbe, ProbeOutcome};
use crate::signature::{ModelTable, UnitScope};
use crate::spec::DeviceSpec;

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Response timeout per probe (milliseconds)
    pub probe_timeout_ms: u64,
    /// Pause before each candidate once a serial device was found (milliseconds)
    pub settle_delay_ms: u64,
    /// Line rates to try, in order (empty = rates of the registered signatures)
    pub rates: Vec<u32>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 100,
            settle_delay_ms: 1000,
            rates: Vec::new(),
        }
    }
}

impl ScannerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// The bus a scanner sweeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Serial { path: String, mode: BusMode },
    Tcp { host: String, port: u16 },
}

impl ScanTarget {
    pub fn serial(path: impl Into<String>) -> Self {
        ScanTarget::Serial {
            path: path.into(),
            mode: BusMode::Rtu,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ScanTarget::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn mode(&self) -> BusMode {
        match self {
            ScanTarget::Serial { mode, .. } => *mode,
            ScanTarget::Tcp { .. } => BusMode::Tcp,
        }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, ScanTarget::Serial { .. })
    }

    /// Endpoint at `rate` (ignored for TCP)
    fn endpoint(&self, rate: u32) -> Endpoint {
        match self {
            ScanTarget::Serial { path, mode } => Endpoint::serial(path.clone(), rate, *mode),
            ScanTarget::Tcp { host, port } => Endpoint::tcp(host.clone(), *port),
        }
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanTarget::Serial { path, .. } => f.write_str(path),
            ScanTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Scan lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
    Stopped,
    Completed,
}

#[derive(Debug)]
struct ScanProgress {
    state: ScanState,
    /// Increments on every start so a stale sweep cannot touch a new one
    generation: u64,
    total: usize,
    done: usize,
    num_found: usize,
    devices: Vec<Box<dyn Device>>,
    started: Option<Instant>,
}

#[derive(Debug)]
struct ScanShared {
    progress: Mutex<ScanProgress>,
    wake: Notify,
}

impl ScanShared {
    fn progress(&self) -> MutexGuard<'_, ScanProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Raised inside a sweep once it has been stopped or superseded
#[derive(Debug)]
struct ScanAborted;

/// Background discovery on one bus
pub struct Scanner {
    target: ScanTarget,
    probe: ModelProbe,
    registry: Arc<TransportRegistry>,
    config: ScannerConfig,
    shared: Arc<ScanShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Create a scanner with default configuration
    pub fn new(target: ScanTarget, table: Arc<ModelTable>, registry: Arc<TransportRegistry>) -> Self {
        Self::with_config(target, table, registry, ScannerConfig::default())
    }

    /// Create a scanner with custom configuration
    pub fn with_config(
        target: ScanTarget,
        table: Arc<ModelTable>,
        registry: Arc<TransportRegistry>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            target,
            probe: ModelProbe::new(table).with_timeout(config.probe_timeout()),
            registry,
            config,
            shared: Arc::new(ScanShared {
                progress: Mutex::new(ScanProgress {
                    state: ScanState::Idle,
                    generation: 0,
                    total: 0,
                    done: 0,
                    num_found: 0,
                    devices: Vec::new(),
                    started: None,
                }),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    /// Start a sweep in the background
    ///
    /// Returns `false` (and does nothing) if a sweep is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, full: bool) -> bool {
        let plan = SweepPlan::new(&self.target, self.probe.table(), &self.config);

        let generation = {
            let mut progress = self.shared.progress();
            if progress.state == ScanState::Running {
                return false;
            }
            progress.state = ScanState::Running;
            progress.generation += 1;
            progress.total = plan.quick_total();
            if full && self.target.is_serial() {
                progress.total += plan.full_total();
            }
            progress.done = 0;
            progress.num_found = 0;
            progress.started = Some(Instant::now());
            progress.generation
        };

        let sweep = Sweep {
            target: self.target.clone(),
            probe: self.probe.clone(),
            registry: Arc::clone(&self.registry),
            settle_delay: self.config.settle_delay(),
            shared: Arc::clone(&self.shared),
            generation,
            plan,
            full,
        };

        let task = tokio::spawn(sweep.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        true
    }

    /// Stop the running sweep
    ///
    /// The probe in flight finishes; no further candidate is started.
    pub fn stop(&self) {
        let mut progress = self.shared.progress();
        if progress.state == ScanState::Running {
            progress.state = ScanState::Stopped;
            drop(progress);
            self.shared.wake.notify_waiters();
        }
    }

    /// Take every device found since the last call
    pub fn get_devices(&self) -> Vec<Box<dyn Device>> {
        std::mem::take(&mut self.shared.progress().devices)
    }

    pub fn running(&self) -> bool {
        self.state() == ScanState::Running
    }

    pub fn state(&self) -> ScanState {
        self.shared.progress().state
    }

    /// Candidates probed (or skipped) so far
    pub fn done(&self) -> usize {
        self.shared.progress().done
    }

    /// Candidates in the sweep, fixed at start
    ///
    /// A full sweep counts every unit at every rate; candidates it turns
    /// out not to need are credited to `done` when the full phase begins.
    pub fn total(&self) -> usize {
        self.shared.progress().total
    }

    /// Devices found by the current or last sweep
    pub fn num_found(&self) -> usize {
        self.shared.progress().num_found
    }

    /// Time since the current or last sweep started
    pub fn elapsed(&self) -> Option<Duration> {
        self.shared.progress().started.map(|t| t.elapsed())
    }

    /// Wait for the background task to exit
    pub async fn wait(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Scan task for {} failed: {}", self.target, e);
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Units and rates of a sweep, fixed at start
#[derive(Debug, Clone)]
struct SweepPlan {
    units: Vec<u8>,
    rates: Vec<u32>,
}

impl SweepPlan {
    fn new(target: &ScanTarget, table: &ModelTable, config: &ScannerConfig) -> Self {
        let mode = target.mode();
        let rates = if !target.is_serial() {
            // One pass; the rate is meaningless on TCP
            vec![0]
        } else if config.rates.is_empty() {
            table.rates(mode)
        } else {
            config.rates.clone()
        };
        Self {
            units: table.units(mode),
            rates,
        }
    }

    fn quick_total(&self) -> usize {
        self.units.len() * self.rates.len()
    }

    /// Upper bound of the full phase
    fn full_total(&self) -> usize {
        (UNIT_MIN..=UNIT_MAX).count() * self.rates.len()
    }
}

/// Releases the probing transport however the sweep ends
struct Held(Arc<TransportHandle>);

impl Drop for Held {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// One sweep, owned by the background task
struct Sweep {
    target: ScanTarget,
    probe: ModelProbe,
    registry: Arc<TransportRegistry>,
    settle_delay: Duration,
    shared: Arc<ScanShared>,
    generation: u64,
    plan: SweepPlan,
    full: bool,
}

impl Sweep {
    async fn run(self) {
        let t0 = Instant::now();
        let result = self.scan().await;

        let mut progress = self.shared.progress();
        if progress.generation != self.generation {
            return;
        }
        match (result, progress.state) {
            (Ok(()), ScanState::Running) => {
                progress.state = ScanState::Completed;
                info!(
                    "Scan of {} completed in {} seconds, {} device(s) found",
                    self.target,
                    t0.elapsed().as_secs(),
                    progress.num_found
                );
            }
            _ => {
                if progress.state == ScanState::Running {
                    progress.state = ScanState::Stopped;
                }
                info!("Scan of {} aborted", self.target);
            }
        }
    }

    async fn scan(&self) -> Result<(), ScanAborted> {
        let units = &self.plan.units;
        let rates = &self.plan.rates;
        let mut found_units = Vec::new();
        let mut good_rates = rates.clone();

        for (i, &rate) in rates.iter().enumerate() {
            if self.target.is_serial() {
                info!("Scanning {} @ {} bps (quick)", self.target, rate);
            } else {
                info!("Scanning {} (quick)", self.target);
            }
            let found = self.scan_units(units, rate, UnitScope::Known).await?;
            if !found.is_empty() {
                let skipped = units.len() * (rates.len() - i - 1);
                self.advance(skipped, None)?;
                good_rates = vec![rate];
                found_units = found;
                break;
            }
        }

        if !self.full {
            return Ok(());
        }
        if !self.target.is_serial() {
            debug!("Full sweep not supported on {}", self.target);
            return Ok(());
        }

        let rest: Vec<u8> = (UNIT_MIN..=UNIT_MAX)
            .filter(|u| !found_units.contains(u))
            .collect();
        let unneeded = self.plan.full_total() - rest.len() * good_rates.len();
        self.advance(unneeded, None)?;

        for rate in good_rates {
            info!("Scanning {} @ {} bps (full)", self.target, rate);
            self.scan_units(&rest, rate, UnitScope::Any).await?;
        }
        Ok(())
    }

    /// Probe `units` at one rate; returns the units that answered
    async fn scan_units(
        &self,
        units: &[u8],
        rate: u32,
        scope: UnitScope,
    ) -> Result<Vec<u8>, ScanAborted> {
        let endpoint = self.target.endpoint(rate);
        let mut found = Vec::new();
        let mut held: Option<Held> = None;

        for (i, &unit) in units.iter().enumerate() {
            self.check()?;
            if self.target.is_serial() && self.num_found() > 0 {
                self.settle().await?;
            }

            let reusable = held
                .as_ref()
                .map(|h| Arc::clone(&h.0))
                .filter(|h| !h.is_closed());
            let handle = match reusable {
                Some(handle) => handle,
                None => {
                    held = None;
                    match self.registry.acquire(&endpoint).await {
                        Ok(handle) => {
                            held = Some(Held(Arc::clone(&handle)));
                            handle
                        }
                        Err(e) => {
                            // Port busy at another rate, or gone: skip this rate
                            warn!("Skipping {}: {}", endpoint, e);
                            self.advance(units.len() - i, None)?;
                            return Ok(found);
                        }
                    }
                }
            };

            let spec = DeviceSpec::new(endpoint.clone(), unit);
            let device = match self.probe.probe(&spec, &handle, scope).await {
                ProbeOutcome::Found(device) => {
                    info!("Found {} at {}", device.model(), spec);
                    found.push(unit);
                    Some(device)
                }
                ProbeOutcome::NotFound(reason) => {
                    debug!("Nothing at {} ({:?})", spec, reason);
                    None
                }
            };
            self.advance(1, device)?;
        }

        Ok(found)
    }

    /// Record progress, then abort if the sweep was stopped
    fn advance(&self, n: usize, device: Option<Box<dyn Device>>) -> Result<(), ScanAborted> {
        let mut progress = self.shared.progress();
        if progress.generation != self.generation {
            return Err(ScanAborted);
        }
        progress.done += n;
        if let Some(device) = device {
            progress.num_found += 1;
            progress.devices.push(device);
        }
        if progress.state != ScanState::Running {
            return Err(ScanAborted);
        }
        Ok(())
    }

    fn check(&self) -> Result<(), ScanAborted> {
        let progress = self.shared.progress();
        if progress.generation == self.generation && progress.state == ScanState::Running {
            Ok(())
        } else {
            Err(ScanAborted)
        }
    }

    fn num_found(&self) -> usize {
        self.shared.progress().num_found
    }

    /// Give a freshly found device time to settle; cut short by `stop`
    async fn settle(&self) -> Result<(), ScanAborted> {
        let woken = self.shared.wake.notified();
        tokio::pin!(woken);
        // Register before re-checking so a stop in between is not missed
        woken.as_mut().enable();
        self.check()?;

        tokio::select! {
            _ = tokio::time::sleep(self.settle_delay) => {}
            _ = &mut woken => {}
        }
        self.check()
    }
}
