//! Model probing
//!
//! Probing reads the signature registers that apply to a candidate spec, in
//! registration order, and constructs the first model whose signature value
//! matches. An empty bus address is the normal case, so "not found" is an
//! outcome rather than an error; the reason is kept for logging.
//!
//! Probing never writes to the device.

use std::sync::Arc;
use std::time::Duration;

use mb_bus::{BusError, RegisterCoder, TransportHandle, TransportRegistry};
use tracing::{debug, info, trace};

use crate::device::Device;
use crate::signature::{ModelTable, UnitScope};
use crate::spec::DeviceSpec;

/// Default response timeout while probing
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a probe found nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absence {
    /// No signature applies to the spec's mode, rate or unit
    NotApplicable,
    /// Nothing answered within the timeout
    NoResponse,
    /// Something answered, but no signature value matched
    Mismatch,
    /// The transport failed
    TransportFailure,
}

impl Absence {
    /// Rank used to report the most informative reason
    fn weight(&self) -> u8 {
        match self {
            Absence::NotApplicable => 0,
            Absence::NoResponse => 1,
            Absence::TransportFailure => 2,
            Absence::Mismatch => 3,
        }
    }
}

/// Result of probing one spec
#[derive(Debug)]
pub enum ProbeOutcome {
    Found(Box<dyn Device>),
    NotFound(Absence),
}

impl ProbeOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, ProbeOutcome::Found(_))
    }

    pub fn into_device(self) -> Option<Box<dyn Device>> {
        match self {
            ProbeOutcome::Found(device) => Some(device),
            ProbeOutcome::NotFound(_) => None,
        }
    }
}

/// Identifies devices by their signature registers
#[derive(Debug, Clone)]
pub struct ModelProbe {
    table: Arc<ModelTable>,
    timeout: Duration,
}

impl ModelProbe {
    /// Create a probe with the default timeout
    pub fn new(table: Arc<ModelTable>) -> Self {
        Self {
            table,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn table(&self) -> &ModelTable {
        &self.table
    }

    /// Probe `spec` over an already acquired transport
    pub async fn probe(
        &self,
        spec: &DeviceSpec,
        handle: &TransportHandle,
        scope: UnitScope,
    ) -> ProbeOutcome {
        let mut absence = Absence::NotApplicable;

        for sig in self.table.signatures() {
            if !sig.applies_to(spec, scope) {
                continue;
            }

            let mut coder = RegisterCoder::new().with_timeout(self.timeout);
            let reason = match coder.read_one(handle, spec.unit, &sig.register).await {
                Ok(value) => match sig.lookup(&value) {
                    Some(entry) => {
                        debug!("{}: signature {} = {} -> {}", spec, sig.register.address, value, entry.name);
                        return ProbeOutcome::Found(entry.create(spec.clone()));
                    }
                    None => {
                        trace!("{}: signature {} = {} matches no model", spec, sig.register.address, value);
                        Absence::Mismatch
                    }
                },
                Err(BusError::Timeout { .. }) => Absence::NoResponse,
                Err(e) if e.is_transport() => {
                    debug!("{}: transport failed while probing: {}", spec, e);
                    Absence::TransportFailure
                }
                Err(e) => {
                    trace!("{}: signature {} unreadable: {}", spec, sig.register.address, e);
                    Absence::Mismatch
                }
            };

            if reason.weight() > absence.weight() {
                absence = reason;
            }
            if reason == Absence::TransportFailure {
                break;
            }
        }

        trace!("{}: not found ({:?})", spec, absence);
        ProbeOutcome::NotFound(absence)
    }

    /// Probe a list of explicit specs, acquiring transports as needed
    ///
    /// Signatures are tried regardless of their default units. `progress`
    /// is called once per spec with the device found, if any.
    pub async fn probe_specs<F>(
        &self,
        registry: &TransportRegistry,
        specs: &[DeviceSpec],
        mut progress: F,
    ) -> Vec<Box<dyn Device>>
    where
        F: FnMut(&DeviceSpec, Option<&dyn Device>),
    {
        let mut found = Vec::new();

        for spec in specs {
            let outcome = match registry.acquire(&spec.endpoint).await {
                Ok(handle) => {
                    let outcome = self.probe(spec, &handle, UnitScope::Any).await;
                    handle.release();
                    outcome
                }
                Err(e) => {
                    info!("Cannot probe {}: {}", spec, e);
                    ProbeOutcome::NotFound(Absence::TransportFailure)
                }
            };

            match outcome.into_device() {
                Some(device) => {
                    info!("Found {} at {}", device.model(), spec);
                    progress(spec, Some(device.as_ref()));
                    found.push(device);
                }
                None => progress(spec, None),
            }
        }

        found
    }
}
