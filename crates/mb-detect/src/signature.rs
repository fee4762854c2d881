//! Model signatures
//!
//! A signature is one register that identifies a family of devices: read it,
//! look the value up in the signature's model map, and the entry found says
//! which model answered and how to construct it. Filters restrict where a
//! signature is tried (bus modes, line rates, the unit addresses its models
//! ship with).
//!
//! Signatures live in a [`ModelTable`]. Registration order matters: it is the
//! order in which signatures are tried on a candidate and the order in which
//! the scanner tries line rates.

use std::fmt;

use mb_bus::BusMode;
use mb_register::{RegisterDescriptor, Value};

use crate::device::Device;
use crate::error::DetectError;
use crate::spec::DeviceSpec;

/// Builds a device for a spec and model name
pub type DeviceFactory = fn(DeviceSpec, &str) -> Box<dyn Device>;

/// One model recognised by a signature
#[derive(Clone)]
pub struct ModelEntry {
    pub name: String,
    pub factory: DeviceFactory,
}

impl ModelEntry {
    pub fn create(&self, spec: DeviceSpec) -> Box<dyn Device> {
        (self.factory)(spec, &self.name)
    }
}

impl fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelEntry").field("name", &self.name).finish()
    }
}

/// Which unit addresses a signature applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitScope {
    /// Only the units the signature's models ship with (quick scan)
    Known,
    /// Any unit (full sweep, explicit probes)
    Any,
}

/// An identifying register and the models it distinguishes
#[derive(Debug, Clone)]
pub struct ModelSignature {
    pub register: RegisterDescriptor,
    models: Vec<(i64, ModelEntry)>,
    /// Allowed bus modes (empty = any)
    pub modes: Vec<BusMode>,
    /// Default unit addresses
    pub units: Vec<u8>,
    /// Allowed line rates (empty = any)
    pub rates: Vec<u32>,
}

impl ModelSignature {
    pub fn new(register: RegisterDescriptor) -> Self {
        Self {
            register,
            models: Vec::new(),
            modes: Vec::new(),
            units: Vec::new(),
            rates: Vec::new(),
        }
    }

    /// Map a signature value to a model
    pub fn with_model(mut self, value: i64, name: impl Into<String>, factory: DeviceFactory) -> Self {
        self.models.push((
            value,
            ModelEntry {
                name: name.into(),
                factory,
            },
        ));
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = BusMode>) -> Self {
        self.modes = modes.into_iter().collect();
        self
    }

    pub fn with_units(mut self, units: impl IntoIterator<Item = u8>) -> Self {
        self.units = units.into_iter().collect();
        self
    }

    pub fn with_rates(mut self, rates: impl IntoIterator<Item = u32>) -> Self {
        self.rates = rates.into_iter().collect();
        self
    }

    pub fn models(&self) -> impl Iterator<Item = (i64, &ModelEntry)> {
        self.models.iter().map(|(v, e)| (*v, e))
    }

    pub fn supports_mode(&self, mode: BusMode) -> bool {
        self.modes.is_empty() || self.modes.contains(&mode)
    }

    /// Whether the signature should be tried on `spec`
    pub fn applies_to(&self, spec: &DeviceSpec, scope: UnitScope) -> bool {
        if !self.supports_mode(spec.mode()) {
            return false;
        }
        if let Some(rate) = spec.baud_rate() {
            if !self.rates.is_empty() && !self.rates.contains(&rate) {
                return false;
            }
        }
        match scope {
            UnitScope::Known => self.units.contains(&spec.unit),
            UnitScope::Any => true,
        }
    }

    /// The model whose signature value equals `value`
    pub fn lookup(&self, value: &Value) -> Option<&ModelEntry> {
        let raw = value.as_i64()?;
        self.models.iter().find(|(v, _)| *v == raw).map(|(_, e)| e)
    }
}

/// Registered signatures, in registration order
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    signatures: Vec<ModelSignature>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signature; earlier registrations are tried first
    pub fn register(&mut self, signature: ModelSignature) {
        self.signatures.push(signature);
    }

    pub fn signatures(&self) -> &[ModelSignature] {
        &self.signatures
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Default units of all signatures usable in `mode`, first-seen order
    pub fn units(&self, mode: BusMode) -> Vec<u8> {
        let mut units = Vec::new();
        for sig in self.signatures.iter().filter(|s| s.supports_mode(mode)) {
            for unit in &sig.units {
                if !units.contains(unit) {
                    units.push(*unit);
                }
            }
        }
        units
    }

    /// Line rates of all signatures usable in `mode`, first-seen order
    pub fn rates(&self, mode: BusMode) -> Vec<u32> {
        let mut rates = Vec::new();
        for sig in self.signatures.iter().filter(|s| s.supports_mode(mode)) {
            for rate in &sig.rates {
                if !rates.contains(rate) {
                    rates.push(*rate);
                }
            }
        }
        rates
    }

    /// Find a model by name (case-insensitive)
    pub fn find_model(&self, name: &str) -> Result<&ModelEntry, DetectError> {
        self.signatures
            .iter()
            .flat_map(|s| s.models.iter().map(|(_, e)| e))
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DetectError::UnknownModel(name.to_string()))
    }

    /// Every registered model with the signature that recognises it
    pub fn models(&self) -> Vec<(&ModelEntry, &ModelSignature)> {
        self.signatures
            .iter()
            .flat_map(|s| s.models.iter().map(move |(_, e)| (e, s)))
            .collect()
    }
}
