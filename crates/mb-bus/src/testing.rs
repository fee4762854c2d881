//! In-memory bus for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{BusClient, Connector, Operation, Request, Response};
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::LinkError;
use crate::TransportConfig;

#[derive(Debug, Clone, Default)]
pub struct FakeUnit {
    registers: HashMap<u16, u16>,
    truncate: Option<usize>,
}

impl FakeUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_register(mut self, address: u16, value: u16) -> Self {
        self.registers.insert(address, value);
        self
    }

    pub fn with_registers(mut self, address: u16, values: &[u16]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.registers.insert(address + i as u16, *v);
        }
        self
    }

    /// Answer every read with at most `words` registers
    pub fn truncate_reads(mut self, words: usize) -> Self {
        self.truncate = Some(words);
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    units: HashMap<(u32, u8), FakeUnit>,
    calls: Vec<Request>,
    connects: usize,
    open_links: usize,
    latency: Duration,
    connect_delays: HashMap<EndpointId, Duration>,
    fail_next: bool,
    refuse: bool,
}

/// Records calls and panics if two ever overlap
#[derive(Debug, Clone, Default)]
pub struct FakeBus {
    state: Arc<Mutex<FakeState>>,
    busy: Arc<AtomicBool>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_unit(&self, baud_rate: u32, unit: u8, fake: FakeUnit) {
        self.state().units.insert((baud_rate, unit), fake);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Make opening `endpoint` take `delay`
    pub fn delay_connect(&self, endpoint: &Endpoint, delay: Duration) {
        self.state().connect_delays.insert(endpoint.id(), delay);
    }

    pub fn fail_next_call(&self) {
        self.state().fail_next = true;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse = refuse;
    }

    pub fn calls(&self) -> Vec<Request> {
        self.state().calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn open_links(&self) -> usize {
        self.state().open_links
    }

    pub fn register(&self, baud_rate: u32, unit: u8, address: u16) -> Option<u16> {
        self.state()
            .units
            .get(&(baud_rate, unit))
            .and_then(|u| u.registers.get(&address).copied())
    }
}

#[async_trait]
impl Connector for FakeBus {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _config: &TransportConfig,
    ) -> Result<Box<dyn BusClient>, LinkError> {
        let delay = self.state().connect_delays.get(&endpoint.id()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.refuse {
            return Err(LinkError::Open(format!("{}: refused", endpoint)));
        }
        state.connects += 1;
        state.open_links += 1;
        Ok(Box::new(FakeClient {
            bus: self.clone(),
            baud_rate: endpoint.baud_rate().unwrap_or(0),
        }))
    }
}

#[derive(Debug)]
struct FakeClient {
    bus: FakeBus,
    baud_rate: u32,
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        self.bus.state().open_links -= 1;
    }
}

struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusClient for FakeClient {
    async fn call(&mut self, request: &Request) -> Result<Response, LinkError> {
        assert!(
            !self.bus.busy.swap(true, Ordering::SeqCst),
            "overlapping calls on one link"
        );
        let _busy = Busy(&self.bus.busy);

        let (latency, fail) = {
            let mut state = self.bus.state();
            state.calls.push(request.clone());
            (state.latency, std::mem::take(&mut state.fail_next))
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(LinkError::Io(std::io::Error::other("fake line failure")));
        }

        let response = {
            let mut state = self.bus.state();
            state
                .units
                .get_mut(&(self.baud_rate, request.unit))
                .map(|unit| apply(unit, &request.operation))
        };

        match response {
            Some(response) => Ok(response),
            None => std::future::pending().await,
        }
    }
}

fn apply(unit: &mut FakeUnit, operation: &Operation) -> Response {
    match operation {
        Operation::ReadHolding { address, count } | Operation::ReadInput { address, count } => {
            let mut words: Vec<u16> = (0..*count)
                .map(|i| unit.registers.get(&(address + i)).copied().unwrap_or(0))
                .collect();
            if let Some(n) = unit.truncate {
                words.truncate(n);
            }
            Response::Registers(words)
        }
        Operation::WriteSingle { address, value } => {
            unit.registers.insert(*address, *value);
            Response::Written
        }
        Operation::WriteMultiple { address, values } => {
            for (i, v) in values.iter().enumerate() {
                unit.registers.insert(address + i as u16, *v);
            }
            Response::Written
        }
    }
}
