//! Endpoint registry
//!
//! The registry makes sure each physical endpoint has at most one open
//! connection. Acquiring an endpoint that is already open returns the same
//! handle with its reference count raised, provided the caller asks for the
//! same line settings. A mismatch is a configuration error and leaves the
//! open handle untouched.
//!
//! Opening is serialized per endpoint: two callers racing for one port get
//! one connection, while a slow open on one port never delays another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::client::Connector;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::BusError;
use crate::handle::TransportHandle;
use crate::modbus::ModbusConnector;
use crate::TransportConfig;

/// Registry state shared with handles so they can deregister on close
#[derive(Debug, Default)]
pub(crate) struct RegistryShared {
    entries: Mutex<HashMap<EndpointId, Arc<TransportHandle>>>,
}

impl RegistryShared {
    fn entries(&self) -> MutexGuard<'_, HashMap<EndpointId, Arc<TransportHandle>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `id` if it still maps to the handle with this serial
    pub(crate) fn remove(&self, id: &EndpointId, serial: u64) {
        let mut entries = self.entries();
        if entries.get(id).is_some_and(|h| h.serial() == serial) {
            entries.remove(id);
            debug!("Transport {} deregistered", id);
        }
    }
}

/// Process-wide table of open transports
pub struct TransportRegistry {
    shared: Arc<RegistryShared>,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    /// One gate per endpoint so an endpoint is never opened twice
    open_gates: Mutex<HashMap<EndpointId, Arc<AsyncMutex<()>>>>,
    next_serial: AtomicU64,
}

impl TransportRegistry {
    /// Create a registry that opens links with `connector`
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared::default()),
            connector,
            config,
            open_gates: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Create a registry backed by real serial ports and TCP sockets
    pub fn with_config(config: TransportConfig) -> Self {
        Self::new(Arc::new(ModbusConnector), config)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Get a handle to `endpoint`, opening it if nobody holds it yet
    ///
    /// The caller owns one reference and must [`release`] it when done.
    ///
    /// [`release`]: TransportHandle::release
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<Arc<TransportHandle>, BusError> {
        if let Some(handle) = self.lookup(endpoint)? {
            return Ok(handle);
        }

        let id = endpoint.id();
        let gate = self.open_gate(&id);
        let _open = gate.lock().await;

        // Someone may have opened it while we waited
        if let Some(handle) = self.lookup(endpoint)? {
            return Ok(handle);
        }

        let client = self
            .connector
            .connect(endpoint, &self.config)
            .await
            .map_err(|source| BusError::Transport {
                endpoint: id.clone(),
                source,
            })?;

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(TransportHandle::new(
            serial,
            endpoint.clone(),
            self.config.clone(),
            client,
            Arc::downgrade(&self.shared),
        ));

        self.shared.entries().insert(id, Arc::clone(&handle));
        info!("Opened transport {}", endpoint);
        Ok(handle)
    }

    fn open_gate(&self, id: &EndpointId) -> Arc<AsyncMutex<()>> {
        let mut gates = self.open_gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(id.clone()).or_default())
    }

    /// Existing live handle for the endpoint, retained
    fn lookup(&self, endpoint: &Endpoint) -> Result<Option<Arc<TransportHandle>>, BusError> {
        let id = endpoint.id();
        let mut entries = self.shared.entries();

        let Some(handle) = entries.get(&id) else {
            return Ok(None);
        };

        if let Some(reason) = handle.endpoint().conflict(endpoint) {
            return Err(BusError::Configuration {
                endpoint: id,
                reason,
            });
        }

        match handle.try_retain() {
            Some(handle) => Ok(Some(handle)),
            None => {
                entries.remove(&id);
                Ok(None)
            }
        }
    }

    /// The open handle for `id`, if any (not retained)
    pub fn get(&self, id: &EndpointId) -> Option<Arc<TransportHandle>> {
        self.shared.entries().get(id).cloned()
    }

    /// Endpoints with an open handle
    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.shared.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("endpoints", &self.endpoints())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
