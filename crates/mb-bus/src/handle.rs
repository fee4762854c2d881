//! Shared transport handles
//!
//! A [`TransportHandle`] wraps one open client link. Any number of devices
//! may hold it; each holder accounts for itself with [`retain`] and
//! [`release`]. Requests go through [`execute`], which serializes callers in
//! arrival order and tracks the transaction so that a release arriving
//! mid-request defers the close until the request has finished.
//!
//! # Lifecycle
//! ```text
//! Connected --release to 0, idle--------------> Closed
//! Connected --release to 0, in transaction----> Closing
//! Closing   --last transaction ends-----------> Closed
//! Closing   --retain--------------------------> Connected
//! any       --I/O failure---------------------> Closed
//! ```
//!
//! Closed handles are dropped from the registry, so the next acquire of the
//! endpoint opens a fresh connection.
//!
//! [`retain`]: TransportHandle::retain
//! [`release`]: TransportHandle::release
//! [`execute`]: TransportHandle::execute

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::client::{BusClient, Request, Response};
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::BusError;
use crate::registry::RegistryShared;
use crate::TransportConfig;

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Link open and held
    Connected,
    /// No holders left; closes when the running transaction ends
    Closing,
    /// Link dropped; the handle is no longer usable
    Closed,
}

/// Point-in-time view of a handle's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStatus {
    pub state: HandleState,
    pub refcount: usize,
    /// Transactions running or waiting for the link
    pub in_flight: usize,
    /// Whether the underlying link is still open
    pub connected: bool,
}

impl HandleStatus {
    pub fn in_transaction(&self) -> bool {
        self.in_flight > 0
    }
}

#[derive(Debug)]
struct Bookkeeping {
    state: HandleState,
    refcount: usize,
    in_flight: usize,
    connected: bool,
}

/// A reference-counted, lock-guarded bus connection
pub struct TransportHandle {
    /// Distinguishes successive handles for the same endpoint
    serial: u64,
    endpoint: Endpoint,
    config: TransportConfig,
    link: AsyncMutex<Option<Box<dyn BusClient>>>,
    book: Mutex<Bookkeeping>,
    registry: Weak<RegistryShared>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("endpoint", &self.endpoint)
            .field("serial", &self.serial)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Wrap a freshly opened link; the creator holds the first reference
    pub(crate) fn new(
        serial: u64,
        endpoint: Endpoint,
        config: TransportConfig,
        client: Box<dyn BusClient>,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            serial,
            endpoint,
            config,
            link: AsyncMutex::new(Some(client)),
            book: Mutex::new(Bookkeeping {
                state: HandleState::Connected,
                refcount: 1,
                in_flight: 0,
                connected: true,
            }),
            registry,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Endpoint (with line settings) this handle was opened for
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn status(&self) -> HandleStatus {
        let book = self.book();
        HandleStatus {
            state: book.state,
            refcount: book.refcount,
            in_flight: book.in_flight,
            connected: book.connected,
        }
    }

    pub fn state(&self) -> HandleState {
        self.book().state
    }

    pub fn refcount(&self) -> usize {
        self.book().refcount
    }

    pub fn is_closed(&self) -> bool {
        self.state() == HandleState::Closed
    }

    /// Take another reference to this handle
    ///
    /// A handle that is closing is revived; a closed handle stays closed and
    /// every request on it fails with [`BusError::Closed`].
    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        let mut book = self.book();
        book.refcount += 1;
        if book.state == HandleState::Closing {
            debug!("Transport {} revived", self.endpoint);
            book.state = HandleState::Connected;
        }
        Arc::clone(self)
    }

    /// Retain unless already closed (used by the registry)
    pub(crate) fn try_retain(self: &Arc<Self>) -> Option<Arc<Self>> {
        if self.book().state == HandleState::Closed {
            return None;
        }
        Some(self.retain())
    }

    /// Drop one reference
    ///
    /// At zero references the link is closed at once, or, if a transaction
    /// is running, as soon as the last one finishes. Releasing more often
    /// than retaining is logged and ignored.
    pub fn release(&self) {
        let close_now = {
            let mut book = self.book();
            if book.refcount == 0 {
                warn!("Transport {} released more often than retained", self.endpoint);
                return;
            }
            book.refcount -= 1;

            if book.refcount > 0 || book.state == HandleState::Closed {
                false
            } else if book.in_flight > 0 {
                debug!("Transport {} closing after current transaction", self.endpoint);
                book.state = HandleState::Closing;
                false
            } else {
                book.state = HandleState::Closed;
                true
            }
        };

        if close_now {
            self.shutdown();
        }
    }

    /// Perform one request under the transport lock
    ///
    /// Concurrent callers are served one at a time in call order. A response
    /// timeout is reported as [`BusError::Timeout`] and leaves the handle
    /// usable; an I/O failure closes the handle and removes it from the
    /// registry.
    pub async fn execute(&self, request: Request) -> Result<Response, BusError> {
        let transaction = Transaction::begin(self)?;
        let result = self.transact(&request).await;
        drop(transaction);
        result
    }

    async fn transact(&self, request: &Request) -> Result<Response, BusError> {
        let mut link = self.link.lock().await;
        let client = match link.as_mut() {
            Some(client) => client,
            None => return Err(BusError::Closed(self.id())),
        };

        let limit = request.timeout.unwrap_or_else(|| self.config.timeout());
        trace!("{} unit {}: {:?}", self.endpoint, request.unit, request.operation);

        let outcome = timeout(limit, client.call(request)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let fatal = e.is_fatal();
                let error = BusError::from_link(e, &self.id(), request.unit);
                if fatal {
                    warn!("Transport {} failed: {}", self.endpoint, error);
                    link.take();
                    self.mark_broken();
                }
                Err(error)
            }
            Err(_) => Err(BusError::Timeout {
                endpoint: self.id(),
                unit: request.unit,
                timeout: limit,
            }),
        }
    }

    /// Close after a failure while the link lock is held
    fn mark_broken(&self) {
        {
            let mut book = self.book();
            book.state = HandleState::Closed;
            book.connected = false;
        }
        self.deregister();
    }

    /// Drop the link of a handle that just became closed
    fn shutdown(&self) {
        match self.link.try_lock() {
            Ok(mut link) => {
                link.take();
                self.book().connected = false;
                info!("Closed transport {}", self.endpoint);
            }
            // Only possible if a cancelled request still holds the lock;
            // the link goes away with the last Arc instead.
            Err(_) => debug!("Transport {} busy at close", self.endpoint),
        }
        self.deregister();
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id(), self.serial);
        }
    }

    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a transaction in flight for as long as it lives
///
/// Dropping it (normally or because the request future was cancelled)
/// completes any close deferred by a release during the transaction.
struct Transaction<'a> {
    handle: &'a TransportHandle,
}

impl<'a> Transaction<'a> {
    fn begin(handle: &'a TransportHandle) -> Result<Self, BusError> {
        let mut book = handle.book();
        if book.state == HandleState::Closed {
            return Err(BusError::Closed(handle.id()));
        }
        book.in_flight += 1;
        Ok(Self { handle })
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let close_now = {
            let mut book = self.handle.book();
            book.in_flight = book.in_flight.saturating_sub(1);
            if book.in_flight == 0 && book.refcount == 0 && book.state == HandleState::Closing {
                book.state = HandleState::Closed;
                true
            } else {
                false
            }
        };

        if close_now {
            self.handle.shutdown();
        }
    }
}
