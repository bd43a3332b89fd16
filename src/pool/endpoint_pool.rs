//! Ordered endpoints with lazily connected holders and failover selection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::holder::{ConnectionHolder, OpenMode};
use crate::error::{AttemptError, BrokerError, Error, Result};
use crate::transport::Transport;
use crate::types::{BrokerEndpoint, MessagingConfig, SelectionPolicy};

const NO_STICKY: usize = usize::MAX;

/// One endpoint and its (possibly absent) holder.
struct Slot {
    endpoint: Arc<BrokerEndpoint>,
    holder: RwLock<Option<Arc<ConnectionHolder>>>,
    connect_lock: AsyncMutex<()>,
    last_failure: Mutex<Option<DateTime<Utc>>>,
}

impl Slot {
    fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            holder: RwLock::new(None),
            connect_lock: AsyncMutex::new(()),
            last_failure: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Arc<ConnectionHolder>> {
        self.holder
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace(&self, holder: Option<Arc<ConnectionHolder>>) -> Option<Arc<ConnectionHolder>> {
        let mut slot = self.holder.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, holder)
    }

    /// Take the holder out only if it is still `expected`.
    fn take_if(&self, expected: &Arc<ConnectionHolder>) -> Option<Arc<ConnectionHolder>> {
        let mut slot = self.holder.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, expected) => slot.take(),
            _ => None,
        }
    }

    fn mark_failed(&self) {
        *self.last_failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
    }

    fn last_failure(&self) -> Option<DateTime<Utc>> {
        *self.last_failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connection state of one endpoint, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub address: String,
    pub label: String,
    pub connected: bool,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Round-robin walk over the endpoint indices, driven by the shared counter.
///
/// The counter is reserved lazily so a sticky hit leaves it untouched, and
/// every index is handed out at most once per logical call.
struct Rotation<'a> {
    counter: &'a AtomicU64,
    len: usize,
    start: Option<u64>,
    offset: u64,
    handed_out: usize,
}

impl<'a> Rotation<'a> {
    fn new(counter: &'a AtomicU64, len: usize) -> Self {
        Self {
            counter,
            len,
            start: None,
            offset: 0,
            handed_out: 0,
        }
    }

    fn next(&mut self, tried: &[bool]) -> Option<usize> {
        while self.offset < self.len as u64 {
            let start = match self.start {
                Some(start) => start,
                None => {
                    let start = self.counter.fetch_add(1, Ordering::SeqCst);
                    self.start = Some(start);
                    start
                }
            };
            let index = ((start.wrapping_add(self.offset)) % self.len as u64) as usize;
            self.offset += 1;
            if tried[index] {
                continue;
            }
            // The reservation above paid for the first attempt
            if self.handed_out > 0 {
                self.counter.fetch_add(1, Ordering::SeqCst);
            }
            self.handed_out += 1;
            return Some(index);
        }
        None
    }
}

/// Ordered broker endpoints, each with a lazily created connection holder.
///
/// `run` walks the endpoints according to the selection policy, connecting on
/// demand, and retries retryable failures on the next endpoint until every
/// endpoint has been tried once.
pub struct EndpointPool {
    slots: Vec<Slot>,
    policy: SelectionPolicy,
    mode: OpenMode,
    transport: Arc<dyn Transport>,
    counter: AtomicU64,
    sticky: AtomicUsize,
}

impl EndpointPool {
    /// Create a pool over `endpoints`, in round-robin order.
    pub fn new(
        endpoints: Vec<BrokerEndpoint>,
        policy: SelectionPolicy,
        mode: OpenMode,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("No broker endpoints configured".to_string()));
        }
        for endpoint in &endpoints {
            endpoint.validate()?;
        }

        Ok(Self {
            slots: endpoints.into_iter().map(Slot::new).collect(),
            policy,
            mode,
            transport,
            counter: AtomicU64::new(0),
            sticky: AtomicUsize::new(NO_STICKY),
        })
    }

    /// Create a pool from validated configuration.
    pub fn from_config(config: &MessagingConfig, mode: OpenMode, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Self::new(config.endpoints.clone(), config.selection, mode, transport)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &BrokerEndpoint> {
        self.slots.iter().map(|s| s.endpoint.as_ref())
    }

    /// Index of the endpoint the sticky policy will try first, if any.
    pub fn sticky_index(&self) -> Option<usize> {
        match self.sticky.load(Ordering::SeqCst) {
            NO_STICKY => None,
            index => Some(index),
        }
    }

    /// Run `operation` against endpoints until it succeeds, fails fatally,
    /// or every endpoint has been tried once.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(Arc<ConnectionHolder>) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let len = self.slots.len();
        let mut tried = vec![false; len];
        let mut rotation = Rotation::new(&self.counter, len);
        let mut first = match self.policy {
            SelectionPolicy::Sticky => self.sticky_index().filter(|i| *i < len),
            SelectionPolicy::RoundRobin => None,
        };
        let mut last_failure: Option<(usize, BrokerError)> = None;
        let mut idle = false;

        for attempt in 0..len {
            let index = match first.take() {
                Some(index) => index,
                None => match rotation.next(&tried) {
                    Some(index) => index,
                    None => break,
                },
            };
            tried[index] = true;
            let slot = &self.slots[index];

            let holder = match self.ensure_holder(slot).await {
                Ok(holder) => holder,
                Err(e) => {
                    warn!(endpoint = %slot.endpoint.label(), attempt, error = %e, "Failed to connect, trying next endpoint");
                    slot.mark_failed();
                    last_failure = Some((index, e));
                    continue;
                }
            };

            match operation(holder.clone()).await {
                Ok(value) => {
                    if self.policy == SelectionPolicy::Sticky {
                        self.sticky.store(index, Ordering::SeqCst);
                    }
                    return Ok(value);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Idle) => {
                    debug!(endpoint = %slot.endpoint.label(), attempt, "Endpoint idle, trying next endpoint");
                    idle = true;
                }
                Err(AttemptError::Transient(e)) => {
                    warn!(endpoint = %slot.endpoint.label(), attempt, error = %e, "Endpoint failed, trying next endpoint");
                    slot.mark_failed();
                    self.invalidate(slot, &holder).await;
                    last_failure = Some((index, e));
                }
            }
        }

        if idle {
            return Err(Error::Idle);
        }

        match last_failure {
            Some((index, source)) => Err(Error::Exhausted {
                endpoint: self.slots[index].endpoint.label(),
                attempts: len,
                source,
            }),
            None => Err(Error::Config("No endpoint was attempted".to_string())),
        }
    }

    /// Current holder of `slot` if valid, otherwise a freshly opened one.
    async fn ensure_holder(&self, slot: &Slot) -> std::result::Result<Arc<ConnectionHolder>, BrokerError> {
        if let Some(holder) = slot.current().filter(|h| h.valid()) {
            return Ok(holder);
        }

        let _guard = slot.connect_lock.lock().await;
        // Another caller may have reconnected while we waited
        if let Some(holder) = slot.current().filter(|h| h.valid()) {
            return Ok(holder);
        }

        if let Some(stale) = slot.replace(None) {
            if let Err(e) = stale.close().await {
                debug!(endpoint = %slot.endpoint.label(), error = %e, "Error closing stale holder");
            }
        }

        let holder = Arc::new(ConnectionHolder::new(slot.endpoint.clone()));
        if let Err(e) = holder.open(self.transport.as_ref(), self.mode).await {
            let _ = holder.close().await;
            return Err(e);
        }
        slot.replace(Some(holder.clone()));
        Ok(holder)
    }

    /// Drop `holder` from its slot so the next attempt reconnects.
    async fn invalidate(&self, slot: &Slot, holder: &Arc<ConnectionHolder>) {
        if let Some(removed) = slot.take_if(holder) {
            if let Err(e) = removed.close().await {
                debug!(endpoint = %slot.endpoint.label(), error = %e, "Error closing failed holder");
            }
        }
    }

    /// Depth of the endpoint queue, with the same failover as `run`.
    pub async fn queue_depth(&self) -> Result<u32> {
        self.run(|holder| async move {
            let queue = holder.endpoint().queue.clone().ok_or_else(|| {
                AttemptError::Fatal(Error::Config(format!(
                    "No queue configured for {}",
                    holder.endpoint().address()
                )))
            })?;
            Ok(holder.message_count(&queue).await?)
        })
        .await
    }

    /// Holders that are currently connected.
    pub fn valid_holders(&self) -> Vec<Arc<ConnectionHolder>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.current())
            .filter(|holder| holder.valid())
            .collect()
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.slots
            .iter()
            .map(|slot| EndpointStatus {
                address: slot.endpoint.address(),
                label: slot.endpoint.label(),
                connected: slot.current().map(|h| h.valid()).unwrap_or(false),
                last_failure: slot.last_failure(),
            })
            .collect()
    }

    /// Close and forget every holder. Errors are logged.
    pub async fn close_all(&self) {
        for slot in &self.slots {
            if let Some(holder) = slot.replace(None) {
                match holder.close().await {
                    Ok(()) => info!(endpoint = %slot.endpoint.label(), "Closed broker connection"),
                    Err(e) => warn!(endpoint = %slot.endpoint.label(), error = %e, "Error closing broker connection"),
                }
            }
        }
    }
}
