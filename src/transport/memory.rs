//! In-process broker.
//!
//! Each endpoint address maps to a [`MemoryNode`] holding queues, bindings
//! and live connections. Nodes can be made unreachable or severed to
//! simulate broker outages, and they keep counters of what clients did.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions, ShutdownHook, Transport};
use crate::error::BrokerError;
use crate::types::{BrokerEndpoint, Delivery, ExchangeKind, MessageProperties};

/// Counters of client activity on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Connection attempts, refused ones included
    pub connect_attempts: u64,
    pub connects: u64,
    pub publishes: u64,
    pub commits: u64,
    pub acks: u64,
    pub rejects: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    properties: MessageProperties,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    /// Connection that owns an exclusive queue
    owner: Option<u64>,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct ConnectionEntry {
    alive: Arc<AtomicBool>,
    hooks: Vec<ShutdownHook>,
}

struct Unacked {
    connection: u64,
    channel: u64,
    queue: String,
    message: StoredMessage,
}

struct NodeState {
    reachable: bool,
    fail_commits: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    unacked: HashMap<(u64, u64), Unacked>,
    stats: NodeStats,
}

impl NodeState {
    fn new() -> Self {
        Self {
            reachable: true,
            fail_commits: false,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            unacked: HashMap::new(),
            stats: NodeStats::default(),
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<(), BrokerError> {
        if exchange.is_empty() {
            // Default exchange: routing key names the queue, unroutable messages are dropped
            if let Some(queue) = self.queues.get_mut(routing_key) {
                queue.messages.push_back(message);
            }
            return Ok(());
        }

        let kind = *self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|b| b.queue.clone())
            .collect();

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
            }
        }
        Ok(())
    }

    /// Put unacked messages matching `filter` back at the head of their queues.
    fn requeue_where(&mut self, filter: impl Fn(&Unacked) -> bool) {
        let keys: Vec<(u64, u64)> = self
            .unacked
            .iter()
            .filter(|(_, u)| filter(u))
            .map(|(k, _)| *k)
            .collect();

        let mut returned: Vec<((u64, u64), Unacked)> = keys
            .into_iter()
            .filter_map(|k| self.unacked.remove(&k).map(|u| (k, u)))
            .collect();
        // Highest tag first so push_front restores the original order
        returned.sort_by(|a, b| b.0 .1.cmp(&a.0 .1));

        for (_, unacked) in returned {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.messages.push_front(unacked.message);
            }
        }
    }

    /// Forget a connection and everything it owned. Returns its shutdown hooks.
    fn drop_connection(&mut self, id: u64) -> Vec<ShutdownHook> {
        let hooks = match self.connections.remove(&id) {
            Some(entry) => {
                entry.alive.store(false, Ordering::SeqCst);
                entry.hooks
            }
            None => Vec::new(),
        };
        self.requeue_where(|u| u.connection == id);
        self.queues.retain(|_, q| q.owner != Some(id));
        hooks
    }
}

/// `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// One simulated broker.
pub struct MemoryNode {
    address: String,
    state: Mutex<NodeState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl MemoryNode {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(NodeState::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Refuse (or accept again) new connections. Live connections are untouched.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Kill every live connection as a broker restart would, firing shutdown hooks.
    pub fn sever(&self) {
        let hooks: Vec<ShutdownHook> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter().flat_map(|id| state.drop_connection(id)).collect()
        };

        info!(node = %self.address, hooks = hooks.len(), "Severing memory broker connections");

        for hook in hooks {
            hook("connection reset by broker");
        }
        self.notify.notify_waiters();
    }

    /// Make every `tx_commit` fail (or succeed again). Failed commits roll back.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    pub fn stats(&self) -> NodeStats {
        self.lock().stats.clone()
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Declare a queue out of band, as an operator would for predeclared topologies.
    pub fn declare_queue(&self, name: &str) {
        self.lock().queues.entry(name.to_string()).or_default();
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map(|q| q.messages.len()).unwrap_or(0)
    }

    /// Delivered but not yet acknowledged messages.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Payloads of the ready messages in a queue, oldest first.
    pub fn queued_payloads(&self, name: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Properties of the ready messages in a queue, oldest first.
    pub fn queued_properties(&self, name: &str) -> Vec<MessageProperties> {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.messages.iter().map(|m| m.properties.clone()).collect())
            .unwrap_or_default()
    }

    /// Enqueue a message directly, declaring the queue if needed.
    pub fn push(&self, queue: &str, payload: &[u8], properties: MessageProperties) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(StoredMessage {
                payload: payload.to_vec(),
                properties,
            });
        self.notify.notify_waiters();
    }
}

/// In-process transport; endpoints with the same `host:port` share a node.
#[derive(Default)]
pub struct MemoryTransport {
    nodes: Mutex<HashMap<String, Arc<MemoryNode>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node serving `address`, created on first use.
    pub fn node(&self, address: &str) -> Arc<MemoryNode> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new(address)))
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let node = self.node(&endpoint.address());
        let id = node.next_id();
        let alive = Arc::new(AtomicBool::new(true));
        {
            let mut state = node.lock();
            state.stats.connect_attempts += 1;
            if !state.reachable {
                return Err(BrokerError::ConnectionRefused(endpoint.address()));
            }
            state.stats.connects += 1;
            state.connections.insert(
                id,
                ConnectionEntry {
                    alive: alive.clone(),
                    hooks: Vec::new(),
                },
            );
        }

        debug!(node = %node.address, connection = id, "Memory connection opened");

        Ok(Arc::new(MemoryConnection { id, node, alive }))
    }
}

struct MemoryConnection {
    id: u64,
    node: Arc<MemoryNode>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed(self.node.address.clone()));
        }
        Ok(Arc::new(MemoryChannel {
            inner: Arc::new(ChannelInner {
                id: self.node.next_id(),
                connection: self.id,
                node: self.node.clone(),
                alive: self.alive.clone(),
                open: AtomicBool::new(true),
                transactional: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                next_tag: AtomicU64::new(1),
                prefetch: AtomicU16::new(0),
                cancelled: Mutex::new(HashSet::new()),
            }),
        }))
    }

    fn on_shutdown(&self, hook: ShutdownHook) {
        let unregistered = {
            let mut state = self.node.lock();
            match state.connections.get_mut(&self.id) {
                Some(entry) => {
                    entry.hooks.push(hook);
                    None
                }
                None => Some(hook),
            }
        };
        if let Some(hook) = unregistered {
            hook("connection already closed");
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Explicit close does not run shutdown hooks
        let _ = self.node.lock().drop_connection(self.id);
        self.alive.store(false, Ordering::SeqCst);
        self.node.notify.notify_waiters();
        Ok(())
    }
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    message: StoredMessage,
}

struct ChannelInner {
    id: u64,
    connection: u64,
    node: Arc<MemoryNode>,
    alive: Arc<AtomicBool>,
    open: AtomicBool,
    transactional: AtomicBool,
    pending: Mutex<Vec<PendingPublish>>,
    next_tag: AtomicU64,
    prefetch: AtomicU16,
    cancelled: Mutex<HashSet<String>>,
}

impl ChannelInner {
    fn check(&self) -> Result<(), BrokerError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed(self.node.address.clone()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        Ok(())
    }

    fn is_cancelled(&self, tag: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(tag)
    }

    fn take_pending(&self) -> Vec<PendingPublish> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.inner.check()?;
        self.inner.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), BrokerError> {
        self.inner.check()?;
        self.inner.transactional.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), BrokerError> {
        self.inner.check()?;
        if !self.inner.transactional.load(Ordering::SeqCst) {
            return Err(BrokerError::Protocol("PRECONDITION_FAILED - channel is not transactional".to_string()));
        }
        let pending = self.inner.take_pending();
        {
            let mut state = self.inner.node.lock();
            if state.fail_commits {
                return Err(BrokerError::Channel(format!(
                    "commit of {} publishes failed, transaction rolled back",
                    pending.len()
                )));
            }
            state.stats.commits += 1;
            for publish in pending {
                state.route(&publish.exchange, &publish.routing_key, publish.message)?;
            }
        }
        self.inner.node.notify.notify_waiters();
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<(), BrokerError> {
        self.inner.check()?;
        let mut state = self.inner.node.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                name,
                existing.as_str()
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError> {
        self.inner.check()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        let mut state = self.inner.node.lock();
        let queue = state.queues.entry(name.clone()).or_default();
        if options.exclusive {
            queue.owner = Some(self.inner.connection);
        }
        Ok(name)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner.check()?;
        let mut state = self.inner.node.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        self.inner.check()?;
        let state = self.inner.node.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.messages.len() as u32)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no queue '{}'", queue)))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.inner.check()?;
        let message = StoredMessage {
            payload: payload.to_vec(),
            properties: properties.clone(),
        };

        if self.inner.transactional.load(Ordering::SeqCst) {
            let mut state = self.inner.node.lock();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }
            state.stats.publishes += 1;
            drop(state);
            self.inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(PendingPublish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message,
                });
            return Ok(());
        }

        {
            let mut state = self.inner.node.lock();
            state.route(exchange, routing_key, message)?;
            state.stats.publishes += 1;
        }
        self.inner.node.notify.notify_waiters();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.inner.check()?;
        if !self.inner.node.lock().queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        Ok(Box::new(MemoryDeliveryStream {
            channel: self.inner.clone(),
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            no_ack,
        }))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner.check()?;
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_string());
        self.inner.node.notify.notify_waiters();
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner.check()?;
        {
            let mut state = self.inner.node.lock();
            if state.unacked.remove(&(self.inner.id, delivery_tag)).is_none() {
                return Err(BrokerError::Protocol(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            }
            state.stats.acks += 1;
        }
        self.inner.node.notify.notify_waiters();
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner.check()?;
        {
            let mut state = self.inner.node.lock();
            let unacked = state.unacked.remove(&(self.inner.id, delivery_tag)).ok_or_else(|| {
                BrokerError::Protocol(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
            })?;
            state.stats.rejects += 1;
            if requeue {
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
        self.inner.node.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            // Uncommitted transactional publishes are rolled back
            self.inner.take_pending();
            let channel = self.inner.id;
            self.inner.node.lock().requeue_where(|u| u.channel == channel);
            self.inner.node.notify.notify_waiters();
        }
        Ok(())
    }
}

struct MemoryDeliveryStream {
    channel: Arc<ChannelInner>,
    queue: String,
    consumer_tag: String,
    no_ack: bool,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let node = self.channel.node.clone();
        loop {
            let notified = node.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Err(e) = self.channel.check() {
                return Some(Err(e));
            }
            if self.channel.is_cancelled(&self.consumer_tag) {
                return None;
            }

            {
                let mut state = node.lock();
                let channel_id = self.channel.id;
                let in_flight = state.unacked.keys().filter(|(c, _)| *c == channel_id).count();
                let prefetch = self.channel.prefetch.load(Ordering::SeqCst) as usize;
                let blocked = !self.no_ack && prefetch > 0 && in_flight >= prefetch;

                let queue = match state.queues.get_mut(&self.queue) {
                    Some(queue) => queue,
                    None => {
                        return Some(Err(BrokerError::Channel(format!(
                            "NOT_FOUND - queue '{}' was deleted",
                            self.queue
                        ))))
                    }
                };

                if !blocked {
                    if let Some(message) = queue.messages.pop_front() {
                        let delivery_tag = self.channel.next_tag.fetch_add(1, Ordering::SeqCst);
                        let delivery = Delivery {
                            delivery_tag,
                            payload: message.payload.clone(),
                            properties: message.properties.clone(),
                        };
                        if !self.no_ack {
                            state.unacked.insert(
                                (channel_id, delivery_tag),
                                Unacked {
                                    connection: self.channel.connection,
                                    channel: channel_id,
                                    queue: self.queue.clone(),
                                    message,
                                },
                            );
                        }
                        return Some(Ok(delivery));
                    }
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(port: u16) -> BrokerEndpoint {
        BrokerEndpoint::new("mem", port)
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("billing.#", "orders.created"));
    }

    #[tokio::test]
    async fn test_unreachable_node_refuses_connections() {
        let transport = MemoryTransport::new();
        let node = transport.node("mem:1");
        node.set_reachable(false);

        let result = transport.connect(&endpoint(1)).await;
        assert!(matches!(result, Err(BrokerError::ConnectionRefused(_))));
        assert_eq!(node.stats().connect_attempts, 1);
        assert_eq!(node.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_transactional_publish_visible_after_commit() {
        let transport = MemoryTransport::new();
        let conn = transport.connect(&endpoint(2)).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.queue_declare("jobs", QueueOptions::default()).await.unwrap();
        channel.tx_select().await.unwrap();

        let props = MessageProperties::default();
        channel.basic_publish("", "jobs", b"one", &props).await.unwrap();
        assert_eq!(channel.message_count("jobs").await.unwrap(), 0);

        channel.tx_commit().await.unwrap();
        assert_eq!(channel.message_count("jobs").await.unwrap(), 1);
        assert_eq!(transport.node("mem:2").stats().commits, 1);
    }

    #[tokio::test]
    async fn test_sever_fires_hooks_and_requeues_unacked() {
        let transport = MemoryTransport::new();
        let node = transport.node("mem:3");
        node.push("jobs", b"work", MessageProperties::default());

        let conn = transport.connect(&endpoint(3)).await.unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        conn.on_shutdown(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        let channel = conn.open_channel().await.unwrap();
        let mut stream = channel.basic_consume("jobs", "c1", false).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"work");
        assert_eq!(node.unacked_count(), 1);

        node.sever();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(node.queue_depth("jobs"), 1);
        assert!(matches!(stream.next_delivery().await, Some(Err(BrokerError::ConnectionClosed(_)))));
    }

    #[tokio::test]
    async fn test_double_ack_is_protocol_error() {
        let transport = MemoryTransport::new();
        let node = transport.node("mem:4");
        node.push("jobs", b"work", MessageProperties::default());

        let conn = transport.connect(&endpoint(4)).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let mut stream = channel.basic_consume("jobs", "c1", false).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();

        channel.basic_ack(delivery.delivery_tag).await.unwrap();
        assert!(matches!(
            channel.basic_ack(delivery.delivery_tag).await,
            Err(BrokerError::Protocol(_))
        ));
        assert_eq!(node.stats().acks, 1);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let transport = Arc::new(MemoryTransport::new());
        let conn = transport.connect(&endpoint(5)).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.queue_declare("jobs", QueueOptions::default()).await.unwrap();
        let mut stream = channel.basic_consume("jobs", "c1", true).await.unwrap();

        let node = transport.node("mem:5");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            node.push("jobs", b"late", MessageProperties::default());
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next_delivery())
            .await
            .expect("delivery before timeout")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let transport = MemoryTransport::new();
        let conn = transport.connect(&endpoint(6)).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let name = channel
            .queue_declare(
                "",
                QueueOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let node = transport.node("mem:6");
        assert!(name.starts_with("amq.gen-"));
        assert!(node.queue_exists(&name));

        conn.close().await.unwrap();
        assert!(!node.queue_exists(&name));
    }
}
