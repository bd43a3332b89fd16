//! Live connection + channel (+ consumer) bound to one endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::transport::{BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions, Transport};
use crate::types::{BrokerEndpoint, Delivery, MessageProperties};

/// What a holder sets up when it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Channel only; transactional when the endpoint is durable.
    Publish,
    /// Channel with prefetch 1 and a consumer on the endpoint queue.
    Consume,
    /// Channel with a private reply queue and a consumer on it.
    Rpc,
}

/// Handles produced by a successful `open`.
struct Opened {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: Option<String>,
    reply_queue: Option<String>,
    stream: Option<Box<dyn DeliveryStream>>,
}

#[derive(Default)]
struct Handles {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tag: Option<String>,
    reply_queue: Option<String>,
}

/// Owns the broker handles for one endpoint slot.
///
/// The handle references only change under `handles`; `valid` mirrors them so
/// readers never take the lock. The shutdown hook clears the references from
/// a transport task and never performs I/O.
pub struct ConnectionHolder {
    endpoint: Arc<BrokerEndpoint>,
    handles: Mutex<Handles>,
    valid: AtomicBool,
    consumer: AsyncMutex<Option<Box<dyn DeliveryStream>>>,
    channel_guard: AsyncMutex<()>,
}

impl ConnectionHolder {
    pub fn new(endpoint: Arc<BrokerEndpoint>) -> Self {
        Self {
            endpoint,
            handles: Mutex::new(Handles::default()),
            valid: AtomicBool::new(false),
            consumer: AsyncMutex::new(None),
            channel_guard: AsyncMutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Both connection and channel are present. May be slightly stale.
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Name of the private reply queue, for RPC holders.
    pub fn reply_queue(&self) -> Option<String> {
        self.lock().reply_queue.clone()
    }

    /// Establish connection and channel and declare what `mode` needs.
    /// Does nothing if the holder is already valid.
    pub async fn open(self: &Arc<Self>, transport: &dyn Transport, mode: OpenMode) -> Result<(), BrokerError> {
        if self.valid() {
            return Ok(());
        }

        let connection = transport.connect(&self.endpoint).await?;
        let opened = match self.setup(connection.as_ref(), mode).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close half-open connection");
                }
                return Err(e);
            }
        };

        // Hook first: a loss after this point is seen either here or by the hook
        let lost = Arc::new(AtomicBool::new(false));
        let weak: Weak<Self> = Arc::downgrade(self);
        let seen = lost.clone();
        connection.on_shutdown(Box::new(move |reason| {
            seen.store(true, Ordering::Release);
            if let Some(holder) = weak.upgrade() {
                holder.on_shutdown(reason);
            }
        }));

        *self.consumer.lock().await = opened.stream;
        {
            let mut handles = self.lock();
            if lost.load(Ordering::Acquire) {
                return Err(BrokerError::ConnectionClosed(format!(
                    "{} dropped the connection while it was being opened",
                    self.endpoint.address()
                )));
            }
            handles.connection = Some(connection);
            handles.channel = Some(opened.channel);
            handles.consumer_tag = opened.consumer_tag;
            handles.reply_queue = opened.reply_queue;
            self.valid.store(true, Ordering::Release);
        }

        info!(endpoint = %self.endpoint.label(), mode = ?mode, "Broker connection opened");
        Ok(())
    }

    async fn setup(&self, connection: &dyn BrokerConnection, mode: OpenMode) -> Result<Opened, BrokerError> {
        let endpoint = &self.endpoint;
        let channel = connection.open_channel().await?;

        if mode == OpenMode::Publish && endpoint.wants_transactions() {
            channel.tx_select().await?;
        }

        if !endpoint.use_predeclared_queues {
            if !endpoint.exchange.is_empty() {
                channel
                    .exchange_declare(&endpoint.exchange, endpoint.exchange_kind, endpoint.durable)
                    .await?;
            }
            if let Some(queue) = &endpoint.queue {
                channel
                    .queue_declare(
                        queue,
                        QueueOptions {
                            durable: endpoint.durable,
                            ..Default::default()
                        },
                    )
                    .await?;
                if !endpoint.exchange.is_empty() {
                    channel
                        .queue_bind(queue, &endpoint.exchange, &endpoint.routing_key)
                        .await?;
                }
            }
        }

        match mode {
            OpenMode::Publish => Ok(Opened {
                channel,
                consumer_tag: None,
                reply_queue: None,
                stream: None,
            }),
            OpenMode::Consume => {
                let queue = endpoint
                    .queue
                    .as_deref()
                    .ok_or_else(|| BrokerError::Channel(format!("No queue configured for {}", endpoint.address())))?;
                // One unacked message at a time keeps competing consumers fair
                channel.basic_qos(1).await?;
                let tag = format!("brokerpool-{}", Uuid::new_v4());
                let stream = channel.basic_consume(queue, &tag, endpoint.no_ack).await?;
                Ok(Opened {
                    channel,
                    consumer_tag: Some(tag),
                    reply_queue: None,
                    stream: Some(stream),
                })
            }
            OpenMode::Rpc => {
                let reply_queue = channel
                    .queue_declare(
                        "",
                        QueueOptions {
                            durable: false,
                            exclusive: true,
                            auto_delete: true,
                        },
                    )
                    .await?;
                let tag = format!("brokerpool-rpc-{}", Uuid::new_v4());
                let stream = channel.basic_consume(&reply_queue, &tag, true).await?;
                debug!(endpoint = %endpoint.label(), reply_queue = %reply_queue, "Declared reply queue");
                Ok(Opened {
                    channel,
                    consumer_tag: Some(tag),
                    reply_queue: Some(reply_queue),
                    stream: Some(stream),
                })
            }
        }
    }

    /// Cancel the consumer, close the channel, close the connection.
    /// Calling it on a closed holder does nothing.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let (connection, channel, consumer_tag) = {
            let mut handles = self.lock();
            self.valid.store(false, Ordering::Release);
            handles.reply_queue = None;
            (
                handles.connection.take(),
                handles.channel.take(),
                handles.consumer_tag.take(),
            )
        };

        // A consume in progress keeps its stream until the cancel wakes it
        if let Ok(mut stream) = self.consumer.try_lock() {
            stream.take();
        }

        let mut first_error = None;
        if let (Some(channel), Some(tag)) = (&channel, &consumer_tag) {
            if let Err(e) = channel.basic_cancel(tag).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(channel) = &channel {
            if let Err(e) = channel.close().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(connection) = &connection {
            if let Err(e) = connection.close().await {
                first_error.get_or_insert(e);
            }
            debug!(endpoint = %self.endpoint.label(), "Broker connection closed");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connection lost: drop every reference so the slot reconnects on next use.
    pub fn on_shutdown(&self, reason: &str) {
        let mut handles = self.lock();
        let was_valid = self.valid.swap(false, Ordering::AcqRel);
        handles.connection = None;
        handles.channel = None;
        handles.consumer_tag = None;
        handles.reply_queue = None;
        drop(handles);

        if was_valid {
            warn!(endpoint = %self.endpoint.label(), reason = %reason, "Broker connection shut down");
        }
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.lock()
            .channel
            .clone()
            .ok_or_else(|| BrokerError::ConnectionClosed(self.endpoint.address()))
    }

    /// Serialize synchronous command sequences (publish then commit, ack) on the channel.
    pub async fn lock_channel(&self) -> AsyncMutexGuard<'_, ()> {
        self.channel_guard.lock().await
    }

    /// Exclusive access to the consumer for the duration of the lease.
    pub async fn consumer(&self) -> ConsumerLease<'_> {
        ConsumerLease {
            holder: self,
            stream: self.consumer.lock().await,
        }
    }

    /// Like [`consumer`](Self::consumer), but gives up at `deadline`.
    /// `None` waits as long as it takes.
    pub async fn consumer_until(&self, deadline: Option<Instant>) -> Option<ConsumerLease<'_>> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.consumer()).await.ok(),
            None => Some(self.consumer().await),
        }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.channel()?
            .basic_publish(exchange, routing_key, payload, properties)
            .await
    }

    pub async fn commit(&self) -> Result<(), BrokerError> {
        self.channel()?.tx_commit().await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel()?.basic_ack(delivery_tag).await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel()?.basic_reject(delivery_tag, requeue).await
    }

    /// Depth of `queue` without consuming from it.
    pub async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        self.channel()?.message_count(queue).await
    }
}

/// Locked access to a holder's consumer.
pub struct ConsumerLease<'a> {
    holder: &'a ConnectionHolder,
    stream: AsyncMutexGuard<'a, Option<Box<dyn DeliveryStream>>>,
}

impl ConsumerLease<'_> {
    /// Next delivery, waiting at most `timeout` (forever if `None`).
    /// `Ok(None)` means the timeout elapsed.
    pub async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>, BrokerError> {
        let address = self.holder.endpoint.address();
        if !self.holder.valid() {
            return Err(BrokerError::ConnectionClosed(address));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BrokerError::Channel(format!("No consumer open on {}", address)))?;

        let next = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, stream.next_delivery()).await {
                Ok(next) => next,
                Err(_) => return Ok(None),
            },
            None => stream.next_delivery().await,
        };

        match next {
            Some(Ok(delivery)) => Ok(Some(delivery)),
            Some(Err(e)) => Err(e),
            None => Err(BrokerError::ConnectionClosed(format!("consumer on {} was cancelled", address))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNode, MemoryTransport, ShutdownHook};
    use async_trait::async_trait;

    /// Transport whose broker drops the connection just as the holder
    /// registers for shutdown notices.
    struct DropsDuringOpen(MemoryTransport);

    struct DroppingConnection {
        inner: Arc<dyn BrokerConnection>,
        node: Arc<MemoryNode>,
    }

    #[async_trait]
    impl Transport for DropsDuringOpen {
        async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
            let inner = self.0.connect(endpoint).await?;
            Ok(Arc::new(DroppingConnection {
                inner,
                node: self.0.node(&endpoint.address()),
            }))
        }
    }

    #[async_trait]
    impl BrokerConnection for DroppingConnection {
        async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
            self.inner.open_channel().await
        }

        fn on_shutdown(&self, hook: ShutdownHook) {
            self.inner.on_shutdown(hook);
            self.node.sever();
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.inner.close().await
        }
    }

    fn endpoint(port: u16) -> Arc<BrokerEndpoint> {
        Arc::new(BrokerEndpoint::new("mem", port).with_queue("jobs"))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(1)));
        assert!(!holder.valid());

        holder.open(&transport, OpenMode::Publish).await.unwrap();
        holder.open(&transport, OpenMode::Publish).await.unwrap();

        assert!(holder.valid());
        assert_eq!(transport.node("mem:1").stats().connects, 1);
        assert!(transport.node("mem:1").queue_exists("jobs"));
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(2)));
        holder.open(&transport, OpenMode::Consume).await.unwrap();

        holder.close().await.unwrap();
        holder.close().await.unwrap();

        assert!(!holder.valid());
        assert_eq!(transport.node("mem:2").live_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_invalidates() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(3)));
        holder.open(&transport, OpenMode::Consume).await.unwrap();

        transport.node("mem:3").sever();

        assert!(!holder.valid());
        let mut lease = holder.consumer().await;
        assert!(matches!(
            lease.next(Some(Duration::from_millis(10))).await,
            Err(BrokerError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_rpc_mode_declares_private_reply_queue() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(4)));
        holder.open(&transport, OpenMode::Rpc).await.unwrap();

        let reply_queue = holder.reply_queue().unwrap();
        assert!(transport.node("mem:4").queue_exists(&reply_queue));

        holder.close().await.unwrap();
        assert!(!transport.node("mem:4").queue_exists(&reply_queue));
    }

    #[tokio::test]
    async fn test_empty_queue_times_out_without_error() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(5)));
        holder.open(&transport, OpenMode::Consume).await.unwrap();

        let mut lease = holder.consumer().await;
        let next = lease.next(Some(Duration::from_millis(20))).await.unwrap();
        assert!(next.is_none());
        assert!(holder.valid());
    }

    #[tokio::test]
    async fn test_connection_lost_during_open_is_not_valid() {
        let transport = DropsDuringOpen(MemoryTransport::new());
        let holder = Arc::new(ConnectionHolder::new(endpoint(6)));

        let result = holder.open(&transport, OpenMode::Consume).await;

        assert!(matches!(result, Err(BrokerError::ConnectionClosed(_))));
        assert!(!holder.valid());
        assert_eq!(transport.0.node("mem:6").live_connections(), 0);
    }

    #[tokio::test]
    async fn test_consumer_until_gives_up_at_deadline() {
        let transport = MemoryTransport::new();
        let holder = Arc::new(ConnectionHolder::new(endpoint(7)));
        holder.open(&transport, OpenMode::Consume).await.unwrap();

        let held = holder.consumer().await;
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(holder.consumer_until(Some(deadline)).await.is_none());

        drop(held);
        assert!(holder.consumer_until(Some(Instant::now() + Duration::from_millis(20))).await.is_some());
    }
}
