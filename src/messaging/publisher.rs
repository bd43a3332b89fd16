//! Failover publisher with transactional commit batching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::error::{Error, Result};
use crate::pool::{EndpointPool, EndpointStatus, OpenMode};
use crate::transport::Transport;
use crate::types::{Message, MessagingConfig, PayloadKind};

/// Publishes messages to the first endpoint that accepts them.
///
/// Durable endpoints publish inside transactions that are committed every
/// `commit_batch_size` messages, counted across the whole publisher. Call
/// [`close`](Self::close) on shutdown so a partial batch is committed.
pub struct Publisher {
    pool: EndpointPool,
    published: AtomicU64,
    retained_error: Mutex<Option<String>>,
}

impl Publisher {
    pub fn new(config: &MessagingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self::with_pool(EndpointPool::from_config(config, OpenMode::Publish, transport)?))
    }

    pub fn with_pool(pool: EndpointPool) -> Self {
        Self {
            pool,
            published: AtomicU64::new(0),
            retained_error: Mutex::new(None),
        }
    }

    /// Serialize `value` and publish it.
    pub async fn publish<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.publish_message(Message::json(value)?).await
    }

    pub async fn publish_text(&self, text: &str) -> Result<()> {
        self.publish_message(Message::text(text)?).await
    }

    /// Publish raw bytes tagged as serialized data.
    pub async fn publish_bytes(&self, payload: Vec<u8>) -> Result<()> {
        self.publish_message(Message::bytes(payload, PayloadKind::Json)?).await
    }

    #[instrument(skip(self, message), fields(bytes = message.payload.len()))]
    pub async fn publish_message(&self, message: Message) -> Result<()> {
        if message.payload.is_empty() {
            return Err(Error::Config("Message is empty".to_string()));
        }

        let message = &message;
        let published = &self.published;
        let retained = &self.retained_error;

        self.pool
            .run(move |holder| async move {
                let endpoint = holder.endpoint();
                let properties = message.properties(endpoint.delivery_mode());

                // Publish and commit must not interleave with another caller on this channel
                let _channel = holder.lock_channel().await;
                holder
                    .publish(
                        &endpoint.exchange,
                        endpoint.publish_routing_key(),
                        &message.payload,
                        &properties,
                    )
                    .await?;

                if endpoint.durable {
                    let count = published.fetch_add(1, Ordering::SeqCst) + 1;
                    if count % u64::from(endpoint.commit_batch_size) == 0 {
                        if endpoint.has_tx_conflict() {
                            let msg = format!(
                                "{} is durable but has transactions disabled; batch of {} not committed",
                                endpoint.address(),
                                endpoint.commit_batch_size
                            );
                            error!(endpoint = %endpoint.label(), "{}", msg);
                            *retained.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(msg);
                        } else if let Err(e) = holder.commit().await {
                            // The retry on the next endpoint counts this publish again
                            published.fetch_sub(1, Ordering::SeqCst);
                            return Err(e.into());
                        } else {
                            debug!(endpoint = %endpoint.label(), published = count, "Committed transaction");
                        }
                    }
                }
                Ok(())
            })
            .await
    }

    /// Depth of the endpoint queue, with the same failover as publishing.
    pub async fn queue_depth(&self) -> Result<u32> {
        self.pool.queue_depth().await
    }

    /// Durable publishes so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// The last durable/transaction-disabled conflict hit at commit time.
    pub fn retained_error(&self) -> Option<String> {
        self.retained_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.pool.status()
    }

    /// Commit pending transactions on every connected durable endpoint, then
    /// close all connections. Commit failures are logged and do not stop the close.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        for holder in self.pool.valid_holders() {
            let endpoint = holder.endpoint();
            if !endpoint.wants_transactions() {
                continue;
            }
            let _channel = holder.lock_channel().await;
            match holder.commit().await {
                Ok(()) => debug!(endpoint = %endpoint.label(), "Final commit done"),
                Err(e) => error!(endpoint = %endpoint.label(), error = %e, "Final commit failed"),
            }
        }
        self.pool.close_all().await;
        info!("Publisher closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{BrokerEndpoint, ExchangeKind};
    use pretty_assertions::assert_eq;

    fn publisher(endpoints: Vec<BrokerEndpoint>) -> (Publisher, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let config = MessagingConfig::with_endpoints(endpoints);
        (Publisher::new(&config, transport.clone()).unwrap(), transport)
    }

    #[tokio::test]
    async fn test_commit_every_batch_and_flush_on_close() {
        let endpoint = BrokerEndpoint::new("mem", 1)
            .with_queue("orders")
            .with_durable(true)
            .with_commit_batch_size(3);
        let (publisher, transport) = publisher(vec![endpoint]);
        let node = transport.node("mem:1");

        for i in 1..=5 {
            publisher.publish_text(&format!("order-{}", i)).await.unwrap();
            let expected_commits = if i >= 3 { 1 } else { 0 };
            assert_eq!(node.stats().commits, expected_commits, "after publish {}", i);
        }
        assert_eq!(node.queue_depth("orders"), 3);

        publisher.close().await;
        assert_eq!(node.stats().commits, 2);
        assert_eq!(node.queue_depth("orders"), 5);
        assert_eq!(publisher.published_count(), 5);
    }

    #[tokio::test]
    async fn test_non_durable_publish_skips_transactions() {
        let (publisher, transport) = publisher(vec![BrokerEndpoint::new("mem", 2).with_queue("events")]);

        publisher.publish(&serde_json::json!({"id": 1})).await.unwrap();
        publisher.close().await;

        let node = transport.node("mem:2");
        assert_eq!(node.queue_depth("events"), 1);
        assert_eq!(node.stats().commits, 0);
        assert_eq!(publisher.published_count(), 0);
    }

    #[tokio::test]
    async fn test_tx_conflict_is_logged_and_retained() {
        let endpoint = BrokerEndpoint::new("mem", 3)
            .with_queue("orders")
            .with_durable(true)
            .with_disable_transaction(true);
        let (publisher, transport) = publisher(vec![endpoint]);

        publisher.publish_text("lost?").await.unwrap();

        let retained = publisher.retained_error().unwrap();
        assert!(retained.contains("transactions disabled"));
        assert_eq!(transport.node("mem:3").stats().commits, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_is_counted_once() {
        let durable = |port| {
            BrokerEndpoint::new("mem", port)
                .with_queue("orders")
                .with_durable(true)
                .with_commit_batch_size(1)
        };
        let (publisher, transport) = publisher(vec![durable(6), durable(7)]);
        let failing = transport.node("mem:6");
        let healthy = transport.node("mem:7");
        failing.fail_commits(true);

        publisher.publish_text("order-1").await.unwrap();
        assert_eq!(publisher.published_count(), 1);
        assert_eq!(failing.queue_depth("orders"), 0);
        assert_eq!(healthy.stats().commits, 1);

        publisher.publish_text("order-2").await.unwrap();
        assert_eq!(publisher.published_count(), 2);
        assert_eq!(healthy.stats().commits, 2);
        assert_eq!(healthy.queue_depth("orders"), 2);
    }

    #[tokio::test]
    async fn test_empty_message_is_fatal() {
        let (publisher, transport) = publisher(vec![BrokerEndpoint::new("mem", 4).with_queue("q")]);

        assert!(matches!(publisher.publish_text("").await, Err(Error::Config(_))));
        assert!(matches!(publisher.publish_bytes(Vec::new()).await, Err(Error::Config(_))));
        assert_eq!(transport.node("mem:4").stats().connect_attempts, 0);
    }

    #[tokio::test]
    async fn test_publish_through_exchange() {
        let endpoint = BrokerEndpoint::new("mem", 5)
            .with_exchange("events", ExchangeKind::Direct)
            .with_routing_key("billing")
            .with_queue("billing-events");
        let (publisher, transport) = publisher(vec![endpoint]);

        publisher.publish_text("invoice").await.unwrap();

        assert_eq!(
            transport.node("mem:5").queued_payloads("billing-events"),
            vec![b"invoice".to_vec()]
        );
        assert_eq!(publisher.queue_depth().await.unwrap(), 1);
    }
}
