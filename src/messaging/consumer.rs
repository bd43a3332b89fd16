//! Failover consumer that drains whichever endpoint has a message.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{instrument, warn};

use crate::error::{AttemptError, Error, Result};
use crate::messaging::remaining;
use crate::pool::{EndpointPool, EndpointStatus, OpenMode};
use crate::transport::Transport;
use crate::types::{Message, MessagingConfig};

/// Pulls messages from the endpoint queues.
///
/// An endpoint whose queue stays empty for the whole timeout is skipped in
/// favour of the next one. A zero timeout waits on the first reachable
/// endpoint until a message arrives.
pub struct Consumer {
    pool: EndpointPool,
}

impl Consumer {
    pub fn new(config: &MessagingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_pool(EndpointPool::from_config(config, OpenMode::Consume, transport)?)
    }

    /// Every endpoint of `pool` must name a queue.
    pub fn with_pool(pool: EndpointPool) -> Result<Self> {
        if let Some(endpoint) = pool.endpoints().find(|e| e.queue.is_none()) {
            return Err(Error::Config(format!("No queue configured for {}", endpoint.address())));
        }
        Ok(Self { pool })
    }

    /// Next message, deserialized. `None` if no endpoint had one in time.
    pub async fn consume<T: DeserializeOwned>(&self, timeout: Duration) -> Result<Option<T>> {
        self.receive(timeout, |message| message.to_value::<T>()).await
    }

    pub async fn consume_text(&self, timeout: Duration) -> Result<Option<String>> {
        self.receive(timeout, |message| message.to_text()).await
    }

    pub async fn consume_message(&self, timeout: Duration) -> Result<Option<Message>> {
        self.receive(timeout, Ok).await
    }

    /// Take one delivery, decode it, then ack it unless the broker already did.
    /// Deliveries that fail to decode are rejected without requeue.
    #[instrument(skip(self, decode))]
    async fn receive<T, D>(&self, timeout: Duration, decode: D) -> Result<Option<T>>
    where
        D: Fn(Message) -> Result<T>,
    {
        let decode = &decode;

        let result = self
            .pool
            .run(move |holder| async move {
                let endpoint = holder.endpoint();
                // Waiting for another caller's lease counts against the timeout
                let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
                let delivery = {
                    let Some(mut consumer) = holder.consumer_until(deadline).await else {
                        return Err(AttemptError::Idle);
                    };
                    match consumer.next(remaining(deadline)).await? {
                        Some(delivery) => delivery,
                        None => return Err(AttemptError::Idle),
                    }
                };
                let tag = delivery.delivery_tag;

                match decode(Message::from(delivery)) {
                    Ok(value) => {
                        if !endpoint.no_ack {
                            let _channel = holder.lock_channel().await;
                            holder.ack(tag).await?;
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint.label(), error = %e, "Rejecting undecodable message");
                        if !endpoint.no_ack {
                            let _channel = holder.lock_channel().await;
                            holder.reject(tag, false).await?;
                        }
                        Err(AttemptError::Fatal(e))
                    }
                }
            })
            .await;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(Error::Idle) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn queue_depth(&self) -> Result<u32> {
        self.pool.queue_depth().await
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.pool.status()
    }

    /// Cancel consumers and close every connection. Unacked messages go back to their queues.
    pub async fn close_connections(&self) {
        self.pool.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{BrokerEndpoint, MessageProperties, CONTENT_TYPE_TEXT};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    const SHORT: Duration = Duration::from_millis(20);

    fn consumer(endpoints: Vec<BrokerEndpoint>) -> (Consumer, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let config = MessagingConfig::with_endpoints(endpoints);
        (Consumer::new(&config, transport.clone()).unwrap(), transport)
    }

    fn text_props() -> MessageProperties {
        MessageProperties {
            content_type: Some(CONTENT_TYPE_TEXT.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_without_queue_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let config = MessagingConfig::with_endpoints(vec![BrokerEndpoint::new("mem", 1)]);
        assert!(matches!(Consumer::new(&config, transport), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_consume_acks_exactly_once() {
        let (consumer, transport) = consumer(vec![BrokerEndpoint::new("mem", 2).with_queue("jobs")]);
        let node = transport.node("mem:2");
        node.push("jobs", b"first", text_props());
        node.push("jobs", b"second", text_props());

        assert_eq!(consumer.consume_text(SHORT).await.unwrap().as_deref(), Some("first"));
        assert_eq!(consumer.consume_text(SHORT).await.unwrap().as_deref(), Some("second"));

        assert_eq!(node.stats().acks, 2);
        assert_eq!(node.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_queues_return_none() {
        let (consumer, transport) = consumer(vec![
            BrokerEndpoint::new("mem", 3).with_queue("jobs"),
            BrokerEndpoint::new("mem", 4).with_queue("jobs"),
        ]);

        assert_eq!(consumer.consume_text(SHORT).await.unwrap(), None);
        // Idle endpoints stay connected
        assert!(consumer.status().iter().all(|s| s.connected));
        assert_eq!(transport.node("mem:3").stats().connects, 1);
    }

    #[tokio::test]
    async fn test_drains_whichever_endpoint_has_messages() {
        let (consumer, transport) = consumer(vec![
            BrokerEndpoint::new("mem", 5).with_queue("jobs"),
            BrokerEndpoint::new("mem", 6).with_queue("jobs"),
        ]);
        transport.node("mem:6").push("jobs", b"only here", text_props());

        let received = consumer.consume_text(SHORT).await.unwrap();
        assert_eq!(received.as_deref(), Some("only here"));
    }

    #[tokio::test]
    async fn test_no_ack_endpoint_is_not_acked() {
        let (consumer, transport) =
            consumer(vec![BrokerEndpoint::new("mem", 7).with_queue("jobs").with_no_ack(true)]);
        let node = transport.node("mem:7");
        node.push("jobs", b"fire and forget", text_props());

        assert!(consumer.consume_text(SHORT).await.unwrap().is_some());
        assert_eq!(node.stats().acks, 0);
        assert_eq!(node.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_rejected() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Job {
            id: u32,
        }

        let (consumer, transport) = consumer(vec![BrokerEndpoint::new("mem", 8).with_queue("jobs")]);
        let node = transport.node("mem:8");
        node.push("jobs", b"not json", MessageProperties::default());

        let result = consumer.consume::<Job>(SHORT).await;
        assert!(matches!(result, Err(Error::Codec(_))));
        assert_eq!(node.stats().rejects, 1);
        assert_eq!(node.queue_depth("jobs"), 0);
    }

    #[tokio::test]
    async fn test_timeout_covers_wait_behind_another_consumer() {
        let (consumer, _transport) = consumer(vec![BrokerEndpoint::new("mem", 10).with_queue("jobs")]);
        let consumer = Arc::new(consumer);

        let slow = consumer.clone();
        let first = tokio::spawn(async move { slow.consume_text(Duration::from_millis(800)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let second = consumer.consume_text(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second, None);
        assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());
        assert!(consumer.status()[0].connected);

        assert_eq!(first.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_for_message() {
        let (consumer, transport) = consumer(vec![BrokerEndpoint::new("mem", 9).with_queue("jobs")]);
        let node = transport.node("mem:9");
        node.declare_queue("jobs");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            node.push("jobs", b"eventually", text_props());
        });

        let received = tokio::time::timeout(Duration::from_secs(2), consumer.consume_text(Duration::ZERO))
            .await
            .expect("message before outer timeout")
            .unwrap();
        assert_eq!(received.as_deref(), Some("eventually"));
    }
}
