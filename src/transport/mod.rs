//! Broker client seam.
//!
//! The pool and the clients only talk to these traits. `amqp` maps them onto
//! lapin; `memory` is an in-process broker for local runs and tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{BrokerEndpoint, Delivery, ExchangeKind, MessageProperties, TransportKind};

mod amqp;
mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryNode, MemoryTransport, NodeStats};

/// Callback fired by the transport when the broker or network ends a connection.
///
/// Runs on a transport-owned task and must not block.
pub type ShutdownHook = Box<dyn Fn(&str) + Send + Sync>;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Opens connections to broker endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live connection to one broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Register the callback run when the connection is lost.
    fn on_shutdown(&self, hook: ShutdownHook);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on a connection. A channel must not run two synchronous
/// commands at once; callers serialize publish/commit sequences themselves.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    async fn tx_select(&self) -> Result<(), BrokerError>;

    async fn tx_commit(&self) -> Result<(), BrokerError>;

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BrokerError>;

    /// Declare a queue and return its name. An empty name asks the broker to pick one.
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    /// Current depth of an existing queue.
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Deliveries pushed to a consumer. `None` means the consumer was cancelled.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Build the transport named by the configuration.
pub fn from_kind(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Amqp => Arc::new(AmqpTransport::new()),
        TransportKind::Memory => Arc::new(MemoryTransport::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_kind_connects_in_process() {
        let transport = from_kind(TransportKind::Memory);
        let endpoint = BrokerEndpoint::new("mem", 1);

        let connection = tokio_test::block_on(transport.connect(&endpoint)).unwrap();
        let channel = tokio_test::block_on(connection.open_channel()).unwrap();
        let name = tokio_test::block_on(channel.queue_declare("", QueueOptions::default())).unwrap();
        assert!(name.starts_with("amq.gen-"));
        tokio_test::block_on(connection.close()).unwrap();
    }
}
