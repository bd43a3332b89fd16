//! AMQP transport backed by lapin.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerConnection, DeliveryStream, QueueOptions, ShutdownHook, Transport};
use crate::error::BrokerError;
use crate::types::{BrokerEndpoint, Delivery, ExchangeKind, MessageProperties};

const REPLY_SUCCESS: u16 = 200;

/// Transport that speaks AMQP 0-9-1 through lapin.
#[derive(Debug, Default, Clone)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }

    fn uri(endpoint: &BrokerEndpoint) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: endpoint.username.clone(),
                    password: endpoint.password.clone(),
                },
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
            vhost: endpoint.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(endpoint.heartbeat_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect_uri(Self::uri(endpoint), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionRefused(format!("{}: {}", endpoint.address(), e)))?;

        info!(endpoint = %endpoint.address(), "AMQP connection established");

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn on_shutdown(&self, hook: ShutdownHook) {
        self.inner.on_error(move |err: lapin::Error| {
            warn!(error = %err, "AMQP connection lost");
            hook(&err.to_string());
        });
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }
    if let Some(mode) = props.delivery_mode {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(id) = &props.correlation_id {
        properties = properties.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    properties
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: *props.delivery_mode(),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn basic_qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.inner.basic_qos(prefetch, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), BrokerError> {
        self.inner.tx_select().await?;
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), BrokerError> {
        self.inner.tx_commit().await?;
        Ok(())
    }

    async fn exchange_declare(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), BrokerError> {
        self.inner
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let declared = self
            .inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(declared.message_count())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        Ok(Box::new(AmqpDeliveryStream { inner: consumer }))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

struct AmqpDeliveryStream {
    inner: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let delivery = self.inner.next().await?;
        Some(
            delivery
                .map(|d| Delivery {
                    delivery_tag: d.delivery_tag,
                    properties: from_basic_properties(&d.properties),
                    payload: d.data,
                })
                .map_err(BrokerError::from),
        )
    }
}
