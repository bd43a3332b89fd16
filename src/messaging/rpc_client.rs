//! Request/reply over a private reply queue per connection.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{AttemptError, BrokerError, Error, Result};
use crate::messaging::remaining;
use crate::pool::{EndpointPool, EndpointStatus, OpenMode};
use crate::transport::Transport;
use crate::types::{Message, MessagingConfig, PayloadKind};

/// Sends a request and waits for the correlated reply.
///
/// Broker failures move the request to the next endpoint. A missing reply
/// does not: it fails with [`Error::Timeout`] and leaves the connection in place.
pub struct RpcClient {
    pool: EndpointPool,
}

impl RpcClient {
    pub fn new(config: &MessagingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self::with_pool(EndpointPool::from_config(config, OpenMode::Rpc, transport)?))
    }

    pub fn with_pool(pool: EndpointPool) -> Self {
        Self { pool }
    }

    /// Serialize `request`, send it and deserialize the reply.
    pub async fn send<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send_message(Message::json(request)?, timeout).await?.to_value()
    }

    pub async fn send_text(&self, text: &str, timeout: Duration) -> Result<String> {
        self.send_message(Message::text(text)?, timeout).await?.to_text()
    }

    pub async fn send_bytes(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let reply = self
            .send_message(Message::bytes(payload, PayloadKind::Json)?, timeout)
            .await?;
        Ok(reply.payload)
    }

    /// Send `message` and wait up to `timeout` for its reply; zero waits forever.
    #[instrument(skip(self, message), fields(bytes = message.payload.len()))]
    pub async fn send_message(&self, message: Message, timeout: Duration) -> Result<Message> {
        let message = &message;

        self.pool
            .run(move |holder| async move {
                let endpoint = holder.endpoint();
                let reply_queue = holder
                    .reply_queue()
                    .ok_or_else(|| BrokerError::ConnectionClosed(endpoint.address()))?;
                let correlation_id = Uuid::new_v4().to_string();
                let request = message
                    .clone()
                    .with_correlation_id(correlation_id.as_str())
                    .with_reply_to(reply_queue);

                // One request in flight per reply queue; queueing for it counts against the timeout
                let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
                let Some(mut replies) = holder.consumer_until(deadline).await else {
                    return Err(timed_out(endpoint.label(), timeout));
                };
                {
                    let _channel = holder.lock_channel().await;
                    holder
                        .publish(
                            &endpoint.exchange,
                            endpoint.publish_routing_key(),
                            &request.payload,
                            &request.properties(endpoint.delivery_mode()),
                        )
                        .await?;
                }

                loop {
                    let left = remaining(deadline);
                    if matches!(left, Some(left) if left.is_zero()) {
                        return Err(timed_out(endpoint.label(), timeout));
                    }

                    match replies.next(left).await? {
                        None => return Err(timed_out(endpoint.label(), timeout)),
                        Some(reply) if reply.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) => {
                            return Ok(Message::from(reply));
                        }
                        Some(stale) => {
                            debug!(
                                endpoint = %endpoint.label(),
                                correlation_id = ?stale.properties.correlation_id,
                                "Discarding reply to another request"
                            );
                        }
                    }
                }
            })
            .await
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.pool.status()
    }

    pub async fn close_connections(&self) {
        self.pool.close_all().await;
    }
}

fn timed_out(endpoint: String, timeout: Duration) -> AttemptError {
    AttemptError::Fatal(Error::Timeout { endpoint, timeout })
}
