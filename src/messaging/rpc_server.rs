//! Reply side of the request/reply exchange.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::{AttemptError, Error, Result};
use crate::messaging::remaining;
use crate::pool::{EndpointPool, EndpointStatus, OpenMode};
use crate::transport::Transport;
use crate::types::{Message, MessagingConfig};

/// How long `run` waits on the endpoints before checking for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after every endpoint failed, before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consumes requests from the endpoint queues and publishes handler results
/// to each request's reply queue.
pub struct RpcServer {
    pool: EndpointPool,
}

impl RpcServer {
    pub fn new(config: &MessagingConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let pool = EndpointPool::from_config(config, OpenMode::Consume, transport)?;
        if let Some(endpoint) = pool.endpoints().find(|e| e.queue.is_none()) {
            return Err(Error::Config(format!("No request queue configured for {}", endpoint.address())));
        }
        Ok(Self { pool })
    }

    /// Handle at most one request. Returns `false` if none arrived within `timeout`.
    ///
    /// A request that fails in the handler is rejected without requeue and
    /// the handler error is returned.
    #[instrument(skip(self, handler))]
    pub async fn serve_once<H, Fut>(&self, handler: H, timeout: Duration) -> Result<bool>
    where
        H: Fn(Message) -> Fut,
        Fut: Future<Output = Result<Message>>,
    {
        let handler = &handler;

        let result = self
            .pool
            .run(move |holder| async move {
                let endpoint = holder.endpoint();
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
                let request = Message::from(delivery);
                let reply_to = request.reply_to.clone();
                let correlation_id = request.correlation_id.clone();

                let reply = match handler(request).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(endpoint = %endpoint.label(), error = %e, "Request handler failed");
                        if !endpoint.no_ack {
                            let _channel = holder.lock_channel().await;
                            holder.reject(tag, false).await?;
                        }
                        return Err(AttemptError::Fatal(e));
                    }
                };

                let _channel = holder.lock_channel().await;
                match reply_to {
                    Some(reply_to) => {
                        let reply = match correlation_id {
                            Some(id) => reply.with_correlation_id(id),
                            None => reply,
                        };
                        holder
                            .publish("", &reply_to, &reply.payload, &reply.properties(1))
                            .await?;
                    }
                    None => warn!(endpoint = %endpoint.label(), "Request has no reply queue, reply dropped"),
                }
                if !endpoint.no_ack {
                    holder.ack(tag).await?;
                }
                Ok(true)
            })
            .await;

        match result {
            Err(Error::Idle) => Ok(false),
            other => other,
        }
    }

    /// Serve requests until `shutdown` turns true or its sender is dropped,
    /// then close every connection.
    pub async fn run<H, Fut>(&self, handler: H, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        H: Fn(Message) -> Fut,
        Fut: Future<Output = Result<Message>>,
    {
        info!(endpoints = self.pool.len(), "RPC server started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                served = self.serve_once(&handler, POLL_INTERVAL) => match served {
                    Ok(_) => {}
                    Err(e @ Error::Exhausted { .. }) => {
                        warn!(error = %e, "No endpoint reachable, retrying");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serve request"),
                },
            }
        }

        self.pool.close_all().await;
        info!("RPC server stopped");
        Ok(())
    }

    pub fn status(&self) -> Vec<EndpointStatus> {
        self.pool.status()
    }
}
