//! HTTP request handlers for the relay service.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Error;
use crate::messaging::Publisher;
use crate::pool::EndpointStatus;

/// Application state shared across handlers.
pub struct AppState {
    pub publisher: Arc<Publisher>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    endpoints: Vec<EndpointStatus>,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints: state.publisher.status(),
    })
}

/// Publish response.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    accepted: bool,
    message: Option<String>,
}

/// Publish the request body as a text message.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, Json<PublishResponse>) {
    match state.publisher.publish_text(&body).await {
        Ok(()) => {
            info!(bytes = body.len(), "Relayed message");
            (
                StatusCode::ACCEPTED,
                Json(PublishResponse {
                    accepted: true,
                    message: None,
                }),
            )
        }
        Err(e) => {
            warn!(error = %e, "Failed to relay message");
            (
                status_for(&e),
                Json(PublishResponse {
                    accepted: false,
                    message: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Queue depth response.
#[derive(Debug, Serialize)]
pub struct QueueDepthResponse {
    depth: u32,
}

/// Depth of the configured queue.
pub async fn queue_depth(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueDepthResponse>, StatusCode> {
    state
        .publisher
        .queue_depth()
        .await
        .map(|depth| Json(QueueDepthResponse { depth }))
        .map_err(|e| {
            warn!(error = %e, "Failed to read queue depth");
            status_for(&e)
        })
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Config(_) | Error::Codec(_) => StatusCode::BAD_REQUEST,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Exhausted { .. } | Error::Transient(_) | Error::Idle => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{BrokerEndpoint, MessagingConfig};

    fn state(port: u16) -> (Arc<AppState>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let config = MessagingConfig::with_endpoints(vec![BrokerEndpoint::new("mem", port).with_queue("relay")]);
        let publisher = Arc::new(Publisher::new(&config, transport.clone()).unwrap());
        (Arc::new(AppState { publisher }), transport)
    }

    #[tokio::test]
    async fn test_publish_then_depth() {
        let (state, transport) = state(1);

        let (status, _) = publish(State(state.clone()), "hello".to_string()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(transport.node("mem:1").queue_depth("relay"), 1);

        let Json(depth) = queue_depth(State(state)).await.unwrap();
        assert_eq!(depth.depth, 1);
    }

    #[tokio::test]
    async fn test_empty_body_is_bad_request() {
        let (state, _) = state(2);
        let (status, Json(body)) = publish(State(state), String::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.accepted);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable() {
        let (state, transport) = state(3);
        transport.node("mem:3").set_reachable(false);

        let (status, _) = publish(State(state.clone()), "hello".to_string()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let Json(health) = health_check(State(state)).await;
        assert!(!health.endpoints[0].connected);
        assert!(health.endpoints[0].last_failure.is_some());
    }
}
