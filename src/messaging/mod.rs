//! # Messaging clients
//!
//! Publisher, consumer and request/reply clients, each driving its own
//! [`EndpointPool`](crate::pool::EndpointPool) so broker endpoints fail over
//! independently per client.
//!
//! ## Features
//! - Round-robin or sticky endpoint selection with one pass of retries
//! - Transactional commit batching for durable endpoints
//! - Timed consumption with explicit acknowledgement
//! - Correlated request/reply over private reply queues

use std::time::Duration;

use tokio::time::Instant;

mod consumer;
mod publisher;
mod rpc_client;
mod rpc_server;

pub use consumer::Consumer;
pub use publisher::Publisher;
pub use rpc_client::RpcClient;
pub use rpc_server::RpcServer;

/// Time left before `deadline`; `None` means no deadline.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}
