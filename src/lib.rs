//! Broker Pool Library
//!
//! A resilient multi-broker messaging client. Publishes, consumes and performs
//! request/reply against a list of broker endpoints, failing over to the next
//! endpoint when one is unreachable.

pub mod api;
pub mod error;
pub mod messaging;
pub mod pool;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use messaging::{Consumer, Publisher, RpcClient, RpcServer};
pub use pool::{EndpointPool, EndpointStatus};
pub use transport::{AmqpTransport, MemoryTransport, Transport};
pub use types::{BrokerEndpoint, Message, MessagingConfig, SelectionPolicy};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::messaging::*;
    pub use crate::transport::{AmqpTransport, MemoryTransport, Transport};
    pub use crate::types::*;
}

/// Default AMQP port
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u16 = 60;

/// Default number of durable publishes per transaction commit
pub const DEFAULT_COMMIT_BATCH_SIZE: u32 = 1;
