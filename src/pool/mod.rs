//! Endpoint pool and per-endpoint connection holders.

mod endpoint_pool;
mod holder;

pub use endpoint_pool::{EndpointPool, EndpointStatus};
pub use holder::{ConnectionHolder, ConsumerLease, OpenMode};
