//! Core types for the messaging clients.

mod config;
mod endpoint;
mod message;

pub use config::{MessagingConfig, SelectionPolicy, TransportKind};
pub use endpoint::{BrokerEndpoint, ExchangeKind};
pub use message::{
    Delivery, Message, MessageProperties, PayloadKind, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
};
