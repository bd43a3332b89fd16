//! Broker endpoint configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{DEFAULT_AMQP_PORT, DEFAULT_COMMIT_BATCH_SIZE, DEFAULT_HEARTBEAT_SECS};

/// Exchange type used when declaring the endpoint's exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// Parse a case-insensitive exchange type name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "fanout" => Some(Self::Fanout),
            "topic" => Some(Self::Topic),
            "headers" => Some(Self::Headers),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

/// Connection and routing parameters for one broker target.
///
/// Endpoints are immutable once handed to a pool. Several endpoints usually
/// describe replicas or shards of the same logical destination, and their
/// order defines the round-robin sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    /// Broker host name or address
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub virtual_host: String,
    /// Heartbeat interval negotiated with the broker, 0 disables heartbeats
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u16,
    /// Exchange to publish to; empty means the default exchange
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    #[serde(default)]
    pub routing_key: String,
    /// Queue to consume from and to bind to the exchange
    #[serde(default)]
    pub queue: Option<String>,
    /// Persist messages and publish them inside transactions
    #[serde(default)]
    pub durable: bool,
    /// Let the broker acknowledge deliveries on send
    #[serde(default)]
    pub no_ack: bool,
    /// Never put the channel into transactional mode
    #[serde(default)]
    pub disable_transaction: bool,
    /// Durable publishes between two transaction commits
    #[serde(default = "default_commit_batch_size")]
    pub commit_batch_size: u32,
    /// Skip exchange/queue declaration and binding
    #[serde(default)]
    pub use_predeclared_queues: bool,
}

fn default_port() -> u16 {
    DEFAULT_AMQP_PORT
}

fn default_credential() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_heartbeat() -> u16 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_commit_batch_size() -> u32 {
    DEFAULT_COMMIT_BATCH_SIZE
}

impl BrokerEndpoint {
    /// Create an endpoint with default credentials, vhost and routing.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: default_credential(),
            password: default_credential(),
            virtual_host: default_vhost(),
            heartbeat_secs: default_heartbeat(),
            exchange: String::new(),
            exchange_kind: ExchangeKind::default(),
            routing_key: String::new(),
            queue: None,
            durable: false,
            no_ack: false,
            disable_transaction: false,
            commit_batch_size: default_commit_batch_size(),
            use_predeclared_queues: false,
        }
    }

    /// Parse `host` or `host:port`.
    pub fn parse_address(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid port in address: {}", addr)))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(addr, DEFAULT_AMQP_PORT)),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    pub fn with_heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchange = exchange.into();
        self.exchange_kind = kind;
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_disable_transaction(mut self, disable: bool) -> Self {
        self.disable_transaction = disable;
        self
    }

    pub fn with_commit_batch_size(mut self, size: u32) -> Self {
        self.commit_batch_size = size;
        self
    }

    pub fn with_predeclared_queues(mut self, predeclared: bool) -> Self {
        self.use_predeclared_queues = predeclared;
        self
    }

    /// `host:port` of the broker.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Short description used in logs and error messages.
    pub fn label(&self) -> String {
        match &self.queue {
            Some(queue) => format!("{}:{}{} queue={}", self.host, self.port, self.virtual_host, queue),
            None => format!(
                "{}:{}{} exchange={} key={}",
                self.host, self.port, self.virtual_host, self.exchange, self.routing_key
            ),
        }
    }

    /// Routing key used when publishing. On the default exchange with no key
    /// set, messages go straight to the endpoint queue.
    pub fn publish_routing_key(&self) -> &str {
        if self.exchange.is_empty() && self.routing_key.is_empty() {
            self.queue.as_deref().unwrap_or("")
        } else {
            &self.routing_key
        }
    }

    /// Whether the channel runs in transactional mode.
    pub fn wants_transactions(&self) -> bool {
        self.durable && !self.disable_transaction
    }

    /// Durable messages were asked for but transactions were switched off.
    pub fn has_tx_conflict(&self) -> bool {
        self.durable && self.disable_transaction
    }

    /// Delivery mode for published messages: 2 persists, 1 does not.
    pub fn delivery_mode(&self) -> u8 {
        if self.durable {
            2
        } else {
            1
        }
    }

    /// Basic sanity checks.
    ///
    /// The durable + disable-transaction conflict is accepted here and only
    /// reported when a commit would be due; see [`validate_strict`](Self::validate_strict).
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("Endpoint host is empty".to_string()));
        }
        if self.commit_batch_size == 0 {
            return Err(Error::Config(format!(
                "commit_batch_size must be at least 1 for {}",
                self.address()
            )));
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), but also rejects durable endpoints
    /// with transactions disabled instead of deferring the problem to commit time.
    pub fn validate_strict(&self) -> Result<()> {
        self.validate()?;
        if self.has_tx_conflict() {
            return Err(Error::Config(format!(
                "{} is durable but has transactions disabled; durable messages would never be committed",
                self.address()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_address() {
        let ep = BrokerEndpoint::parse_address("mq1.internal:5673").unwrap();
        assert_eq!(ep.host, "mq1.internal");
        assert_eq!(ep.port, 5673);

        let ep = BrokerEndpoint::parse_address(" mq2 ").unwrap();
        assert_eq!(ep.address(), "mq2:5672");

        assert!(BrokerEndpoint::parse_address("mq3:notaport").is_err());
    }

    #[test]
    fn test_tx_conflict_only_rejected_in_strict_mode() {
        let ep = BrokerEndpoint::new("localhost", 5672)
            .with_durable(true)
            .with_disable_transaction(true);

        assert!(ep.has_tx_conflict());
        assert!(!ep.wants_transactions());
        assert!(ep.validate().is_ok());
        assert!(matches!(ep.validate_strict(), Err(Error::Config(_))));
    }

    #[test]
    fn test_default_exchange_routes_to_queue() {
        let ep = BrokerEndpoint::new("localhost", 5672).with_queue("jobs");
        assert_eq!(ep.publish_routing_key(), "jobs");

        let ep = ep.with_exchange("events", ExchangeKind::Topic).with_routing_key("jobs.created");
        assert_eq!(ep.publish_routing_key(), "jobs.created");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let ep = BrokerEndpoint::new("localhost", 5672).with_commit_batch_size(0);
        assert!(ep.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let ep: BrokerEndpoint =
            serde_json::from_str(r#"{"host": "rabbit", "queue": "jobs", "exchange_kind": "topic"}"#).unwrap();
        assert_eq!(ep.port, 5672);
        assert_eq!(ep.virtual_host, "/");
        assert_eq!(ep.commit_batch_size, 1);
        assert_eq!(ep.exchange_kind, ExchangeKind::Topic);
        assert_eq!(ep.queue.as_deref(), Some("jobs"));
        assert_eq!(ep.delivery_mode(), 1);
    }
}
