//! Configuration types for the messaging clients.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::endpoint::{BrokerEndpoint, ExchangeKind};
use crate::error::{Error, Result};
use crate::{DEFAULT_AMQP_PORT, DEFAULT_COMMIT_BATCH_SIZE, DEFAULT_HEARTBEAT_SECS};

/// How a pool picks the endpoint for the first attempt of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Cycle through endpoints with a shared, ever-increasing counter.
    #[default]
    RoundRobin,
    /// Prefer the endpoint of the last successful call.
    Sticky,
}

impl SelectionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "sticky" | "last_used" => Some(Self::Sticky),
            _ => None,
        }
    }
}

/// Which broker client library backs the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Amqp,
    /// In-process broker, for local runs and tests.
    Memory,
}

/// Messaging client configuration, built once by the hosting application
/// and passed to every client it constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Ordered broker endpoints; the order is the round-robin sequence
    pub endpoints: Vec<BrokerEndpoint>,

    /// Endpoint selection policy
    #[serde(default)]
    pub selection: SelectionPolicy,

    /// Reject durable endpoints with transactions disabled at construction time
    #[serde(default)]
    pub strict_validation: bool,

    /// Broker client backend
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![BrokerEndpoint::new("localhost", DEFAULT_AMQP_PORT)],
            selection: SelectionPolicy::default(),
            strict_validation: false,
            transport: TransportKind::default(),
        }
    }
}

impl MessagingConfig {
    /// Configuration for the given endpoints with default policies.
    pub fn with_endpoints(endpoints: Vec<BrokerEndpoint>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `BROKER_HOSTS` is a comma-separated list of `host[:port]`; every other
    /// setting is shared by all hosts.
    pub fn from_env() -> Result<Self> {
        let hosts = std::env::var("BROKER_HOSTS").unwrap_or_else(|_| "localhost".to_string());

        let username = std::env::var("BROKER_USERNAME").unwrap_or_else(|_| "guest".to_string());
        let password = std::env::var("BROKER_PASSWORD").unwrap_or_else(|_| "guest".to_string());
        let vhost = std::env::var("BROKER_VHOST").unwrap_or_else(|_| "/".to_string());
        let heartbeat = env_parse("BROKER_HEARTBEAT_SECS").unwrap_or(DEFAULT_HEARTBEAT_SECS);
        let exchange = std::env::var("BROKER_EXCHANGE").unwrap_or_default();
        let exchange_kind = std::env::var("BROKER_EXCHANGE_KIND")
            .ok()
            .and_then(|s| ExchangeKind::parse(&s))
            .unwrap_or_default();
        let routing_key = std::env::var("BROKER_ROUTING_KEY").unwrap_or_default();
        let queue = std::env::var("BROKER_QUEUE").ok().filter(|q| !q.is_empty());
        let batch = env_parse("BROKER_COMMIT_BATCH_SIZE").unwrap_or(DEFAULT_COMMIT_BATCH_SIZE);

        let mut endpoints = Vec::new();
        for addr in hosts.split(',').filter(|a| !a.trim().is_empty()) {
            let mut endpoint = BrokerEndpoint::parse_address(addr)?
                .with_credentials(username.clone(), password.clone())
                .with_virtual_host(vhost.clone())
                .with_heartbeat(heartbeat)
                .with_exchange(exchange.clone(), exchange_kind)
                .with_routing_key(routing_key.clone())
                .with_durable(env_parse("BROKER_DURABLE").unwrap_or(false))
                .with_no_ack(env_parse("BROKER_NO_ACK").unwrap_or(false))
                .with_disable_transaction(env_parse("BROKER_DISABLE_TRANSACTION").unwrap_or(false))
                .with_commit_batch_size(batch)
                .with_predeclared_queues(env_parse("BROKER_PREDECLARED_QUEUES").unwrap_or(false));
            endpoint.queue = queue.clone();
            endpoints.push(endpoint);
        }

        Ok(Self {
            endpoints,
            selection: std::env::var("BROKER_SELECTION")
                .ok()
                .and_then(|s| SelectionPolicy::parse(&s))
                .unwrap_or_default(),
            strict_validation: env_parse("BROKER_STRICT").unwrap_or(false),
            transport: match std::env::var("BROKER_TRANSPORT").as_deref() {
                Ok("memory") => TransportKind::Memory,
                _ => TransportKind::Amqp,
            },
        })
    }

    /// Load configuration from a file (TOML, YAML or JSON by extension),
    /// overlaid with `BROKER__*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(
                config::Environment::with_prefix("BROKER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every endpoint, strictly if `strict_validation` is set.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Config("No broker endpoints configured".to_string()));
        }
        for endpoint in &self.endpoints {
            if self.strict_validation {
                endpoint.validate_strict()?;
            } else {
                endpoint.validate()?;
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_selection_policy_parse() {
        assert_eq!(SelectionPolicy::parse("round-robin"), Some(SelectionPolicy::RoundRobin));
        assert_eq!(SelectionPolicy::parse("LAST_USED"), Some(SelectionPolicy::Sticky));
        assert_eq!(SelectionPolicy::parse("random"), None);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
selection = "sticky"

[[endpoints]]
host = "mq1"
queue = "orders"
durable = true
commit_batch_size = 10

[[endpoints]]
host = "mq2"
port = 5673
queue = "orders"
"#
        )
        .unwrap();

        let config = MessagingConfig::load(file.path()).unwrap();
        assert_eq!(config.selection, SelectionPolicy::Sticky);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].commit_batch_size, 10);
        assert!(config.endpoints[0].durable);
        assert_eq!(config.endpoints[1].address(), "mq2:5673");
        assert_eq!(config.transport, TransportKind::Amqp);
    }

    #[test]
    fn test_strict_validation_rejects_tx_conflict() {
        let endpoint = BrokerEndpoint::new("mq1", 5672)
            .with_durable(true)
            .with_disable_transaction(true);
        let mut config = MessagingConfig::with_endpoints(vec![endpoint]);

        assert!(config.validate().is_ok());
        config.strict_validation = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        let config = MessagingConfig::with_endpoints(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_shares_settings_across_hosts() {
        let vars = [
            ("BROKER_HOSTS", "mq1:5673, mq2,"),
            ("BROKER_USERNAME", "relay"),
            ("BROKER_QUEUE", "orders"),
            ("BROKER_DURABLE", "true"),
            ("BROKER_COMMIT_BATCH_SIZE", "25"),
            ("BROKER_SELECTION", "sticky"),
            ("BROKER_TRANSPORT", "memory"),
        ];
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        let config = MessagingConfig::from_env();
        for (name, _) in vars {
            std::env::remove_var(name);
        }
        let config = config.unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].address(), "mq1:5673");
        assert_eq!(config.endpoints[1].address(), format!("mq2:{}", DEFAULT_AMQP_PORT));
        for endpoint in &config.endpoints {
            assert_eq!(endpoint.username, "relay");
            assert_eq!(endpoint.password, "guest");
            assert_eq!(endpoint.queue.as_deref(), Some("orders"));
            assert!(endpoint.durable);
            assert_eq!(endpoint.commit_batch_size, 25);
            assert_eq!(endpoint.heartbeat_secs, DEFAULT_HEARTBEAT_SECS);
        }
        assert_eq!(config.selection, SelectionPolicy::Sticky);
        assert_eq!(config.transport, TransportKind::Memory);
        assert!(config.validate().is_ok());
    }
}
