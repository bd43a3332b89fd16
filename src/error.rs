//! Error types for the broker pool.

use std::time::Duration;

use thiserror::Error;

/// Main error type surfaced to callers of the publisher, consumer and RPC client.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration, or a message that cannot be sent.
    #[error("Config error: {0}")]
    Config(String),

    /// Every configured endpoint failed within one logical call.
    #[error("All {attempts} endpoints failed, last tried {endpoint}: {source}")]
    Exhausted {
        endpoint: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },

    /// No reply arrived for an RPC request in time.
    #[error("No reply from {endpoint} within {}ms", .timeout.as_millis())]
    Timeout { endpoint: String, timeout: Duration },

    /// Payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Broker failure on a single endpoint. Retried by the pool, callers do not see it.
    #[error("Broker error: {0}")]
    Transient(#[from] BrokerError),

    /// Every reachable endpoint was polled and none had a message. The consumer reports it as `None`.
    #[error("No endpoint had a message within the timeout")]
    Idle,
}

/// Transport-level failures reported by a broker connection or channel.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => BrokerError::Io(e.to_string()),
            lapin::Error::InvalidChannelState(state) => {
                BrokerError::Channel(format!("invalid channel state: {:?}", state))
            }
            lapin::Error::InvalidConnectionState(state) => {
                BrokerError::ConnectionClosed(format!("invalid connection state: {:?}", state))
            }
            lapin::Error::ProtocolError(e) => BrokerError::Protocol(e.to_string()),
            other => BrokerError::Io(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Outcome of a single attempt against one endpoint, as seen by the pool.
#[derive(Debug)]
pub enum AttemptError {
    /// The endpoint is unhealthy: drop its holder and move to the next one.
    Transient(BrokerError),
    /// The endpoint is healthy but had nothing to offer: move on without reconnecting.
    Idle,
    /// Stop iterating and surface the error.
    Fatal(Error),
}

impl From<BrokerError> for AttemptError {
    fn from(err: BrokerError) -> Self {
        AttemptError::Transient(err)
    }
}

impl From<Error> for AttemptError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transient(e) => AttemptError::Transient(e),
            Error::Idle => AttemptError::Idle,
            other => AttemptError::Fatal(other),
        }
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_converts_to_retryable_attempt() {
        let err = Error::Transient(BrokerError::Io("reset".into()));
        assert!(matches!(AttemptError::from(err), AttemptError::Transient(_)));

        let err = Error::Config("empty message".into());
        assert!(matches!(AttemptError::from(err), AttemptError::Fatal(Error::Config(_))));
    }

    #[test]
    fn test_exhausted_names_last_endpoint() {
        let err = Error::Exhausted {
            endpoint: "b:5672".into(),
            attempts: 2,
            source: BrokerError::ConnectionRefused("b:5672".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("b:5672"));
        assert!(msg.contains("All 2 endpoints"));
    }
}
