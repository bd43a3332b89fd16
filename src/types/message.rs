//! Message envelope types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// How a payload was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// UTF-8 text
    Text,
    /// A serialized value
    Json,
}

impl PayloadKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text => CONTENT_TYPE_TEXT,
            Self::Json => CONTENT_TYPE_JSON,
        }
    }

    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.starts_with("text/") => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Basic properties carried next to a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A message received from a broker channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message on its way to or from a client, not stored anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub kind: PayloadKind,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Message {
    /// A UTF-8 text message. Empty text is rejected.
    pub fn text(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::Config("Message is empty".to_string()));
        }
        Ok(Self {
            payload: text.as_bytes().to_vec(),
            kind: PayloadKind::Text,
            correlation_id: None,
            reply_to: None,
        })
    }

    /// A serialized value. `null` and empty encodings are rejected.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        if payload.is_empty() || payload == b"null" {
            return Err(Error::Config("Message is null".to_string()));
        }
        Ok(Self {
            payload,
            kind: PayloadKind::Json,
            correlation_id: None,
            reply_to: None,
        })
    }

    /// Raw bytes tagged with the given kind.
    pub fn bytes(payload: Vec<u8>, kind: PayloadKind) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Config("Message is empty".to_string()));
        }
        Ok(Self {
            payload,
            kind,
            correlation_id: None,
            reply_to: None,
        })
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Properties to publish this message with.
    pub fn properties(&self, delivery_mode: u8) -> MessageProperties {
        MessageProperties {
            content_type: Some(self.kind.content_type().to_string()),
            delivery_mode: Some(delivery_mode),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
        }
    }

    /// Decode the payload as UTF-8 text.
    pub fn to_text(&self) -> Result<String> {
        String::from_utf8(self.payload.clone())
            .map_err(|e| Error::Codec(format!("Payload is not UTF-8: {}", e)))
    }

    /// Deserialize the payload.
    pub fn to_value<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Self {
            kind: PayloadKind::from_content_type(delivery.properties.content_type.as_deref()),
            payload: delivery.payload,
            correlation_id: delivery.properties.correlation_id,
            reply_to: delivery.properties.reply_to,
        }
    }
}
