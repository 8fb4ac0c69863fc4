//! Payload encoding.
//!
//! Job payloads cross process and language boundaries, so the wire encoding
//! must be self-describing: a consumer decodes a message into its own
//! expected shape without sharing a schema registry with the producer. JSON is
//! the default, CBOR is offered for binary-heavy payloads.
//!
//! # Examples
//!
//! ```rust
//! use jobwire::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Pin {
//!    cid: String,
//! }
//!
//! let pin = Pin { cid: "Qm123".to_string() };
//! let bytes = Serializer::Json.to_bytes(&pin).unwrap();
//! assert_eq!(bytes, br#"{"cid":"Qm123"}"#);
//! let decoded: Pin = Serializer::Json.from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, pin);
//! ```

use anyhow::anyhow;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::{
    config::{self, Config},
    error::{QueueError, Result},
};

/// Shorthand for payloads that can be handed to a handler task.
///
/// Handler tasks are spawned onto the runtime, hence the `Send`, `Sync` and
/// `'static` requirements.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Provides a unified interface for encoding and decoding payloads.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Json,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Serializes the given value into bytes using the specified format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| QueueError::Serialization(e.into()))
            }
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)
                    .map_err(|e| QueueError::Serialization(e.into()))?;
                Ok(result)
            }
        }
    }

    /// Deserializes the given bytes into a value of the specified type.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| QueueError::Serialization(e.into()))
            }
            Self::Cbor => {
                ciborium::from_reader(bytes).map_err(|e| QueueError::Serialization(e.into()))
            }
        }
    }

    /// The MIME type stamped on published messages.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Cbor => "application/cbor",
        }
    }

    /// Maps a message's content type back to a serializer, if it names one.
    ///
    /// Unknown content types (`text/plain` from older publishers, for
    /// instance) yield `None` and are decoded with the consumer's own format.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/json" => Some(Self::Json),
            "application/cbor" => Some(Self::Cbor),
            _ => None,
        }
    }

    /// Rejects a delivery whose content type names a different encoding.
    pub(crate) fn check_content_type(&self, content_type: Option<&str>) -> Result<()> {
        match content_type.and_then(Self::from_content_type) {
            Some(other) if other != *self => Err(QueueError::Serialization(anyhow!(
                "message encoded as {other}, consumer expects {self}"
            ))),
            _ => Ok(()),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Json => Self::Json,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn cbor_round_trip() {
        let value = json!({"job": "pin", "cid": "Qm123"});
        let bytes = Serializer::Cbor.to_bytes(&value).unwrap();
        let decoded: serde_json::Value = Serializer::Cbor.from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn malformed_json_is_serialization_error() {
        let result: Result<serde_json::Value> = Serializer::Json.from_bytes(b"{not json");
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }

    #[test]
    fn content_type_mismatch() {
        assert!(Serializer::Json
            .check_content_type(Some("application/cbor"))
            .is_err());
        assert!(Serializer::Json
            .check_content_type(Some("application/json"))
            .is_ok());
        assert!(Serializer::Json.check_content_type(Some("text/plain")).is_ok());
        assert!(Serializer::Cbor.check_content_type(None).is_ok());
    }
}
