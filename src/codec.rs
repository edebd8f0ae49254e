//! JSON encoding and decoding owned by a client.
//!
//! Each [`Client`](crate::Client) holds its own [`JsonCodec`] value, so
//! serialization settings never leak between unrelated clients.

use crate::{Error, Result};
use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes request bodies and deserializes response bodies.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    pretty: bool,
}

impl JsonCodec {
    /// Creates a codec that writes compact JSON.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes indented JSON request bodies. Useful when capturing traffic.
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Serializes a value into a request body.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let result = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        result
            .map(Bytes::from)
            .map_err(|e| Error::SerializationFailed(e.to_string()))
    }

    /// Deserializes a response body, keeping the raw text on failure.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], status: StatusCode) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            let raw_response = String::from_utf8_lossy(bytes).into_owned();
            tracing::error!(
                error = %e,
                raw_response = %raw_response,
                "Failed to deserialize response"
            );
            Error::DeserializationFailed {
                raw_response,
                serde_error: e.to_string(),
                status,
            }
        })
    }
}
