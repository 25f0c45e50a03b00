//! Codec seam and CBOR metadata helpers.
//!
//! The transport never interprets message contents. It only hands raw bytes
//! to a [`MessageCodec`] and queues whatever complete messages come back.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::WireError;

/// Converts a raw byte stream into discrete messages and back.
///
/// Implementations are cloned once per connection, so any partial-decode
/// state lives in the clone owned by that connection's read loop.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Fully assembled application message
    type Message: Send + 'static;

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete message; the
    /// caller must read more bytes and try again. An error means the stream
    /// is malformed and the connection is unusable.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Message>, WireError>;

    /// Append the encoded form of `message` to `dst`
    fn encode(&mut self, message: &Self::Message, dst: &mut BytesMut) -> Result<(), WireError>;
}

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, WireError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| WireError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, WireError> {
    let value: ciborium::Value = ciborium::from_reader(meta_raw).map_err(|_| WireError::Meta)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(WireError::Meta)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}
