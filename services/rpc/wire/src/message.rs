//! Generic message exchanged between dispatch layers.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::header::MessageKind;

/// A fully assembled message.
///
/// `target` and `method` identify the remote interface and operation; the
/// payload is opaque and serialized by the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    /// Message kind
    pub kind: MessageKind,
    /// Correlates a response with its request
    pub request_id: u64,
    /// Interface or service name
    pub target: Option<String>,
    /// Method name
    pub method: Option<String>,
    /// Free-form headers
    pub headers: BTreeMap<String, Vec<u8>>,
    /// Serialized arguments or return value
    pub payload: Bytes,
}

impl GenericMessage {
    /// Build a request for `target.method`
    pub fn request(request_id: u64, target: &str, method: &str, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::Request,
            request_id,
            target: Some(target.to_string()),
            method: Some(method.to_string()),
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Build a one-way invocation for `target.method`
    pub fn one_way(target: &str, method: &str, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::OneWay,
            ..Self::request(0, target, method, payload)
        }
    }

    /// Build the response to this message, keeping its request id
    pub fn response(&self, payload: Bytes) -> Self {
        Self {
            kind: MessageKind::Response,
            request_id: self.request_id,
            target: self.target.clone(),
            method: self.method.clone(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    /// Build an exception reply carrying `reason` as payload
    pub fn exception(&self, reason: &str) -> Self {
        Self {
            kind: MessageKind::Exception,
            ..self.response(Bytes::copy_from_slice(reason.as_bytes()))
        }
    }

    /// Attach a header
    pub fn with_header(mut self, key: &str, value: &[u8]) -> Self {
        self.headers.insert(key.to_string(), value.to_vec());
        self
    }
}
