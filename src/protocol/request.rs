//! Control and publish requests
//!
//! Clients send form-encoded requests next to their stream. Two fields are
//! reserved (`metadata.id`, `metadata.type`); everything else is chat content
//! that gets encoded into the broadcast payload.

use std::str::FromStr;

use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, Serializer};

use super::{ProtocolError, ProtocolResult};

/// Field carrying the sender's connection id
pub const METADATA_ID: &str = "metadata.id";

/// Field carrying the request type
pub const METADATA_TYPE: &str = "metadata.type";

/// Prefix of reserved fields that are never broadcast
pub const METADATA_PREFIX: &str = "metadata.";

/// Kind of control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestType {
    /// Publish the request's fields to every open stream
    #[default]
    Send,
    /// Close the stream named by `metadata.id`
    Close,
}

impl FromStr for RequestType {
    type Err = std::convert::Infallible;

    /// Anything other than `close` is treated as `send`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "close" => RequestType::Close,
            _ => RequestType::Send,
        })
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Send => write!(f, "send"),
            RequestType::Close => write!(f, "close"),
        }
    }
}

/// A decoded control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Sender's connection id. Advisory for `send`, required to act on `close`.
    pub id: Option<String>,
    /// Request type
    pub kind: RequestType,
    /// Non-metadata fields, in submission order
    pub message: ChatMessage,
}

impl ControlRequest {
    /// Build a request from decoded form pairs
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut id = None;
        let mut kind = RequestType::Send;
        let mut message = ChatMessage::new();

        for (name, value) in pairs {
            match name.as_str() {
                METADATA_ID => id = Some(value).filter(|v| !v.is_empty()),
                METADATA_TYPE => kind = value.parse().unwrap_or_default(),
                _ if name.starts_with(METADATA_PREFIX) => {}
                _ => message.insert(name, value),
            }
        }

        Self { id, kind, message }
    }
}

/// Chat content encoded as a flat JSON object
///
/// Field order follows first insertion; re-inserting a field replaces its
/// value without moving it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessage {
    fields: Vec<(String, String)>,
}

impl ChatMessage {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder-style [`ChatMessage::insert`]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a field value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the message has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode as a JSON payload, rejecting anything over `limit` bytes
    pub fn encode(&self, limit: usize) -> ProtocolResult<Bytes> {
        let payload = serde_json::to_vec(self)?;
        if payload.len() > limit {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                limit,
            });
        }
        Ok(Bytes::from(payload))
    }
}

impl Serialize for ChatMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
