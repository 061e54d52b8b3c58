//! Canonical event envelope
//!
//! Every adapter turns its source-specific message into a [`NormalizedEvent`]
//! before anything is handed to the dispatch pipeline. The envelope carries
//! the topic (or file path) the message arrived on, the raw body, and the
//! descriptor metadata.

use std::collections::BTreeMap;

/// How the envelope body is carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    /// Arbitrary bytes, written as a base64 string
    Opaque(Vec<u8>),
    /// Bytes declared to be JSON, embedded as a structured value
    Json(Vec<u8>),
}

impl EventBody {
    /// Raw payload bytes regardless of representation
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            EventBody::Opaque(bytes) | EventBody::Json(bytes) => bytes,
        }
    }

    /// Whether the body is embedded as structured JSON
    pub fn is_json(&self) -> bool {
        matches!(self, EventBody::Json(_))
    }
}

/// Canonical envelope produced by normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    /// Topic, channel or path the message arrived on
    pub topic: String,
    /// Message body
    pub body: EventBody,
    /// Metadata from the descriptor, copied verbatim
    pub metadata: BTreeMap<String, String>,
}

impl NormalizedEvent {
    /// Build an envelope; `json_body` selects the body representation
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        json_body: bool,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let body = if json_body {
            EventBody::Json(payload)
        } else {
            EventBody::Opaque(payload)
        };
        Self {
            topic: topic.into(),
            body,
            metadata,
        }
    }
}
