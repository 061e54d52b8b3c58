//! Event normalization and wire serialization
//!
//! Wire form of an event:
//!
//! ```json
//! {"topic":"orders","body":"aGVsbG8=","metadata":{"team":"checkout"}}
//! ```
//!
//! An opaque body is a base64 string. A JSON body is embedded as-is, so a
//! payload of `{"a":1}` appears as `"body":{"a":1}`. Metadata keys are sorted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::BTreeMap;

use types::{EventBody, NormalizedEvent};

use super::subscription::InboundMessage;
use crate::error::MessageProcessingError;

/// Build the canonical envelope for one inbound message
///
/// The JSON-body flag is taken from the descriptor, never inferred from the
/// payload.
pub fn normalize(
    message: &InboundMessage,
    metadata: &BTreeMap<String, String>,
    json_body: bool,
) -> NormalizedEvent {
    NormalizedEvent::new(
        message.topic.clone(),
        message.payload.to_vec(),
        json_body,
        metadata.clone(),
    )
}

#[derive(Serialize)]
struct WireEvent<'a, B: Serialize> {
    topic: &'a str,
    body: B,
    metadata: &'a BTreeMap<String, String>,
}

/// Serialize an envelope to its JSON wire form
///
/// Fails when a JSON body is not valid UTF-8 or not valid JSON.
pub fn serialize(event: &NormalizedEvent) -> Result<Vec<u8>, MessageProcessingError> {
    let bytes = match &event.body {
        EventBody::Opaque(payload) => serde_json::to_vec(&WireEvent {
            topic: &event.topic,
            body: STANDARD.encode(payload),
            metadata: &event.metadata,
        })?,
        EventBody::Json(payload) => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| MessageProcessingError::BodyNotUtf8)?;
            let raw = RawValue::from_string(text.trim().to_string())?;
            serde_json::to_vec(&WireEvent {
                topic: &event.topic,
                body: raw,
                metadata: &event.metadata,
            })?
        }
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn message(topic: &str, payload: &'static [u8]) -> InboundMessage {
        InboundMessage::new(topic, payload)
    }

    #[test]
    fn test_opaque_body_is_base64() {
        let event = normalize(&message("c", b"hello"), &BTreeMap::new(), false);
        let wire = serialize(&event).unwrap();

        assert_eq!(
            String::from_utf8(wire).unwrap(),
            r#"{"topic":"c","body":"aGVsbG8=","metadata":{}}"#
        );
    }

    #[test]
    fn test_json_body_is_embedded() {
        let mut metadata = BTreeMap::new();
        metadata.insert("team".to_string(), "checkout".to_string());

        let event = normalize(&message("c", br#"{"a":1}"#), &metadata, true);
        let wire: Value = serde_json::from_slice(&serialize(&event).unwrap()).unwrap();

        assert_eq!(wire["body"], json!({"a": 1}));
        assert_eq!(wire["metadata"]["team"], "checkout");
    }

    #[test]
    fn test_json_flag_is_explicit() {
        // Looks like JSON but the flag is off: stays opaque
        let event = normalize(&message("c", br#"{"a":1}"#), &BTreeMap::new(), false);
        let wire: Value = serde_json::from_slice(&serialize(&event).unwrap()).unwrap();
        let decoded = STANDARD.decode(wire["body"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, br#"{"a":1}"#);
    }

    #[test]
    fn test_invalid_json_body_fails() {
        let event = normalize(&message("c", b"not json"), &BTreeMap::new(), true);
        assert!(matches!(
            serialize(&event),
            Err(MessageProcessingError::Serialize(_))
        ));

        let event = normalize(&message("c", &[0xff, 0xfe]), &BTreeMap::new(), true);
        assert!(matches!(
            serialize(&event),
            Err(MessageProcessingError::BodyNotUtf8)
        ));
    }

    #[test]
    fn test_serialization_is_stable() {
        let mut metadata = BTreeMap::new();
        metadata.insert("z".to_string(), "1".to_string());
        metadata.insert("a".to_string(), "2".to_string());
        let msg = message("orders", b"payload");

        let first = serialize(&normalize(&msg, &metadata, false)).unwrap();
        let second = serialize(&normalize(&msg, &metadata, false)).unwrap();
        assert_eq!(first, second);
        assert!(String::from_utf8(first).unwrap().contains(r#"{"a":"2","z":"1"}"#));
    }
}
