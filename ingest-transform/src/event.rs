use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Transport attribute used by producers to supply their own idempotency token.
pub const INSERT_ID_ATTRIBUTE: &str = "insert_id";

/// Partition and offset a message was read at, used to rewind a failed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePosition {
    pub partition: i32,
    pub offset: i64,
}

/// A message as handed over by the bus client: opaque bytes plus transport attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub position: Option<MessagePosition>,
}

impl RawMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn at(mut self, partition: i32, offset: i64) -> Self {
        self.position = Some(MessagePosition { partition, offset });
        self
    }

    /// The producer-supplied idempotency token, ignoring blank values.
    pub fn insert_id(&self) -> Option<&str> {
        self.attributes
            .get(INSERT_ID_ATTRIBUTE)
            .map(String::as_str)
            .filter(|token| !token.trim().is_empty())
    }

    /// Decode the body of a push subscription request:
    /// `{"message": {"data": "<base64>", "attributes": {...}}}`.
    pub fn from_push_envelope(body: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: PushEnvelope = serde_json::from_slice(body)?;
        let message = envelope.message.ok_or(EnvelopeError::MissingMessage)?;
        if message.data.is_empty() {
            return Err(EnvelopeError::MissingData);
        }

        let payload = base64::engine::general_purpose::STANDARD.decode(message.data.as_bytes())?;

        Ok(Self {
            payload,
            attributes: message.attributes,
            position: None,
        })
    }
}

#[derive(Deserialize)]
struct PushEnvelope {
    message: Option<PushMessage>,
}

#[derive(Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// The normalized event shape shared by every ingestion source.
///
/// Fields stay optional here: a record missing required fields is still
/// canonically shaped, it is just invalid and gets dead-lettered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: Option<String>,
    pub user_anonymous_id: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    pub event_type: Option<String>,
    pub source_platform: Option<String>,
    pub marketing_channel: Option<String>,
    pub campaign_id: Option<String>,
    pub revenue_usd: Option<f64>,
    /// The structured properties map, serialized to a JSON string for the sink.
    pub properties: Option<String>,
}

/// A canonical event together with the idempotency token its producer supplied, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedEvent {
    pub event: CanonicalEvent,
    pub insert_id: Option<String>,
}

impl KeyedEvent {
    /// The key the sink deduplicates writes on: the producer token, else the event_id.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.insert_id
            .as_deref()
            .or(self.event.event_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_push_envelope() {
        let data = base64::engine::general_purpose::STANDARD.encode(r#"{"event_id":"e1"}"#);
        let body = format!(
            r#"{{"message": {{"data": "{data}", "attributes": {{"insert_id": "tok-1"}}}}}}"#
        );

        let message = RawMessage::from_push_envelope(body.as_bytes()).expect("valid envelope");
        assert_eq!(message.payload, br#"{"event_id":"e1"}"#.to_vec());
        assert_eq!(message.insert_id(), Some("tok-1"));
        assert_eq!(message.position, None);
    }

    #[test]
    fn rejects_incomplete_envelopes() {
        assert!(matches!(
            RawMessage::from_push_envelope(b"{}"),
            Err(EnvelopeError::MissingMessage)
        ));
        assert!(matches!(
            RawMessage::from_push_envelope(br#"{"message": {"attributes": {}}}"#),
            Err(EnvelopeError::MissingData)
        ));
        assert!(matches!(
            RawMessage::from_push_envelope(br#"{"message": {"data": "%%%"}}"#),
            Err(EnvelopeError::InvalidBase64(_))
        ));
        assert!(matches!(
            RawMessage::from_push_envelope(b"not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn blank_insert_id_is_ignored() {
        let message = RawMessage::new("{}").with_attribute(INSERT_ID_ATTRIBUTE, "  ");
        assert_eq!(message.insert_id(), None);
    }

    #[test]
    fn idempotency_key_defaults_to_event_id() {
        let mut keyed = KeyedEvent {
            event: CanonicalEvent {
                event_id: Some("e1".to_string()),
                ..Default::default()
            },
            insert_id: None,
        };
        assert_eq!(keyed.idempotency_key(), Some("e1"));

        keyed.insert_id = Some("tok".to_string());
        assert_eq!(keyed.idempotency_key(), Some("tok"));
    }
}
