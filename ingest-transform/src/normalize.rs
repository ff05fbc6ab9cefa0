//! Maps raw bus payloads onto the canonical event schema.
//!
//! Normalization is a pure function of the payload (plus transport attributes
//! for the idempotency token), so it is safe to run again on redelivered bundles.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::ParseFailure;
use crate::event::{CanonicalEvent, KeyedEvent, RawMessage};

/// Wire shape of an inbound event. Every field is optional, validity is decided later.
///
/// Identity and required fields must have a usable shape or the record is
/// unparseable. Descriptive fields are kept as raw values and coerced one by
/// one, so a malformed value only loses that field.
#[derive(Deserialize)]
struct InboundEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    event_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    source_platform: Option<String>,
    #[serde(default)]
    user_anonymous_id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    marketing_channel: Option<Value>,
    #[serde(default)]
    campaign_id: Option<Value>,
    #[serde(default)]
    revenue_usd: Option<Value>,
    #[serde(default)]
    properties: Option<Value>,
    #[serde(default, rename = "_insert_id")]
    insert_id: Option<Value>,
}

/// Parse a raw payload into a canonical event.
pub fn normalize(payload: &[u8]) -> Result<CanonicalEvent, ParseFailure> {
    decode(payload).map(|(event, _)| event)
}

/// Parse a bus message, resolving its idempotency token from the `insert_id`
/// attribute first and the payload's `_insert_id` field second.
pub fn normalize_message(message: &RawMessage) -> Result<KeyedEvent, ParseFailure> {
    let (event, payload_insert_id) = decode(&message.payload)?;

    let usable = |token: &String| !token.trim().is_empty();
    let insert_id = message
        .insert_id()
        .map(|token| without_nul("insert_id", token.to_owned()))
        .filter(usable)
        .or_else(|| payload_insert_id.filter(usable));

    Ok(KeyedEvent { event, insert_id })
}

fn decode(payload: &[u8]) -> Result<(CanonicalEvent, Option<String>), ParseFailure> {
    if payload.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text).map_err(ParseFailure::Json)?;
    if !value.is_object() {
        return Err(ParseFailure::NotAnObject(json_kind(&value)));
    }

    let inbound = InboundEvent::deserialize(value).map_err(ParseFailure::Fields)?;

    let properties = match inbound.properties {
        None | Some(Value::Null) => None,
        Some(properties) => {
            Some(serde_json::to_string(&properties).map_err(ParseFailure::Fields)?)
        }
    };

    let event = CanonicalEvent {
        event_id: inbound
            .event_id
            .map(|id| without_nul("event_id", id))
            .filter(|id| !id.is_empty())
            .or(inbound.id.map(|id| without_nul("id", id))),
        user_anonymous_id: optional_string("user_anonymous_id", inbound.user_anonymous_id),
        user_id: optional_string("user_id", inbound.user_id),
        timestamp: inbound.timestamp.map(|ts| without_nul("timestamp", ts)),
        event_type: inbound.event_type.map(|t| without_nul("event_type", t)),
        source_platform: inbound
            .source_platform
            .map(|platform| without_nul("source_platform", platform)),
        marketing_channel: optional_string("marketing_channel", inbound.marketing_channel),
        campaign_id: optional_string("campaign_id", inbound.campaign_id),
        revenue_usd: optional_number("revenue_usd", inbound.revenue_usd),
        properties,
    };

    Ok((event, optional_string("_insert_id", inbound.insert_id)))
}

/// Producers disagree on whether ids are strings or numbers, accept both.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string, found a {}",
            json_kind(&other)
        ))),
    }
}

/// A descriptive field with the wrong shape is dropped, the rest of the record is kept.
fn optional_string(field: &'static str, value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(without_nul(field, s)),
        Value::Number(n) => Some(n.to_string()),
        other => {
            warn!(field, "ignoring field: expected a string, found a {}", json_kind(&other));
            None
        }
    }
}

fn optional_number(field: &'static str, value: Option<Value>) -> Option<f64> {
    let number = match value? {
        Value::Null => return None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => {
            warn!(field, "ignoring field: expected a number, found a {}", json_kind(&other));
            return None;
        }
    };

    match number {
        Some(n) if n.is_finite() => Some(n),
        _ => {
            warn!(field, "ignoring field: expected a finite number");
            None
        }
    }
}

/// Text columns cannot hold NUL, so it is removed before the event goes anywhere.
fn without_nul(field: &'static str, value: String) -> String {
    if !value.contains('\0') {
        return value;
    }
    warn!(field, "removing NUL characters from field");
    value.replace('\0', "")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
