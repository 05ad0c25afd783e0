//! Turns history items, live pushes and local submissions into one
//! `CanonicalMessage` shape.
//!
//! Wire items are the JSON records the session provider hands us: either a
//! bare message object or an event envelope `{"type": "message.new", "message": {..}}`.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::MalformedEventError;
use crate::state::{Attachment, CanonicalMessage, MessageState, ReactionCount};

/// Prefix of the temporary id carried by an unconfirmed entry.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Integer timestamps below this are read as seconds, above as milliseconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

const SUPPORTED_EVENT_TYPES: &[&str] = &["message.new", "message.updated"];

/// A message composed on this device, before anything went over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubmission {
    pub client_ref: String,
    pub author_id: String,
    pub text: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    HistoryItem(Value),
    LivePush(Value),
    LocalSubmission(LocalSubmission),
}

pub fn normalize(raw: RawEvent) -> Result<CanonicalMessage, MalformedEventError> {
    match raw {
        RawEvent::HistoryItem(value) | RawEvent::LivePush(value) => normalize_wire(&value),
        RawEvent::LocalSubmission(submission) => normalize_local(submission),
    }
}

fn normalize_local(submission: LocalSubmission) -> Result<CanonicalMessage, MalformedEventError> {
    let client_ref = submission.client_ref.trim();
    if client_ref.is_empty() {
        return Err(MalformedEventError::MissingField("client_ref"));
    }
    let author_id = submission.author_id.trim();
    if author_id.is_empty() {
        return Err(MalformedEventError::MissingField("author_id"));
    }
    Ok(CanonicalMessage {
        id: format!("{TEMP_ID_PREFIX}{client_ref}"),
        client_ref: Some(client_ref.to_string()),
        author_id: author_id.to_string(),
        author_name: None,
        text: submission.text,
        created_at: submission.created_at,
        updated_at: None,
        state: MessageState::Pending,
        seq: 0,
        attachments: vec![],
        reactions: vec![],
        thread_count: 0,
    })
}

fn normalize_wire(value: &Value) -> Result<CanonicalMessage, MalformedEventError> {
    let obj = value.as_object().ok_or(MalformedEventError::NotAnObject)?;
    let message = unwrap_envelope(obj)?;

    let id = non_empty_string(message.get("id")).ok_or(MalformedEventError::MissingField("id"))?;
    let user = message.get("user").and_then(Value::as_object);
    let author_id = user
        .and_then(|u| non_empty_string(u.get("id")))
        .or_else(|| non_empty_string(message.get("user_id")))
        .ok_or(MalformedEventError::MissingField("author_id"))?;
    let created_at = match message.get("created_at") {
        None | Some(Value::Null) => return Err(MalformedEventError::MissingField("created_at")),
        Some(v) => parse_timestamp(v)?,
    };

    let client_ref = non_empty_string(message.get("client_ref"))
        .or_else(|| non_empty_string(message.get("clientRef")));
    let author_name = user.and_then(|u| non_empty_string(u.get("name")));
    let text = message
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let updated_at = message
        .get("updated_at")
        .and_then(|v| parse_timestamp(v).ok());
    let thread_count = message
        .get("thread_count")
        .or_else(|| message.get("reply_count"))
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0);

    Ok(CanonicalMessage {
        id,
        client_ref,
        author_id,
        author_name,
        text,
        created_at,
        updated_at,
        state: MessageState::Confirmed,
        seq: 0,
        attachments: parse_attachments(message.get("attachments")),
        reactions: parse_reactions(message.get("reaction_counts")),
        thread_count,
    })
}

fn unwrap_envelope(obj: &Map<String, Value>) -> Result<&Map<String, Value>, MalformedEventError> {
    // Messages carry their own `type` ("regular", "system", ...); only dotted
    // values name an event envelope.
    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| t.contains('.'));
    if let Some(t) = event_type {
        if !SUPPORTED_EVENT_TYPES.contains(&t) {
            return Err(MalformedEventError::UnsupportedType(t.to_string()));
        }
    }
    match obj.get("message") {
        Some(Value::Object(inner)) => Ok(inner),
        _ if event_type.is_some() => Err(MalformedEventError::MissingField("message")),
        _ => Ok(obj),
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scale_integer(n: i64) -> i64 {
    if n.unsigned_abs() < SECONDS_CUTOFF as u64 {
        n.saturating_mul(1000)
    } else {
        n
    }
}

pub(crate) fn parse_timestamp(value: &Value) -> Result<i64, MalformedEventError> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                return Ok(scale_integer(n));
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .map_err(|_| MalformedEventError::InvalidTimestamp(s.to_string()))
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(scale_integer(i));
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.abs() < SECONDS_CUTOFF as f64 => {
                    Ok((f * 1000.0) as i64)
                }
                Some(f) if f.is_finite() => Ok(f as i64),
                _ => Err(MalformedEventError::InvalidTimestamp(n.to_string())),
            }
        }
        other => Err(MalformedEventError::InvalidTimestamp(other.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default, alias = "asset_url")]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default, alias = "file_size")]
    size: Option<u64>,
}

fn parse_attachments(value: Option<&Value>) -> Vec<Attachment> {
    let Some(items) = value.and_then(Value::as_array) else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<WireAttachment>(item.clone()).ok())
        .filter_map(|a| {
            let url = a.url.filter(|u| !u.trim().is_empty())?;
            Some(Attachment {
                kind: a.kind.unwrap_or_else(|| "file".to_string()),
                url,
                title: a.title,
                name: a.name,
                mime_type: a.mime_type,
                size: a.size,
            })
        })
        .collect()
}

fn parse_reactions(value: Option<&Value>) -> Vec<ReactionCount> {
    let Some(counts) = value.and_then(Value::as_object) else {
        return vec![];
    };
    let sorted: BTreeMap<&String, u32> = counts
        .iter()
        .filter_map(|(k, v)| Some((k, v.as_u64()?.min(u32::MAX as u64) as u32)))
        .filter(|(_, n)| *n > 0)
        .collect();
    sorted
        .into_iter()
        .map(|(reaction, count)| ReactionCount {
            reaction: reaction.clone(),
            count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history(value: Value) -> Result<CanonicalMessage, MalformedEventError> {
        normalize(RawEvent::HistoryItem(value))
    }

    #[test]
    fn history_item_maps_stream_message_shape() {
        let m = history(json!({
            "id": "m-1",
            "text": "hello",
            "type": "regular",
            "user": {"id": "bob", "name": "Bob"},
            "created_at": "2024-05-01T10:00:00.250Z",
            "reaction_counts": {"like": 2, "heart": 1},
            "reply_count": 3,
        }))
        .unwrap();
        assert_eq!(m.id, "m-1");
        assert_eq!(m.author_id, "bob");
        assert_eq!(m.author_name.as_deref(), Some("Bob"));
        assert_eq!(m.created_at, 1_714_557_600_250);
        assert_eq!(m.state, MessageState::Confirmed);
        assert_eq!(m.thread_count, 3);
        assert_eq!(
            m.reactions,
            vec![
                ReactionCount {
                    reaction: "heart".into(),
                    count: 1
                },
                ReactionCount {
                    reaction: "like".into(),
                    count: 2
                },
            ]
        );
        assert!(m.client_ref.is_none());
    }

    #[test]
    fn live_envelope_is_unwrapped_and_carries_client_ref() {
        let m = normalize(RawEvent::LivePush(json!({
            "type": "message.new",
            "message": {
                "id": "m-42",
                "text": "hi",
                "user_id": "alice",
                "created_at": 1_714_557_600_000i64,
                "clientRef": "ref-1",
            }
        })))
        .unwrap();
        assert_eq!(m.id, "m-42");
        assert_eq!(m.author_id, "alice");
        assert_eq!(m.client_ref.as_deref(), Some("ref-1"));
        assert_eq!(m.created_at, 1_714_557_600_000);
    }

    #[test]
    fn non_message_events_are_rejected() {
        let err = normalize(RawEvent::LivePush(json!({
            "type": "typing.start",
            "user": {"id": "bob"},
        })))
        .unwrap_err();
        assert_eq!(err, MalformedEventError::UnsupportedType("typing.start".into()));

        let err = normalize(RawEvent::LivePush(json!({"type": "message.new"}))).unwrap_err();
        assert_eq!(err, MalformedEventError::MissingField("message"));
    }

    #[test]
    fn mandatory_fields_are_enforced() {
        assert_eq!(
            history(json!({"user_id": "a", "created_at": 1})).unwrap_err(),
            MalformedEventError::MissingField("id")
        );
        assert_eq!(
            history(json!({"id": "m", "user": {"id": "  "}, "created_at": 1})).unwrap_err(),
            MalformedEventError::MissingField("author_id")
        );
        assert_eq!(
            history(json!({"id": "m", "user_id": "a", "created_at": null})).unwrap_err(),
            MalformedEventError::MissingField("created_at")
        );
        assert_eq!(
            history(json!({"id": "m", "user_id": "a", "created_at": "yesterday"})).unwrap_err(),
            MalformedEventError::InvalidTimestamp("yesterday".into())
        );
        assert_eq!(history(json!("m-1")).unwrap_err(), MalformedEventError::NotAnObject);
    }

    #[test]
    fn optional_fields_default_when_missing_or_ill_typed() {
        let m = history(json!({
            "id": "m-2",
            "user_id": "bob",
            "created_at": "1714557600",
            "attachments": "not-a-list",
            "reaction_counts": [1, 2],
            "updated_at": {"nope": true},
        }))
        .unwrap();
        assert_eq!(m.text, "");
        assert_eq!(m.created_at, 1_714_557_600_000);
        assert!(m.attachments.is_empty());
        assert!(m.reactions.is_empty());
        assert!(m.updated_at.is_none());
        assert_eq!(m.thread_count, 0);
    }

    #[test]
    fn attachments_without_url_are_skipped() {
        let m = history(json!({
            "id": "m-3",
            "user_id": "bob",
            "created_at": 1_714_557_600,
            "attachments": [
                {"type": "image", "asset_url": "https://cdn/x.png", "file_size": 10},
                {"type": "file"},
                42,
            ],
        }))
        .unwrap();
        assert_eq!(m.attachments.len(), 1);
        assert_eq!(m.attachments[0].kind, "image");
        assert_eq!(m.attachments[0].url, "https://cdn/x.png");
        assert_eq!(m.attachments[0].size, Some(10));
    }

    #[test]
    fn timestamp_units_are_inferred() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000)).unwrap(), 1_700_000_000_000);
        assert_eq!(parse_timestamp(&json!(1_700_000_000_123i64)).unwrap(), 1_700_000_000_123);
        assert_eq!(parse_timestamp(&json!(1_700_000_000.5)).unwrap(), 1_700_000_000_500);
        assert_eq!(
            parse_timestamp(&json!("2024-05-01T12:00:00+02:00")).unwrap(),
            1_714_557_600_000
        );
    }

    #[test]
    fn local_submission_becomes_pending_with_temp_id() {
        let m = normalize(RawEvent::LocalSubmission(LocalSubmission {
            client_ref: "abc-1".into(),
            author_id: "alice".into(),
            text: "hello".into(),
            created_at: 5,
        }))
        .unwrap();
        assert_eq!(m.id, "tmp-abc-1");
        assert_eq!(m.client_ref.as_deref(), Some("abc-1"));
        assert_eq!(m.state, MessageState::Pending);
        assert_eq!(m.text, "hello");

        let err = normalize(RawEvent::LocalSubmission(LocalSubmission {
            client_ref: " ".into(),
            author_id: "alice".into(),
            text: "x".into(),
            created_at: 5,
        }))
        .unwrap_err();
        assert_eq!(err, MalformedEventError::MissingField("client_ref"));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let m = normalize(RawEvent::LivePush(json!({
            "id": "x",
            "user_id": "me",
            "created_at": i64::MIN,
        })))
        .unwrap();
        assert_eq!(m.created_at, i64::MIN);
        assert_eq!(parse_timestamp(&json!(i64::MAX)).unwrap(), i64::MAX);
        assert_eq!(parse_timestamp(&json!("-99999999999")).unwrap(), -99_999_999_999_000);
        assert_eq!(parse_timestamp(&json!(1e300)).unwrap(), i64::MAX);
    }
}
