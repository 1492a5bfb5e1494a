//! Turns loosely shaped peer payloads into canonical [`Message`] values.
//!
//! Peers and the bulk-fetch endpoints disagree on field names and on whether
//! ids are bare strings or nested objects, so every lookup walks a short list
//! of accepted aliases.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use shared::domain::{Attachment, LocalId, MessageId, MessageStatus, ThreadId, UserId};
use tracing::warn;

use crate::{error::MalformedPayloadError, types::Message};

const ID_KEYS: &[&str] = &["id", "_id", "messageId"];
const LOCAL_ID_KEYS: &[&str] = &["localId", "local_id", "clientId", "tempId"];
const THREAD_ID_KEYS: &[&str] = &["threadId", "thread_id", "conversationId", "conversation_id"];
const THREAD_OBJECT_KEYS: &[&str] = &["thread", "conversation"];
const SENDER_KEYS: &[&str] = &["senderId", "sender_id", "sender", "from", "author"];
const NESTED_ID_KEYS: &[&str] = &["id", "_id", "userId", "user_id"];
const CONTENT_KEYS: &[&str] = &["content", "text", "body"];
const CREATED_AT_KEYS: &[&str] = &["createdAt", "created_at", "timestamp", "sentAt"];
const REPLY_KEYS: &[&str] = &["replyToId", "reply_to_id", "replyTo"];
const ATTACHMENT_URL_KEYS: &[&str] = &["url", "href", "fileUrl"];

fn first<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

/// Reads an id that may be a string, a number, or an object carrying one of
/// the nested id keys.
fn id_value(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(object) => first(object, NESTED_ID_KEYS).and_then(id_value),
        _ => None,
    };
    id.filter(|id| !id.trim().is_empty())
}

fn text_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other) => other.to_string(),
    }
}

fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()
            .or_else(|| text.parse::<i64>().ok().and_then(epoch_millis)),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(epoch_millis),
        _ => None,
    }
}

fn epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn attachment_value(value: &Value) -> Option<Attachment> {
    match value {
        Value::String(url) if !url.trim().is_empty() => Some(Attachment::from_url(url.clone())),
        Value::Object(object) => {
            let url = first(object, ATTACHMENT_URL_KEYS)?.as_str()?.to_string();
            let text = |keys: &[&str]| first(object, keys).and_then(Value::as_str).map(str::to_string);
            Some(Attachment {
                url,
                name: text(&["name", "fileName", "filename"]),
                mime_type: text(&["mimeType", "mime_type", "contentType", "type"]),
                size_bytes: first(object, &["sizeBytes", "size_bytes", "size"])
                    .and_then(Value::as_u64),
            })
        }
        _ => None,
    }
}

fn thread_id(object: &Map<String, Value>) -> Option<ThreadId> {
    first(object, THREAD_ID_KEYS)
        .or_else(|| first(object, THREAD_OBJECT_KEYS))
        .and_then(id_value)
        .map(ThreadId)
}

fn sender_id(object: &Map<String, Value>) -> Result<UserId, MalformedPayloadError> {
    let raw = first(object, SENDER_KEYS).ok_or(MalformedPayloadError::MissingSender)?;
    match raw {
        Value::String(_) | Value::Number(_) | Value::Object(_) => id_value(raw)
            .map(UserId)
            .ok_or_else(|| MalformedPayloadError::UnrecognizedSender(raw.to_string())),
        other => Err(MalformedPayloadError::UnrecognizedSender(other.to_string())),
    }
}

/// Builds a canonical message from `raw`.
///
/// `createdAt` falls back to `arrived_at` when absent or unparseable; the
/// latter is logged. A payload carrying a server id is
/// `sent`; one carrying only a local id is still `pending`.
pub fn normalize(raw: &Value, arrived_at: DateTime<Utc>) -> Result<Message, MalformedPayloadError> {
    let object = raw.as_object().ok_or(MalformedPayloadError::NotAnObject)?;
    let thread_id = thread_id(object).ok_or(MalformedPayloadError::MissingThread)?;
    let sender_id = sender_id(object)?;

    let id = first(object, ID_KEYS).and_then(id_value).map(MessageId);
    let local_id = first(object, LOCAL_ID_KEYS).and_then(id_value).map(LocalId);
    let created_at = match first(object, CREATED_AT_KEYS) {
        None | Some(Value::Null) => arrived_at,
        Some(raw_time) => timestamp_value(raw_time).unwrap_or_else(|| {
            warn!(created_at = %raw_time, "normalize: unparseable timestamp, using arrival time");
            arrived_at
        }),
    };
    let attachments = match first(object, &["attachments", "files"]) {
        Some(Value::Array(items)) => items.iter().filter_map(attachment_value).collect(),
        Some(single) => attachment_value(single).into_iter().collect(),
        None => Vec::new(),
    };
    let status = if id.is_some() {
        MessageStatus::Sent
    } else {
        MessageStatus::Pending
    };

    Ok(Message {
        id,
        local_id,
        thread_id,
        sender_id,
        content: text_value(first(object, CONTENT_KEYS)),
        attachments,
        created_at,
        status,
        reply_to_id: first(object, REPLY_KEYS).and_then(id_value).map(MessageId),
    })
}

/// Thread listing entry as returned by the bulk-fetch endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub participants: BTreeSet<UserId>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}

pub fn normalize_thread_summary(
    raw: &Value,
    arrived_at: DateTime<Utc>,
) -> Result<ThreadSummary, MalformedPayloadError> {
    let object = raw.as_object().ok_or(MalformedPayloadError::NotAnObject)?;
    let id = first(object, &["id", "_id", "threadId", "conversationId"])
        .and_then(id_value)
        .map(ThreadId)
        .ok_or(MalformedPayloadError::MissingThread)?;

    let participants = match first(object, &["participants", "members"]) {
        Some(Value::Array(items)) => items.iter().filter_map(id_value).map(UserId).collect(),
        _ => BTreeSet::new(),
    };

    // The embedded last message often omits its thread id.
    let last_message = first(object, &["lastMessage", "last_message"]).and_then(|value| {
        let mut value = value.clone();
        if let Value::Object(message) = &mut value {
            message
                .entry("threadId")
                .or_insert_with(|| Value::String(id.as_str().to_string()));
        }
        normalize(&value, arrived_at).ok()
    });

    let unread_count = first(object, &["unreadCount", "unread_count", "unread"])
        .and_then(Value::as_u64)
        .map(|count| count.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0);

    Ok(ThreadSummary {
        id,
        participants,
        last_message,
        unread_count,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn arrival() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()
    }

    #[test]
    fn accepts_nested_sender_and_thread_objects() {
        let raw = json!({
            "_id": "M7",
            "conversation": { "_id": "T3" },
            "sender": { "userId": "u-42", "name": "Ada" },
            "text": 12,
        });
        let message = normalize(&raw, arrival()).expect("normalize");
        assert_eq!(message.id, Some(MessageId::from("M7")));
        assert_eq!(message.thread_id, ThreadId::from("T3"));
        assert_eq!(message.sender_id, UserId::from("u-42"));
        assert_eq!(message.content, "12");
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.created_at, arrival());
    }

    #[test]
    fn parses_rfc3339_and_epoch_timestamps() {
        let rfc = normalize(
            &json!({ "threadId": "T1", "senderId": "u1", "createdAt": "2024-05-01T10:00:00Z" }),
            arrival(),
        )
        .expect("rfc3339");
        assert_eq!(rfc.created_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        let epoch = normalize(
            &json!({ "threadId": "T1", "senderId": "u1", "timestamp": 1_700_000_005_000_i64 }),
            arrival(),
        )
        .expect("epoch");
        assert_eq!(epoch.created_at.timestamp_millis(), 1_700_000_005_000);
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_arrival() {
        let garbled = normalize(
            &json!({ "threadId": "T1", "senderId": "u1", "createdAt": "yesterday-ish" }),
            arrival(),
        )
        .expect("garbled timestamp still normalizes");
        assert_eq!(garbled.created_at, arrival());

        let null = normalize(
            &json!({ "threadId": "T1", "senderId": "u1", "createdAt": null }),
            arrival(),
        )
        .expect("null timestamp");
        assert_eq!(null.created_at, arrival());
    }

    #[test]
    fn blank_ids_count_as_absent() {
        let message = normalize(
            &json!({ "id": "", "localId": "L1", "threadId": "T1", "senderId": 7, "content": null }),
            arrival(),
        )
        .expect("normalize");
        assert_eq!(message.id, None);
        assert_eq!(message.local_id, Some(LocalId::from("L1")));
        assert_eq!(message.sender_id, UserId::from("7"));
        assert_eq!(message.content, "");
        assert!(message.is_pending());
    }

    #[test]
    fn rejects_unresolvable_payloads() {
        assert_eq!(
            normalize(&json!("hello"), arrival()),
            Err(MalformedPayloadError::NotAnObject)
        );
        assert_eq!(
            normalize(&json!({ "senderId": "u1" }), arrival()),
            Err(MalformedPayloadError::MissingThread)
        );
        assert_eq!(
            normalize(&json!({ "threadId": "T1" }), arrival()),
            Err(MalformedPayloadError::MissingSender)
        );
        assert!(matches!(
            normalize(&json!({ "threadId": "T1", "sender": ["u1"] }), arrival()),
            Err(MalformedPayloadError::UnrecognizedSender(_))
        ));
        assert!(matches!(
            normalize(&json!({ "threadId": "T1", "sender": { "name": "Ada" } }), arrival()),
            Err(MalformedPayloadError::UnrecognizedSender(_))
        ));
    }

    #[test]
    fn collects_attachments_in_order() {
        let message = normalize(
            &json!({
                "threadId": "T1",
                "senderId": "u1",
                "attachments": [
                    "https://files.example/a.png",
                    { "url": "https://files.example/b.pdf", "name": "b.pdf", "size": 2048 },
                    { "name": "no url" },
                ],
            }),
            arrival(),
        )
        .expect("normalize");
        let urls: Vec<_> = message.attachments.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, ["https://files.example/a.png", "https://files.example/b.pdf"]);
        assert_eq!(message.attachments[1].size_bytes, Some(2048));
    }

    #[test]
    fn thread_summary_fills_thread_id_on_last_message() {
        let summary = normalize_thread_summary(
            &json!({
                "_id": "T5",
                "participants": ["u1", { "id": "u2" }],
                "lastMessage": { "id": "M9", "senderId": "u2", "content": "ok" },
                "unreadCount": 3,
            }),
            arrival(),
        )
        .expect("summary");
        assert_eq!(summary.id, ThreadId::from("T5"));
        assert_eq!(summary.participants.len(), 2);
        assert_eq!(summary.unread_count, 3);
        let last = summary.last_message.expect("last message");
        assert_eq!(last.thread_id, ThreadId::from("T5"));
    }
}
