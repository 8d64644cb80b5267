//! Maps the payloads of the various gateway forks onto the canonical model.
//!
//! Every canonical field is resolved from an ordered alias table; the first
//! alias holding a non-empty value wins. Dotted aliases walk nested objects.

use chrono::DateTime;
use serde_json::Value;

use crate::model::{Chat, Direction, MediaKind, Message};

pub const CHAT_COLLECTION_KEYS: &[&str] = &["data", "chats", "result", "response"];
pub const MESSAGE_COLLECTION_KEYS: &[&str] = &["data", "messages", "result", "response"];

pub const CHAT_NAME: &[&str] = &[
    "name",
    "pushname",
    "formattedName",
    "contact.name",
    "contact.pushname",
];
pub const CHAT_TIMESTAMP: &[&str] = &[
    "timestamp",
    "t",
    "conversationTimestamp",
    "lastMessage.timestamp",
];
pub const CHAT_PREVIEW: &[&str] = &["lastMessage.body", "lastMessage.text"];
pub const AVATAR: &[&str] = &[
    "profilePicUrl",
    "picUrl",
    "avatar",
    "contact.profilePicUrl",
    "contact.avatar",
];

pub const MESSAGE_ID: &[&str] = &["id", "_id"];
pub const MESSAGE_BODY: &[&str] = &["body", "text"];
pub const MESSAGE_FROM_ME: &[&str] = &["fromMe", "isFromMe"];
pub const MESSAGE_TIMESTAMP: &[&str] = &["timestamp", "t", "messageTimestamp"];
pub const MEDIA_FILE_NAME: &[&str] = &["media.filename", "filename", "_data.filename"];

pub const CONTACT_NAME: &[&str] = &["name", "pushname", "shortName"];
pub const CONTACT_NUMBER: &[&str] = &["number"];
const CONTACT_KEYS: &[&str] = &["id", "name", "pushname", "shortName", "number"];

pub const PICTURE_URL: &[&str] = &["url", "picUrl", "profilePicUrl", "pictureUrl"];

const UNKNOWN_NAME: &str = "Unknown";

/// Walk a dotted alias like `contact.name`.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, key| value.get(key))
}

/// Non-blank strings and numbers count as text; everything else is empty.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Like [`text_of`] but also accepts the `{ _serialized: ... }` id objects.
fn identifier_of(value: &Value) -> Option<String> {
    match value {
        Value::Object(_) => value.get("_serialized").and_then(text_of),
        other => text_of(other),
    }
}

pub fn first_text(record: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find_map(|alias| lookup(record, alias).and_then(text_of))
}

/// Flags follow truthiness: the first alias set to `true` wins, `false` and
/// absent both fall through.
pub fn first_flag(record: &Value, aliases: &[&str]) -> bool {
    aliases
        .iter()
        .any(|alias| lookup(record, alias).and_then(Value::as_bool) == Some(true))
}

pub fn first_timestamp(record: &Value, aliases: &[&str]) -> i64 {
    aliases
        .iter()
        .filter_map(|alias| lookup(record, alias))
        .map(timestamp_seconds)
        .find(|ts| *ts > 0)
        .unwrap_or(0)
}

/// Seconds since epoch from seconds, milliseconds, numeric strings or
/// RFC 3339 strings. Anything else is 0.
pub fn timestamp_seconds(value: &Value) -> i64 {
    let raw = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp()))
        }
        _ => None,
    };

    match raw {
        Some(ts) if ts > 1_000_000_000_000 => ts / 1000,
        Some(ts) if ts > 0 => ts,
        _ => 0,
    }
}

/// The record array inside a payload: the payload itself when it is an
/// array, otherwise the first array-typed key from `keys`.
pub fn collection<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    if let Some(records) = payload.as_array() {
        return Some(records);
    }
    keys.iter()
        .find_map(|key| payload.get(key).and_then(Value::as_array))
}

/// `None` when no chat collection is recognisable. An empty array is a valid
/// (empty) collection.
pub fn chats(payload: &Value) -> Option<Vec<Chat>> {
    collection(payload, CHAT_COLLECTION_KEYS).map(|records| records.iter().map(chat).collect())
}

pub fn messages(payload: &Value) -> Option<Vec<Message>> {
    collection(payload, MESSAGE_COLLECTION_KEYS)
        .map(|records| records.iter().map(message).collect())
}

pub fn chat(record: &Value) -> Chat {
    let id = lookup(record, "id._serialized")
        .and_then(text_of)
        .or_else(|| record.get("id").and_then(text_of))
        .unwrap_or_default();

    let name = CHAT_NAME
        .iter()
        .filter_map(|alias| lookup(record, alias).and_then(text_of))
        .chain(lookup(record, "id.user").and_then(text_of))
        .chain((!id.is_empty()).then(|| id.clone()))
        .find_map(strip_domain)
        .unwrap_or_else(|| UNKNOWN_NAME.to_string());

    Chat {
        is_group: first_flag(record, &["isGroup"]) || id.ends_with("@g.us"),
        display_name: name,
        last_activity_timestamp: first_timestamp(record, CHAT_TIMESTAMP),
        avatar_url: avatar_url(record),
        last_message_preview: first_text(record, CHAT_PREVIEW),
        id,
    }
}

/// `"628123@c.us"` displays as `"628123"`. `None` when nothing is left
/// before the separator, so the next alias gets its turn.
fn strip_domain(name: String) -> Option<String> {
    let local = match name.split_once('@') {
        Some((local, _)) => local.trim(),
        None => return Some(name),
    };
    (!local.is_empty()).then(|| local.to_string())
}

pub fn message(record: &Value) -> Message {
    let id = MESSAGE_ID
        .iter()
        .find_map(|alias| record.get(alias).and_then(identifier_of))
        .unwrap_or_default();

    let kind_hint = record
        .get("type")
        .and_then(Value::as_str)
        .and_then(media_kind_from_type)
        .or_else(|| {
            lookup(record, "media.mimetype")
                .and_then(Value::as_str)
                .map(media_kind_from_mimetype)
        });
    let has_media = first_flag(record, &["hasMedia"])
        || record.get("media").is_some_and(Value::is_object)
        || kind_hint.is_some();

    Message {
        id,
        body: first_text(record, MESSAGE_BODY).unwrap_or_default(),
        direction: if first_flag(record, MESSAGE_FROM_ME) {
            Direction::FromMe
        } else {
            Direction::FromThem
        },
        timestamp: first_timestamp(record, MESSAGE_TIMESTAMP),
        has_media,
        media_kind: if has_media {
            kind_hint.unwrap_or(MediaKind::Document)
        } else {
            MediaKind::None
        },
        media_file_name: if has_media {
            first_text(record, MEDIA_FILE_NAME)
        } else {
            None
        },
    }
}

fn media_kind_from_type(kind: &str) -> Option<MediaKind> {
    match kind.to_ascii_lowercase().as_str() {
        "image" | "sticker" => Some(MediaKind::Image),
        "video" | "gif" => Some(MediaKind::Video),
        "audio" | "ptt" | "voice" => Some(MediaKind::Audio),
        "document" => Some(MediaKind::Document),
        _ => None,
    }
}

fn media_kind_from_mimetype(mimetype: &str) -> MediaKind {
    let mimetype = mimetype.to_ascii_lowercase();
    if mimetype.starts_with("image/") {
        MediaKind::Image
    } else if mimetype.starts_with("video/") {
        MediaKind::Video
    } else if mimetype.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

pub fn avatar_url(record: &Value) -> Option<String> {
    first_text(record, AVATAR)
}

/// Objects a single-record response may hide behind: `.data`, `.response`,
/// then the payload itself.
fn single_record_candidates(payload: &Value) -> impl Iterator<Item = &Value> {
    [payload.get("data"), payload.get("response"), Some(payload)]
        .into_iter()
        .flatten()
        .filter(|v| v.is_object())
}

/// The contact object inside a contact-info payload, if one is recognisable.
pub fn contact_record(payload: &Value) -> Option<&Value> {
    single_record_candidates(payload)
        .find(|record| CONTACT_KEYS.iter().any(|key| record.get(key).is_some()))
}

/// Profile picture URL from a picture endpoint's JSON answer.
pub fn picture_url(payload: &Value) -> Option<String> {
    single_record_candidates(payload).find_map(|record| first_text(record, PICTURE_URL))
}
