use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Tagged control messages. `join` only ever travels client to relay; the
/// relay re-emits `typing` in exactly this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    Join { user: String, time: String },
    Typing { user: String, typing: bool },
}

/// The untagged chat object clients exchange. The relay never decodes into
/// this type; it forwards chat text exactly as received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
    pub time: String,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, text: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
            time: timestamp(time),
        }
    }
}

/// ISO 8601 with millisecond precision and a `Z` suffix.
pub fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}
