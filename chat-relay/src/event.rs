//! Classification of inbound payloads.
//!
//! [`classify`] is total: every payload maps to exactly one [`Event`] and
//! nothing is rejected. Only a JSON object's `type` tag decides between
//! join, typing and chat; anything that is not a JSON object is relayed
//! untouched as [`Event::Opaque`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::connection::{Frame, UNKNOWN};

/// Raw payload of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl From<Payload> for Frame {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Frame::Text(Arc::from(text)),
            Payload::Binary(bytes) => Frame::Binary(Arc::from(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Join {
        user: String,
        time: DateTime<Utc>,
    },
    Typing {
        user: String,
        typing: bool,
    },
    /// Any other JSON object. `raw` is the text exactly as received and is
    /// what gets relayed; `fields` is kept for logging.
    Chat {
        raw: String,
        fields: Map<String, Value>,
    },
    Opaque {
        raw: Payload,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Join { .. } => "join",
            Event::Typing { .. } => "typing",
            Event::Chat { .. } => "chat",
            Event::Opaque { .. } => "opaque",
        }
    }
}

/// Classifies one inbound payload received at `received_at`.
///
/// Binary payloads that are valid UTF-8 are treated exactly like text.
pub fn classify(payload: Payload, received_at: DateTime<Utc>) -> Event {
    let text = match payload {
        Payload::Text(text) => text,
        Payload::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                return Event::Opaque {
                    raw: Payload::Binary(err.into_bytes()),
                };
            }
        },
    };

    let fields = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(fields)) => fields,
        _ => {
            return Event::Opaque {
                raw: Payload::Text(text),
            };
        }
    };

    match fields.get("type").and_then(Value::as_str) {
        Some("join") => Event::Join {
            user: user_field(&fields),
            time: received_at,
        },
        Some("typing") => Event::Typing {
            user: user_field(&fields),
            typing: fields.get("typing").is_some_and(truthy),
        },
        _ => Event::Chat { raw: text, fields },
    }
}

fn user_field(fields: &Map<String, Value>) -> String {
    fields
        .get("user")
        .and_then(Value::as_str)
        .filter(|user| !user.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// Loose boolean coercion: `false`, `null`, zero and the empty string are
/// false, everything else is true.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
