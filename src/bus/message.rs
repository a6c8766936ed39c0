use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Headers = BTreeMap<String, String>;

pub const REPLY_TO: &str = "reply-to";

/// A message as delivered by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub destination: String,
    #[serde(default)]
    pub headers: Headers,
    pub body: String,
}

impl Message {
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.headers.get(REPLY_TO).map(String::as_str)
    }

    /// Structured when the body parses as JSON, opaque text otherwise.
    pub fn payload(&self) -> Payload {
        Payload::from_body(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str(body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(body.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }

    /// Text payloads become JSON strings.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(v) => v,
            Payload::Text(s) => Value::String(s),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Json(Value::String(s)) => Some(s),
            Payload::Json(_) => None,
        }
    }
}

/// Renders a structured value into a message body. Strings go out verbatim.
pub fn encode_body<T: Serialize + ?Sized>(message: &T) -> serde_json::Result<String> {
    Ok(match serde_json::to_value(message)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}
