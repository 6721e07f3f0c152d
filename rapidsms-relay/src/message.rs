//! Backbone message and event envelopes.
//!
//! The JSON layout follows the backbone wire format (`message_version`
//! `20110921`). Fields the relay does not interpret are kept in `extra` so
//! that forwarding a message to the remote system is lossless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MESSAGE_VERSION: &str = "20110921";
pub const USER_MESSAGE_TYPE: &str = "user_message";
pub const EVENT_MESSAGE_TYPE: &str = "event";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionEvent {
    New,
    Resume,
    Close,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Message {
    #[serde(default = "user_message_type")]
    pub message_type: String,
    #[serde(default = "message_version")]
    pub message_version: String,
    pub message_id: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub to_addr: String,
    pub from_addr: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub session_event: Option<SessionEvent>,
    #[serde(default)]
    pub transport_name: Option<String>,
    #[serde(default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,
    #[serde(default)]
    pub transport_metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// A fresh outbound message with a newly generated id.
    pub fn new(to_addr: &str, from_addr: &str, content: &str) -> Self {
        Message {
            message_type: user_message_type(),
            message_version: message_version(),
            message_id: new_id(),
            timestamp: Utc::now(),
            to_addr: to_addr.to_string(),
            from_addr: from_addr.to_string(),
            content: Some(content.to_string()),
            in_reply_to: None,
            session_event: None,
            transport_name: None,
            transport_type: None,
            helper_metadata: Map::new(),
            transport_metadata: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_transport_name(mut self, transport_name: Option<String>) -> Self {
        self.transport_name = transport_name;
        self
    }

    pub fn is_session_close(&self) -> bool {
        self.session_event == Some(SessionEvent::Close)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ack,
    Nack,
    DeliveryReport,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Failed,
    Delivered,
}

/// Delivery notifications about a message previously sent into the backbone.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Event {
    #[serde(default = "event_message_type")]
    pub message_type: String,
    #[serde(default = "message_version")]
    pub message_version: String,
    pub event_id: String,
    #[serde(default = "Utc::now", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub user_message_id: String,
    #[serde(default)]
    pub sent_message_id: Option<String>,
    #[serde(default)]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default)]
    pub nack_reason: Option<String>,
    #[serde(default)]
    pub transport_name: Option<String>,
    #[serde(default)]
    pub helper_metadata: Map<String, Value>,
    #[serde(default)]
    pub transport_metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Anything the backbone hands to the relay.
///
/// Events are tried first: a user message never carries `event_type`, while
/// the flattened `extra` map on [`Message`] would accept an event's fields.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum BackboneEvent {
    Event(Event),
    UserMessage(Message),
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn user_message_type() -> String {
    USER_MESSAGE_TYPE.to_string()
}

fn event_message_type() -> String {
    EVENT_MESSAGE_TYPE.to_string()
}

fn message_version() -> String {
    MESSAGE_VERSION.to_string()
}

/// Backbone timestamps are `YYYY-MM-DD HH:MM:SS.ffffff` in UTC. RFC 3339 is
/// accepted on input as well.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
