//! Realtime socket protocol: Phoenix channel frames and change payload decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::DecodeError;
use crate::models::{ChangeEvent, EventFilter, EventKind, MessageRow, ReactionRow, Row, Table};

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Protocol version sent in the socket URL.
pub const PROTOCOL_VSN: &str = "1.0.0";

/// Phoenix channel event names
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SYSTEM: &str = "system";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// One frame on the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhxFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl PhxFrame {
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self {
            join_ref: None,
            reference: Some(reference.into()),
            topic: PHOENIX_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: json!({}),
        }
    }

    pub fn join(topic: impl Into<String>, join_ref: impl Into<String>, payload: &JoinPayload) -> Self {
        let join_ref = join_ref.into();
        Self {
            join_ref: Some(join_ref.clone()),
            reference: Some(join_ref),
            topic: topic.into(),
            event: events::JOIN.to_string(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn leave(topic: impl Into<String>, join_ref: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            reference: Some(reference.into()),
            topic: topic.into(),
            event: events::LEAVE.to_string(),
            payload: json!({}),
        }
    }

    /// Client broadcast to every other member of a channel.
    pub fn broadcast(
        topic: impl Into<String>,
        join_ref: impl Into<String>,
        event: &str,
        payload: Value,
    ) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            reference: None,
            topic: topic.into(),
            event: events::BROADCAST.to_string(),
            payload: json!({ "type": "broadcast", "event": event, "payload": payload }),
        }
    }

    /// Announce this client's presence metadata on a channel.
    pub fn track(topic: impl Into<String>, join_ref: impl Into<String>, meta: Value) -> Self {
        Self {
            join_ref: Some(join_ref.into()),
            reference: None,
            topic: topic.into(),
            event: events::PRESENCE.to_string(),
            payload: json!({ "type": "presence", "event": "track", "payload": meta }),
        }
    }

    /// Classify an inbound frame.
    pub fn classify(self) -> Inbound {
        match self.event.as_str() {
            events::REPLY => {
                let status = self.payload.get("status").and_then(Value::as_str);
                let status = if status == Some("ok") {
                    ReplyStatus::Ok
                } else {
                    ReplyStatus::Error(reason_of(&self.payload))
                };
                Inbound::Reply {
                    reference: self.reference,
                    status,
                }
            }
            events::POSTGRES_CHANGES => {
                match self
                    .payload
                    .get("data")
                    .cloned()
                    .map(serde_json::from_value::<RawChange>)
                {
                    Some(Ok(raw)) => Inbound::Change(raw),
                    Some(Err(e)) => Inbound::Malformed(e.to_string()),
                    None => Inbound::Malformed("postgres_changes without data".to_string()),
                }
            }
            events::BROADCAST => Inbound::Broadcast {
                event: self
                    .payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                payload: self.payload.get("payload").cloned().unwrap_or(Value::Null),
            },
            events::PRESENCE_STATE => Inbound::PresenceState {
                present: presence_keys(&self.payload),
            },
            events::PRESENCE_DIFF => Inbound::PresenceDiff {
                joins: self.payload.get("joins").map(presence_keys).unwrap_or_default(),
                leaves: self.payload.get("leaves").map(presence_keys).unwrap_or_default(),
            },
            events::SYSTEM => {
                if self.payload.get("status").and_then(Value::as_str) == Some("error") {
                    Inbound::Error(reason_of(&self.payload))
                } else {
                    Inbound::Other
                }
            }
            events::ERROR => Inbound::Error(reason_of(&self.payload)),
            events::CLOSE => Inbound::Closed,
            _ => Inbound::Other,
        }
    }
}

fn reason_of(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .or_else(|| payload.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

/// Keys of a `presence_state` map (or the `joins`/`leaves` half of a diff).
pub fn presence_keys(value: &Value) -> Vec<String> {
    value
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error(String),
}

/// An inbound frame, classified by what the client must do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        reference: Option<String>,
        status: ReplyStatus,
    },
    Change(RawChange),
    Broadcast {
        event: String,
        payload: Value,
    },
    PresenceState {
        present: Vec<String>,
    },
    PresenceDiff {
        joins: Vec<String>,
        leaves: Vec<String>,
    },
    Error(String),
    Closed,
    Malformed(String),
    Other,
}

// --- Join Payloads ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinConfig {
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
    pub postgres_changes: Vec<PostgresChangeFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastConfig {
    pub ack: bool,
    #[serde(rename = "self")]
    pub echo_self: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceConfig {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresChangeFilter {
    pub event: String,
    pub schema: String,
    pub table: String,
}

impl JoinPayload {
    /// Join config for the shared change feed: one filter per table.
    pub fn postgres_changes(tables: &[Table], filter: EventFilter, access_token: Option<String>) -> Self {
        Self {
            config: JoinConfig {
                broadcast: BroadcastConfig {
                    ack: false,
                    echo_self: false,
                },
                presence: PresenceConfig { key: String::new() },
                postgres_changes: tables
                    .iter()
                    .map(|table| PostgresChangeFilter {
                        event: filter.as_wire().to_string(),
                        schema: "public".to_string(),
                        table: table.as_str().to_string(),
                    })
                    .collect(),
            },
            access_token,
        }
    }

    /// Join config for an ephemeral presence/broadcast channel keyed by user id.
    pub fn presence(key: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            config: JoinConfig {
                broadcast: BroadcastConfig {
                    ack: false,
                    echo_self: false,
                },
                presence: PresenceConfig { key: key.into() },
                postgres_changes: Vec::new(),
            },
            access_token,
        }
    }
}

// --- Change Payloads ---

/// Untyped change payload as it arrives off the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawChange {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
    /// Build a raw payload from typed rows (used by in-process backends).
    pub fn from_rows<T: Serialize>(table: Table, kind: EventKind, new: Option<&T>, old: Option<&T>) -> Self {
        let event_type = match kind {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
        };
        Self {
            schema: Some("public".to_string()),
            table: table.as_str().to_string(),
            event_type: event_type.to_string(),
            record: new.and_then(|row| serde_json::to_value(row).ok()),
            old_record: old.and_then(|row| serde_json::to_value(row).ok()),
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Decode into a typed event with per-table row schemas.
    pub fn decode(&self) -> Result<ChangeEvent, DecodeError> {
        let table = Table::parse(&self.table)?;
        let kind = EventKind::parse(&self.event_type)?;

        let new = match non_empty(self.record.as_ref()) {
            Some(value) => Some(decode_row(table, value)?),
            None => None,
        };
        // Old rows are frequently partial (primary key only); keep what decodes.
        let old_value = non_empty(self.old_record.as_ref());
        let old = old_value.and_then(|value| decode_row(table, value).ok());
        let old_id = old_value.and_then(|value| match value.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });

        let missing = match kind {
            EventKind::Insert | EventKind::Update => new.is_none(),
            EventKind::Delete => old.is_none() && old_id.is_none(),
        };
        if missing {
            return Err(DecodeError::MissingRow {
                table: self.table.clone(),
                kind: self.event_type.clone(),
            });
        }

        Ok(ChangeEvent {
            table,
            kind,
            old,
            new,
            old_id,
            commit_timestamp: self.commit_timestamp,
        })
    }
}

fn non_empty(value: Option<&Value>) -> Option<&Value> {
    match value {
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Null) | None => None,
        Some(other) => Some(other),
    }
}

fn decode_row(table: Table, value: &Value) -> Result<Row, DecodeError> {
    let malformed = |e: serde_json::Error| DecodeError::MalformedRow {
        table: table.as_str().to_string(),
        reason: e.to_string(),
    };
    match table {
        Table::Messages => MessageRow::deserialize(value).map(Row::Message).map_err(malformed),
        Table::MessageReactions => ReactionRow::deserialize(value)
            .map(Row::Reaction)
            .map_err(malformed),
    }
}
