//! Row schemas and change-feed types shared by the realtime core and the backend bindings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// --- Tables & Events ---

/// Tables the change feed tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    MessageReactions,
}

impl Table {
    /// Every table the shared connection registers for.
    pub const ALL: [Table; 2] = [Table::Messages, Table::MessageReactions];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::MessageReactions => "message_reactions",
        }
    }

    pub fn parse(name: &str) -> Result<Self, DecodeError> {
        match name {
            "messages" => Ok(Table::Messages),
            "message_reactions" => Ok(Table::MessageReactions),
            other => Err(DecodeError::UnknownTable(other.to_string())),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row-level change carried by a change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn parse(kind: &str) -> Result<Self, DecodeError> {
        match kind.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventKind::Insert),
            "UPDATE" => Ok(EventKind::Update),
            "DELETE" => Ok(EventKind::Delete),
            _ => Err(DecodeError::UnknownEventKind(kind.to_string())),
        }
    }
}

/// Event filter a subscriber registers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventFilter {
    Insert,
    Update,
    Delete,
    Any,
}

impl EventFilter {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Insert => kind == EventKind::Insert,
            EventFilter::Update => kind == EventKind::Update,
            EventFilter::Delete => kind == EventKind::Delete,
        }
    }

    /// Value used in a `postgres_changes` join config.
    pub fn as_wire(&self) -> &'static str {
        match self {
            EventFilter::Insert => "INSERT",
            EventFilter::Update => "UPDATE",
            EventFilter::Delete => "DELETE",
            EventFilter::Any => "*",
        }
    }
}

// --- Rows ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub name: String,
}

/// A persisted row of the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Per-conversation counter, when the backend assigns one.
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub attachment_type: Option<String>,
    #[serde(default)]
    pub attachment_name: Option<String>,
    /// Temporary id of the optimistic record this row was written from.
    #[serde(default)]
    pub client_nonce: Option<String>,
}

impl MessageRow {
    pub fn attachment(&self) -> Option<Attachment> {
        let url = self.attachment_url.clone()?;
        Some(Attachment {
            url,
            mime: self
                .attachment_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            name: self.attachment_name.clone().unwrap_or_default(),
        })
    }
}

/// A persisted row of the `message_reactions` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Public profile of a marketplace user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "Someone",
        }
    }
}

// --- Mutations ---

/// Insert body for a new message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

impl NewMessage {
    pub fn with_attachment(mut self, attachment: &Attachment) -> Self {
        self.attachment_url = Some(attachment.url.clone());
        self.attachment_type = Some(attachment.mime.clone());
        self.attachment_name = Some(attachment.name.clone());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewReaction {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

// --- Change Feed ---

/// A decoded row, tagged by table.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Message(MessageRow),
    Reaction(ReactionRow),
}

impl Row {
    pub fn id(&self) -> &str {
        match self {
            Row::Message(m) => &m.id,
            Row::Reaction(r) => &r.id,
        }
    }
}

/// A change-feed event with strongly-typed rows.
///
/// `old` is only present when the backend ships the full previous row;
/// `old_id` survives even when it only ships the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    pub old: Option<Row>,
    pub new: Option<Row>,
    pub old_id: Option<String>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new_message(&self) -> Option<&MessageRow> {
        match &self.new {
            Some(Row::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn old_message(&self) -> Option<&MessageRow> {
        match &self.old {
            Some(Row::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn new_reaction(&self) -> Option<&ReactionRow> {
        match &self.new {
            Some(Row::Reaction(r)) => Some(r),
            _ => None,
        }
    }

    pub fn old_reaction(&self) -> Option<&ReactionRow> {
        match &self.old {
            Some(Row::Reaction(r)) => Some(r),
            _ => None,
        }
    }

    /// Id of the affected row: the new row's, else the old row's.
    pub fn row_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .map(Row::id)
            .or_else(|| self.old.as_ref().map(Row::id))
            .or(self.old_id.as_deref())
    }
}

// --- Notifications ---

/// Ephemeral in-app notification for an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    /// Source message id, used for dedup.
    pub id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    /// Preview text, already truncated for display.
    pub message: String,
    pub conversation_id: String,
}

// --- Presence ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingEntry {
    pub user_id: String,
    pub name: String,
    pub typing: bool,
}

/// Identity a client announces when joining a presence channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub user_id: String,
    pub name: String,
}

/// Messages exchanged over an ephemeral per-conversation channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum PresenceMessage {
    Typing(TypingEntry),
    /// Full set of user ids currently present on the channel.
    Sync { present: Vec<String> },
}
