//! Ordered, deduplicated message list for one conversation.
//!
//! The list is the single in-memory copy of every message the conversation
//! has loaded. Records are keyed by id; optimistic records use a temporary id
//! that is also sent to the backend as `client_nonce`, so whichever of the
//! insert response and the change-feed echo lands first replaces the temporary
//! record and the other one merges into it.

use std::cmp::Ordering;

use bidroom_shared::{Attachment, MessageRow};
use chrono::{DateTime, Utc};

/// Prefix of locally generated message ids.
pub const TEMP_ID_PREFIX: &str = "temp-";

pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Combine two observations of the same message; never moves backwards.
    pub fn merge(self, incoming: MessageStatus) -> MessageStatus {
        match (self.rank(), incoming.rank()) {
            (Some(current), Some(next)) if next < current => self,
            _ => incoming,
        }
    }
}

/// A message as the conversation view sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sequence: Option<i64>,
    pub read_at: Option<DateTime<Utc>>,
    pub attachment: Option<Attachment>,
    pub status: MessageStatus,
    pub client_nonce: Option<String>,
}

impl Message {
    /// Authoritative record from a persisted row.
    pub fn from_row(row: &MessageRow) -> Self {
        Self {
            id: row.id.clone(),
            conversation_id: row.conversation_id.clone(),
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            created_at: row.created_at,
            sequence: row.sequence,
            read_at: row.read_at,
            attachment: row.attachment(),
            status: if row.read_at.is_some() {
                MessageStatus::Read
            } else {
                MessageStatus::Sent
            },
            client_nonce: row.client_nonce.clone(),
        }
    }

    /// Optimistic record shown before the backend confirms the write.
    pub fn pending(
        temp_id: String,
        conversation_id: &str,
        sender_id: &str,
        content: Option<String>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: temp_id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            created_at: Utc::now(),
            sequence: None,
            read_at: None,
            attachment,
            status: MessageStatus::Sending,
            client_nonce: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Fold a newer observation of the same message in. Read marks are never cleared.
    fn absorb(&mut self, other: Message) {
        let status = self.status.merge(other.status);
        let read_at = other.read_at.or(self.read_at);
        self.id = other.id;
        self.content = other.content;
        self.created_at = other.created_at;
        self.sequence = other.sequence.or(self.sequence);
        self.attachment = other.attachment.or(self.attachment.take());
        self.client_nonce = other.client_nonce.or(self.client_nonce.take());
        self.read_at = read_at;
        self.status = if read_at.is_some() {
            status.merge(MessageStatus::Read)
        } else {
            status
        };
    }
}

/// Display order: `sequence` when both sides carry one, else `created_at`.
pub fn display_order(a: &Message, b: &Message) -> Ordering {
    match (a.sequence, b.sequence) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.created_at.cmp(&b.created_at),
    }
}

/// Partial update of a message's mutable fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub read_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// What `MessageList::add` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// An optimistic record with a matching nonce was replaced.
    Reconciled,
    /// Already present; merged in place.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageList {
    messages: Vec<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Pagination cursor: creation time of the oldest loaded message.
    pub fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.created_at).min()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Insert after every record that sorts before or equal to `msg`.
    fn insert_sorted(&mut self, msg: Message) {
        let pos = self
            .messages
            .partition_point(|m| display_order(m, &msg) != Ordering::Greater);
        self.messages.insert(pos, msg);
    }

    /// Insert a message unless one with the same id exists.
    pub fn add(&mut self, msg: Message) -> AddOutcome {
        if let Some(pos) = self.position(&msg.id) {
            self.messages[pos].absorb(msg);
            return AddOutcome::Duplicate;
        }
        if let Some(nonce) = msg.client_nonce.clone() {
            if self.position(&nonce).is_some() {
                self.replace(&nonce, msg);
                return AddOutcome::Reconciled;
            }
        }
        self.insert_sorted(msg);
        AddOutcome::Inserted
    }

    /// Swap a temporary record for its authoritative counterpart.
    ///
    /// If the temporary record is already gone (an echo got there first) the
    /// authoritative record is merged or added instead, so the list never
    /// holds two copies.
    pub fn replace(&mut self, temp_id: &str, real: Message) -> bool {
        let Some(pos) = self.position(temp_id) else {
            self.add(real);
            return false;
        };
        let mut record = self.messages.remove(pos);
        if let Some(existing) = self.position(&real.id) {
            // Both copies made it in; keep one.
            self.messages[existing].absorb(real);
            return true;
        }
        record.absorb(real);
        self.insert_sorted(record);
        true
    }

    pub fn update(&mut self, id: &str, patch: MessagePatch) -> bool {
        let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        if let Some(status) = patch.status {
            msg.status = status;
        }
        if let Some(read_at) = patch.read_at {
            msg.read_at = Some(read_at);
        }
        if let Some(content) = patch.content {
            msg.content = Some(content);
        }
        true
    }

    /// Merge an authoritative observation into an existing record (read wins).
    pub fn merge(&mut self, incoming: Message) -> bool {
        match self.position(&incoming.id) {
            Some(pos) => {
                self.messages[pos].absorb(incoming);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let pos = self.position(id)?;
        Some(self.messages.remove(pos))
    }

    /// Merge a page of history in; returns how many records were new.
    pub fn extend_history(&mut self, page: impl IntoIterator<Item = Message>) -> usize {
        page.into_iter()
            .filter(|msg| self.add(msg.clone()) == AddOutcome::Inserted)
            .count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64, sequence: Option<i64>) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: Some(id.into()),
            created_at: at(secs),
            sequence,
            read_at: None,
            attachment: None,
            status: MessageStatus::Sent,
            client_nonce: None,
        }
    }

    fn ids(list: &MessageList) -> Vec<&str> {
        list.as_slice().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn add_is_idempotent() {
        let mut list = MessageList::new();
        assert_eq!(list.add(msg("a", 1, None)), AddOutcome::Inserted);
        assert_eq!(list.add(msg("a", 1, None)), AddOutcome::Duplicate);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn orders_by_sequence_then_time_with_stable_ties() {
        let mut list = MessageList::new();
        list.add(msg("late-seq1", 50, Some(1)));
        list.add(msg("early-seq2", 10, Some(2)));
        assert_eq!(ids(&list), vec!["late-seq1", "early-seq2"]);

        let mut list = MessageList::new();
        list.add(msg("first", 5, None));
        list.add(msg("second", 5, None));
        list.add(msg("zero", 0, None));
        assert_eq!(ids(&list), vec!["zero", "first", "second"]);
    }

    #[test]
    fn echo_with_nonce_replaces_optimistic_record() {
        let mut list = MessageList::new();
        let temp = Message::pending("temp-1".into(), "c1", "u1", Some("hi".into()), None);
        list.add(temp);

        let mut echo = msg("real-1", 1, Some(1));
        echo.client_nonce = Some("temp-1".into());
        echo.status = MessageStatus::Delivered;
        assert_eq!(list.add(echo), AddOutcome::Reconciled);
        assert_eq!(ids(&list), vec!["real-1"]);

        // The insert response arriving afterwards merges instead of duplicating.
        let response = msg("real-1", 1, Some(1));
        assert!(!list.replace("temp-1", response));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("real-1").unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn read_marks_are_never_cleared() {
        let mut list = MessageList::new();
        let mut read = msg("a", 1, None);
        read.read_at = Some(at(2));
        read.status = MessageStatus::Read;
        list.add(read);

        assert!(list.merge(msg("a", 1, None)));
        let merged = list.get("a").unwrap();
        assert_eq!(merged.read_at, Some(at(2)));
        assert_eq!(merged.status, MessageStatus::Read);
    }

    #[test]
    fn status_merge_precedence() {
        use MessageStatus::*;
        assert_eq!(Sent.merge(Sending), Sent);
        assert_eq!(Delivered.merge(Sent), Delivered);
        assert_eq!(Sent.merge(Read), Read);
        assert_eq!(Failed.merge(Sent), Sent);
        assert_eq!(Sending.merge(Failed), Failed);
    }

    #[test]
    fn update_patches_without_reordering() {
        let mut list = MessageList::new();
        list.add(msg("a", 1, None));
        list.add(msg("b", 2, None));
        assert!(list.update("a", MessagePatch::status(MessageStatus::Failed)));
        assert_eq!(ids(&list), vec!["a", "b"]);
        assert_eq!(list.get("a").unwrap().status, MessageStatus::Failed);
        assert_eq!(list.get("a").unwrap().content.as_deref(), Some("a"));
        assert!(!list.update("missing", MessagePatch::default()));
    }

    #[test]
    fn history_merges_and_counts_new_records() {
        let mut list = MessageList::new();
        list.add(msg("c", 3, None));
        let inserted = list.extend_history(vec![msg("a", 1, None), msg("b", 2, None), msg("c", 3, None)]);
        assert_eq!(inserted, 2);
        assert_eq!(ids(&list), vec!["a", "b", "c"]);
        assert_eq!(list.oldest_created_at(), Some(at(1)));
    }
}
