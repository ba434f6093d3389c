//! In-process backend: rows in memory, change feed and presence fan-out over
//! unbounded channels. Used by the demo binary and the test suites.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bidroom_shared::{
    Attachment, BackendError, EventKind, MessageRow, NewMessage, NewReaction, PresenceMember,
    PresenceMessage, Profile, RawChange, ReactionRow, Table,
};
use chrono::{DateTime, Utc};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use super::{
    ChangeFeedTransport, DataBackend, FeedSignal, FeedStream, OutgoingAttachment, PresenceLink,
    PresenceTransport,
};

/// Shared in-memory backend. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    messages: Vec<MessageRow>,
    reactions: Vec<ReactionRow>,
    profiles: HashMap<String, Profile>,
    participants: HashMap<String, Vec<String>>,
    sequences: HashMap<String, i64>,
    last_created_at: Option<DateTime<Utc>>,
    feeds: Vec<FeedSub>,
    topics: HashMap<String, Vec<PresenceSub>>,
    next_sub_id: u64,
    open_count: usize,
    failures: Failures,
    write_latency: Duration,
    fetch_latency: Duration,
}

struct FeedSub {
    tables: Vec<Table>,
    tx: UnboundedSender<FeedSignal>,
}

struct PresenceSub {
    id: u64,
    user_id: String,
    tx: UnboundedSender<PresenceMessage>,
}

/// Remaining injected failures per operation.
#[derive(Default)]
struct Failures {
    fetches: u32,
    inserts: u32,
    reactions: u32,
    uploads: u32,
    mark_read: u32,
    opens: u32,
    stalled_opens: u32,
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

fn injected(what: &str) -> BackendError {
    BackendError::Network(format!("injected {what} failure"))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, id: &str, full_name: &str) -> Self {
        self.state.lock().profiles.insert(
            id.to_string(),
            Profile {
                id: id.to_string(),
                full_name: Some(full_name.to_string()),
                avatar_url: None,
            },
        );
        self
    }

    /// Register the participants of a conversation (used for unread counts).
    pub fn with_conversation(self, id: &str, users: &[&str]) -> Self {
        self.state.lock().participants.insert(
            id.to_string(),
            users.iter().map(|u| u.to_string()).collect(),
        );
        self
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.state.lock().failures.fetches = n;
    }

    pub fn fail_next_inserts(&self, n: u32) {
        self.state.lock().failures.inserts = n;
    }

    pub fn fail_next_reactions(&self, n: u32) {
        self.state.lock().failures.reactions = n;
    }

    pub fn fail_next_uploads(&self, n: u32) {
        self.state.lock().failures.uploads = n;
    }

    pub fn fail_next_mark_read(&self, n: u32) {
        self.state.lock().failures.mark_read = n;
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().failures.opens = n;
    }

    /// The next `n` feed opens never complete their handshake.
    pub fn stall_next_opens(&self, n: u32) {
        self.state.lock().failures.stalled_opens = n;
    }

    /// Delay applied to every write before it lands.
    pub fn set_write_latency(&self, latency: Duration) {
        self.state.lock().write_latency = latency;
    }

    /// Delay between reading a page and returning it, so writes can land in between.
    pub fn set_fetch_latency(&self, latency: Duration) {
        self.state.lock().fetch_latency = latency;
    }

    /// Number of feed opens attempted so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Live feed wire connections.
    pub fn live_feeds(&self) -> usize {
        let mut state = self.state.lock();
        state.feeds.retain(|feed| !feed.tx.is_closed());
        state.feeds.len()
    }

    /// Members currently joined to a presence topic.
    pub fn presence_members(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Drop every live feed as if the socket died.
    pub fn disconnect_feeds(&self) {
        let feeds = std::mem::take(&mut self.state.lock().feeds);
        for feed in feeds {
            let _ = feed.tx.unbounded_send(FeedSignal::Closed("server went away".to_string()));
        }
    }

    /// Push an arbitrary change payload to every feed registered for its table.
    pub fn inject_change(&self, raw: RawChange) {
        self.state.lock().emit(raw);
    }

    /// Transport-level heartbeat to every live feed.
    pub fn heartbeat(&self) {
        let mut state = self.state.lock();
        state
            .feeds
            .retain(|feed| feed.tx.unbounded_send(FeedSignal::Heartbeat).is_ok());
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<MessageRow> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn reactions(&self) -> Vec<ReactionRow> {
        self.state.lock().reactions.clone()
    }

    async fn latency(&self) {
        let latency = self.state.lock().write_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl State {
    fn emit(&mut self, raw: RawChange) {
        let table = Table::parse(&raw.table).ok();
        self.feeds.retain(|feed| {
            let wanted = table.map_or(true, |t| feed.tables.contains(&t));
            !wanted || feed.tx.unbounded_send(FeedSignal::Change(raw.clone())).is_ok()
        });
    }

    /// Strictly increasing creation timestamps keep cursor pagination exact.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_created_at = Some(ts);
        ts
    }

    fn broadcast_sync(&self, topic: &str) {
        let Some(subs) = self.topics.get(topic) else {
            return;
        };
        let mut present: Vec<String> = subs.iter().map(|s| s.user_id.clone()).collect();
        present.sort();
        present.dedup();
        for sub in subs {
            let _ = sub.tx.unbounded_send(PresenceMessage::Sync {
                present: present.clone(),
            });
        }
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn fetch_messages_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let (mut rows, latency) = {
            let mut state = self.state.lock();
            if take(&mut state.failures.fetches) {
                return Err(injected("fetch"));
            }
            let rows: Vec<MessageRow> = state
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .filter(|m| before.map_or(true, |cursor| m.created_at < cursor))
                .cloned()
                .collect();
            (rows, state.fetch_latency)
        };
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError> {
        self.latency().await;
        let mut state = self.state.lock();
        if take(&mut state.failures.inserts) {
            return Err(injected("insert"));
        }
        let sequence = {
            let counter = state
                .sequences
                .entry(message.conversation_id.clone())
                .or_insert(0);
            *counter += 1;
            *counter
        };
        let row = MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: state.next_created_at(),
            sequence: Some(sequence),
            read_at: None,
            attachment_url: message.attachment_url.clone(),
            attachment_type: message.attachment_type.clone(),
            attachment_name: message.attachment_name.clone(),
            client_nonce: message.client_nonce.clone(),
        };
        state.messages.push(row.clone());
        state.emit(RawChange::from_rows(
            Table::Messages,
            EventKind::Insert,
            Some(&row),
            None,
        ));
        Ok(row)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<Vec<MessageRow>, BackendError> {
        self.latency().await;
        let mut state = self.state.lock();
        if take(&mut state.failures.mark_read) {
            return Err(injected("mark read"));
        }
        let now = Utc::now();
        let mut changed = Vec::new();
        for row in state.messages.iter_mut() {
            if row.conversation_id == conversation_id
                && row.sender_id != reader_id
                && row.read_at.is_none()
            {
                let old = row.clone();
                row.read_at = Some(now);
                changed.push((old, row.clone()));
            }
        }
        for (old, new) in &changed {
            state.emit(RawChange::from_rows(
                Table::Messages,
                EventKind::Update,
                Some(new),
                Some(old),
            ));
        }
        Ok(changed.into_iter().map(|(_, new)| new).collect())
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64, BackendError> {
        let state = self.state.lock();
        let count = state
            .messages
            .iter()
            .filter(|m| m.sender_id != user_id && m.read_at.is_none())
            .filter(|m| {
                state
                    .participants
                    .get(&m.conversation_id)
                    .map_or(false, |users| users.iter().any(|u| u == user_id))
            })
            .count();
        Ok(count as u64)
    }

    async fn fetch_reactions(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>, BackendError> {
        let state = self.state.lock();
        Ok(state
            .reactions
            .iter()
            .filter(|r| message_ids.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn add_reaction(&self, reaction: &NewReaction) -> Result<ReactionRow, BackendError> {
        self.latency().await;
        let mut state = self.state.lock();
        if take(&mut state.failures.reactions) {
            return Err(injected("reaction"));
        }
        let duplicate = state.reactions.iter().any(|r| {
            r.message_id == reaction.message_id
                && r.user_id == reaction.user_id
                && r.emoji == reaction.emoji
        });
        if duplicate {
            return Err(BackendError::Rejected("duplicate reaction".to_string()));
        }
        let row = ReactionRow {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: reaction.message_id.clone(),
            user_id: reaction.user_id.clone(),
            emoji: reaction.emoji.clone(),
            created_at: Utc::now(),
        };
        state.reactions.push(row.clone());
        state.emit(RawChange::from_rows(
            Table::MessageReactions,
            EventKind::Insert,
            Some(&row),
            None,
        ));
        Ok(row)
    }

    async fn remove_reaction(&self, reaction_id: &str) -> Result<(), BackendError> {
        self.latency().await;
        let mut state = self.state.lock();
        if take(&mut state.failures.reactions) {
            return Err(injected("reaction"));
        }
        let Some(pos) = state.reactions.iter().position(|r| r.id == reaction_id) else {
            return Err(BackendError::NotFound(format!("reaction {reaction_id}")));
        };
        state.reactions.remove(pos);
        // Deletes carry only the primary key, as with a default replica identity.
        let key = json!({ "id": reaction_id });
        state.emit(RawChange::from_rows(
            Table::MessageReactions,
            EventKind::Delete,
            None,
            Some(&key),
        ));
        Ok(())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, BackendError> {
        self.state
            .lock()
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &OutgoingAttachment,
    ) -> Result<Attachment, BackendError> {
        self.latency().await;
        if take(&mut self.state.lock().failures.uploads) {
            return Err(injected("upload"));
        }
        Ok(Attachment {
            url: format!(
                "memory://attachments/{}/{}-{}",
                conversation_id,
                uuid::Uuid::new_v4(),
                attachment.name
            ),
            mime: attachment.mime.clone(),
            name: attachment.name.clone(),
        })
    }
}

#[async_trait]
impl ChangeFeedTransport for MemoryBackend {
    async fn open(&self, tables: &[Table]) -> Result<FeedStream, BackendError> {
        let stalled = {
            let mut state = self.state.lock();
            state.open_count += 1;
            if take(&mut state.failures.opens) {
                return Err(injected("open"));
            }
            take(&mut state.failures.stalled_opens)
        };
        if stalled {
            futures_util::future::pending::<()>().await;
        }

        let (tx, rx) = unbounded();
        self.state.lock().feeds.push(FeedSub {
            tables: tables.to_vec(),
            tx,
        });
        crate::log_debug!("Memory feed opened for {} table(s)", tables.len());
        Ok(rx.boxed())
    }
}

#[async_trait]
impl PresenceTransport for MemoryBackend {
    async fn join(&self, topic: &str, member: &PresenceMember) -> Result<PresenceLink, BackendError> {
        let (in_tx, in_rx) = unbounded::<PresenceMessage>();
        let (out_tx, mut out_rx) = unbounded::<PresenceMessage>();

        let sub_id = {
            let mut state = self.state.lock();
            state.next_sub_id += 1;
            let id = state.next_sub_id;
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(PresenceSub {
                    id,
                    user_id: member.user_id.clone(),
                    tx: in_tx,
                });
            state.broadcast_sync(topic);
            id
        };

        // Fan outbound messages to every other member; leave when the sender drops.
        let state = self.state.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.next().await {
                if matches!(msg, PresenceMessage::Sync { .. }) {
                    continue;
                }
                let guard = state.lock();
                if let Some(subs) = guard.topics.get(&topic) {
                    for sub in subs.iter().filter(|s| s.id != sub_id) {
                        let _ = sub.tx.unbounded_send(msg.clone());
                    }
                }
            }
            let mut guard = state.lock();
            if let Some(subs) = guard.topics.get_mut(&topic) {
                subs.retain(|s| s.id != sub_id);
                if subs.is_empty() {
                    guard.topics.remove(&topic);
                }
            }
            guard.broadcast_sync(&topic);
        });

        Ok(PresenceLink {
            outbound: out_tx,
            inbound: in_rx.boxed(),
        })
    }
}
