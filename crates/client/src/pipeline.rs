//! Conversation message pipeline: paginated history, optimistic sends, and
//! live reconciliation against the change feed.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bidroom_shared::{
    Attachment, BackendError, ChangeEvent, EventFilter, EventKind, MessageRow, NewMessage, Table,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{AuthSession, DataBackend, OutgoingAttachment};
use crate::config::MessageConfig;
use crate::error::SendError;
use crate::realtime::{FeedConnection, Subscription};
use crate::stores::{new_temp_id, AddOutcome, Message, MessageList, MessagePatch, MessageStatus};

/// How the list changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    /// The most recent page was (re)loaded.
    Reset,
    /// Older history was prepended.
    Prepended { count: usize },
    /// A record landed at the bottom of the list.
    Appended { id: String, own: bool },
    /// A record landed somewhere above the bottom.
    Inserted { id: String },
    /// An optimistic record was swapped for its persisted counterpart.
    Replaced { temp_id: String, id: String },
    Updated { id: String },
    Removed { id: String },
}

/// What a view should do with its scroll position after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollIntent {
    ForceBottom,
    BottomIfPinned,
    Keep,
}

impl ListChange {
    pub fn scroll_intent(&self) -> ScrollIntent {
        match self {
            ListChange::Reset => ScrollIntent::ForceBottom,
            ListChange::Appended { own: true, .. } => ScrollIntent::ForceBottom,
            ListChange::Appended { own: false, .. } => ScrollIntent::BottomIfPinned,
            _ => ScrollIntent::Keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineUpdate {
    pub change: ListChange,
    /// List length after the change.
    pub len: usize,
}

/// Payload of a failed send, kept for retry.
#[derive(Clone)]
struct Outgoing {
    content: Option<String>,
    attachment: Option<OutgoingAttachment>,
}

#[derive(Default)]
struct PipelineState {
    list: MessageList,
    has_more: bool,
    loaded: bool,
    loading_more: bool,
    failed: HashMap<String, Outgoing>,
}

struct PipelineInner {
    conversation_id: String,
    session: AuthSession,
    backend: Arc<dyn DataBackend>,
    page_size: usize,
    state: Mutex<PipelineState>,
    updates: broadcast::Sender<PipelineUpdate>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Message list of one open conversation. Clones share state.
#[derive(Clone)]
pub struct ConversationPipeline {
    inner: Arc<PipelineInner>,
}

impl ConversationPipeline {
    pub fn new(
        conversation_id: impl Into<String>,
        session: AuthSession,
        backend: Arc<dyn DataBackend>,
        config: &MessageConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(PipelineInner {
                conversation_id: conversation_id.into(),
                session,
                backend,
                page_size: config.page_size.max(1),
                state: Mutex::new(PipelineState::default()),
                updates,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to the change feed, then load the most recent page.
    ///
    /// A failed initial fetch is logged; the pipeline stays live and can be
    /// refreshed with [`ConversationPipeline::fetch_messages`].
    pub async fn open(
        feed: &FeedConnection,
        conversation_id: impl Into<String>,
        session: AuthSession,
        backend: Arc<dyn DataBackend>,
        config: &MessageConfig,
    ) -> Self {
        let pipeline = Self::new(conversation_id, session, backend, config);
        pipeline.attach(feed);
        if let Err(e) = pipeline.fetch_messages().await {
            crate::log_warn!(
                "Initial fetch for {} failed: {}",
                pipeline.inner.conversation_id,
                e
            );
        }
        pipeline
    }

    /// Route message changes for this conversation into the list.
    pub fn attach(&self, feed: &FeedConnection) {
        let weak: Weak<PipelineInner> = Arc::downgrade(&self.inner);
        let subscription = feed.subscribe(Table::Messages, EventFilter::Any, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_change(event);
            }
            Ok(())
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    /// Load the most recent page, replacing loaded history.
    pub async fn fetch_messages(&self) -> Result<usize, BackendError> {
        let inner = &self.inner;
        let page = inner
            .backend
            .fetch_messages_page(&inner.conversation_id, None, inner.page_size)
            .await
            .inspect_err(|e| crate::log_warn!("Fetch for {} failed: {}", inner.conversation_id, e))?;

        let fetched = page.len();
        let len = {
            let mut state = inner.state.lock();
            let mut list = MessageList::new();
            list.extend_history(page.iter().rev().map(Message::from_row));

            // Keep local-only records and anything that arrived during the fetch.
            // An empty page bounds nothing, so every live record survives it.
            let cursor = list.oldest_created_at();
            for existing in state.list.as_slice() {
                let keep = existing.is_pending()
                    || cursor.map_or(true, |oldest| existing.created_at >= oldest);
                if keep {
                    list.add(existing.clone());
                }
            }

            state.list = list;
            state.has_more = fetched == inner.page_size;
            state.loaded = true;
            state.list.len()
        };
        crate::log_debug!(
            "Loaded {} message(s) for {} (more: {})",
            fetched,
            inner.conversation_id,
            fetched == inner.page_size
        );
        inner.emit(ListChange::Reset, len);
        Ok(fetched)
    }

    /// Fetch the next older page and prepend it. Returns how many records were added.
    pub async fn load_more(&self) -> Result<usize, BackendError> {
        let inner = &self.inner;
        let cursor = {
            let mut state = inner.state.lock();
            if state.loaded {
                if !state.has_more || state.loading_more {
                    return Ok(0);
                }
                let Some(cursor) = state.list.oldest_created_at() else {
                    return Ok(0);
                };
                state.loading_more = true;
                Some(cursor)
            } else {
                None
            }
        };
        let Some(cursor) = cursor else {
            return self.fetch_messages().await;
        };

        let result = inner
            .backend
            .fetch_messages_page(&inner.conversation_id, Some(cursor), inner.page_size)
            .await;

        let (added, len) = {
            let mut state = inner.state.lock();
            state.loading_more = false;
            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    crate::log_warn!("Loading older messages for {} failed: {}", inner.conversation_id, e);
                    return Err(e);
                }
            };
            state.has_more = page.len() == inner.page_size;
            let added = state.list.extend_history(page.iter().rev().map(Message::from_row));
            (added, state.list.len())
        };
        inner.emit(ListChange::Prepended { count: added }, len);
        Ok(added)
    }

    /// Insert a record unless one with its id is already present.
    pub fn add_message(&self, msg: Message) -> bool {
        self.inner.add(msg) != AddOutcome::Duplicate
    }

    pub fn replace_message(&self, temp_id: &str, real: Message) -> bool {
        self.inner.replace(temp_id, real)
    }

    pub fn update_message(&self, id: &str, patch: MessagePatch) -> bool {
        let (updated, len) = {
            let mut state = self.inner.state.lock();
            (state.list.update(id, patch), state.list.len())
        };
        if updated {
            self.inner.emit(ListChange::Updated { id: id.to_string() }, len);
        }
        updated
    }

    pub fn remove_message(&self, id: &str) -> bool {
        self.inner.remove(id)
    }

    /// Send a message optimistically.
    ///
    /// The record appears immediately as SENDING. On success it is replaced
    /// by the persisted record; on failure it stays in the list as FAILED
    /// and can be re-sent with [`ConversationPipeline::retry`].
    pub async fn send(
        &self,
        content: impl Into<String>,
        attachment: Option<OutgoingAttachment>,
    ) -> Result<Message, SendError> {
        let content = content.into();
        let content = if content.trim().is_empty() {
            None
        } else {
            Some(content)
        };
        if content.is_none() && attachment.is_none() {
            return Err(SendError::Empty);
        }
        self.send_as(new_temp_id(), Outgoing { content, attachment }).await
    }

    /// Re-send a FAILED message under a new temporary id.
    pub async fn retry(&self, failed_id: &str) -> Result<Message, SendError> {
        let outgoing = {
            let mut state = self.inner.state.lock();
            let failed = state
                .list
                .get(failed_id)
                .is_some_and(|m| m.status == MessageStatus::Failed);
            if !failed {
                return Err(SendError::NotRetryable(failed_id.to_string()));
            }
            state
                .failed
                .remove(failed_id)
                .ok_or_else(|| SendError::NotRetryable(failed_id.to_string()))?
        };
        self.inner.remove(failed_id);
        crate::log_info!("Retrying failed message {}", failed_id);
        self.send_as(new_temp_id(), outgoing).await
    }

    async fn send_as(&self, temp_id: String, outgoing: Outgoing) -> Result<Message, SendError> {
        let inner = &self.inner;
        let preview = outgoing.attachment.as_ref().map(|a| Attachment {
            url: String::new(),
            mime: a.mime.clone(),
            name: a.name.clone(),
        });
        let pending = Message::pending(
            temp_id.clone(),
            &inner.conversation_id,
            &inner.session.user_id,
            outgoing.content.clone(),
            preview,
        );
        inner.add(pending);

        match self.persist(&temp_id, &outgoing).await {
            Ok(row) => {
                let real = Message::from_row(&row);
                let id = real.id.clone();
                inner.replace(&temp_id, real);
                let stored = inner.state.lock().list.get(&id).cloned();
                Ok(stored.unwrap_or_else(|| Message::from_row(&row)))
            }
            Err(source) => {
                crate::log_warn!("Send of {} failed: {}", temp_id, source);
                let len = {
                    let mut state = inner.state.lock();
                    state
                        .list
                        .update(&temp_id, MessagePatch::status(MessageStatus::Failed));
                    state.failed.insert(temp_id.clone(), outgoing);
                    state.list.len()
                };
                inner.emit(ListChange::Updated { id: temp_id.clone() }, len);
                Err(SendError::Backend { temp_id, source })
            }
        }
    }

    async fn persist(&self, temp_id: &str, outgoing: &Outgoing) -> Result<MessageRow, BackendError> {
        let inner = &self.inner;
        let mut insert = NewMessage {
            conversation_id: inner.conversation_id.clone(),
            sender_id: inner.session.user_id.clone(),
            content: outgoing.content.clone(),
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
            client_nonce: Some(temp_id.to_string()),
        };
        if let Some(file) = &outgoing.attachment {
            let uploaded = inner
                .backend
                .upload_attachment(&inner.conversation_id, file)
                .await?;
            insert = insert.with_attachment(&uploaded);
        }
        inner.backend.insert_message(&insert).await
    }

    /// Mark every inbound message of the conversation read. Returns how many changed.
    pub async fn mark_read(&self) -> Result<usize, BackendError> {
        let inner = &self.inner;
        let rows = inner
            .backend
            .mark_conversation_read(&inner.conversation_id, &inner.session.user_id)
            .await?;
        for row in &rows {
            inner.merge_row(row);
        }
        Ok(rows.len())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().list.as_slice().to_vec()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.inner.state.lock().list.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().list.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.state.lock().loaded
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineUpdate> {
        self.inner.updates.subscribe()
    }

    /// Stop receiving change-feed events.
    pub fn close(&self) {
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

impl PipelineInner {
    fn emit(&self, change: ListChange, len: usize) {
        let _ = self.updates.send(PipelineUpdate { change, len });
    }

    fn add(&self, msg: Message) -> AddOutcome {
        let id = msg.id.clone();
        let nonce = msg.client_nonce.clone();
        let own = msg.sender_id == self.session.user_id;
        let (outcome, at_bottom, len) = {
            let mut state = self.state.lock();
            let outcome = state.list.add(msg);
            if let (AddOutcome::Reconciled, Some(nonce)) = (outcome, nonce.as_deref()) {
                // The write landed after all; nothing is left to retry.
                state.failed.remove(nonce);
            }
            let at_bottom = state.list.newest().is_some_and(|m| m.id == id);
            (outcome, at_bottom, state.list.len())
        };
        let change = match outcome {
            AddOutcome::Inserted if at_bottom => ListChange::Appended { id, own },
            AddOutcome::Inserted => ListChange::Inserted { id },
            AddOutcome::Reconciled => ListChange::Replaced {
                temp_id: nonce.unwrap_or_default(),
                id,
            },
            AddOutcome::Duplicate => ListChange::Updated { id },
        };
        self.emit(change, len);
        outcome
    }

    fn replace(&self, temp_id: &str, real: Message) -> bool {
        let id = real.id.clone();
        let (replaced, len) = {
            let mut state = self.state.lock();
            (state.list.replace(temp_id, real), state.list.len())
        };
        let change = if replaced {
            ListChange::Replaced {
                temp_id: temp_id.to_string(),
                id,
            }
        } else {
            ListChange::Updated { id }
        };
        self.emit(change, len);
        replaced
    }

    fn remove(&self, id: &str) -> bool {
        let (removed, len) = {
            let mut state = self.state.lock();
            state.failed.remove(id);
            (state.list.remove(id).is_some(), state.list.len())
        };
        if removed {
            self.emit(ListChange::Removed { id: id.to_string() }, len);
        }
        removed
    }

    fn merge_row(&self, row: &MessageRow) {
        let (merged, len) = {
            let mut state = self.state.lock();
            (state.list.merge(Message::from_row(row)), state.list.len())
        };
        if merged {
            self.emit(ListChange::Updated { id: row.id.clone() }, len);
        }
    }

    fn apply_change(&self, event: &ChangeEvent) {
        match event.kind {
            EventKind::Insert => {
                let Some(row) = event.new_message() else {
                    return;
                };
                if row.conversation_id != self.conversation_id {
                    return;
                }
                let mut msg = Message::from_row(row);
                if msg.sender_id == self.session.user_id {
                    // The feed only echoes what the server has stored.
                    msg.status = msg.status.merge(MessageStatus::Delivered);
                }
                self.add(msg);
            }
            EventKind::Update => {
                let Some(row) = event.new_message() else {
                    return;
                };
                if row.conversation_id == self.conversation_id {
                    self.merge_row(row);
                }
            }
            EventKind::Delete => {
                let in_scope = event
                    .old_message()
                    .map_or(true, |row| row.conversation_id == self.conversation_id);
                if let (true, Some(id)) = (in_scope, event.row_id()) {
                    self.remove(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::time::Duration;

    fn pipeline(backend: &MemoryBackend, user: &str, page_size: usize) -> ConversationPipeline {
        ConversationPipeline::new(
            "c1",
            AuthSession::new(user, user),
            Arc::new(backend.clone()),
            &MessageConfig { page_size },
        )
    }

    async fn seed(backend: &MemoryBackend, count: usize) {
        for i in 0..count {
            backend
                .insert_message(&NewMessage {
                    conversation_id: "c1".into(),
                    sender_id: "other".into(),
                    content: Some(format!("m{i}")),
                    attachment_url: None,
                    attachment_type: None,
                    attachment_name: None,
                    client_nonce: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fetch_reverses_to_ascending() {
        let backend = MemoryBackend::new();
        seed(&backend, 3).await;
        let p = pipeline(&backend, "me", 50);
        assert_eq!(p.fetch_messages().await.unwrap(), 3);
        let contents: Vec<_> = p.messages().into_iter().filter_map(|m| m.content).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2"]);
        assert!(!p.has_more());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_state_untouched() {
        let backend = MemoryBackend::new();
        seed(&backend, 3).await;
        let p = pipeline(&backend, "me", 2);
        p.fetch_messages().await.unwrap();

        backend.fail_next_fetches(1);
        assert!(p.load_more().await.is_err());
        assert_eq!(p.len(), 2);
        assert!(p.has_more());
        assert_eq!(p.load_more().await.unwrap(), 1);
        assert_eq!(p.len(), 3);
    }

    #[tokio::test]
    async fn empty_send_is_rejected() {
        let backend = MemoryBackend::new();
        let p = pipeline(&backend, "me", 50);
        assert_eq!(p.send("   ", None).await.unwrap_err(), SendError::Empty);
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn attachment_upload_failure_marks_failed() {
        let backend = MemoryBackend::new();
        backend.fail_next_uploads(1);
        let p = pipeline(&backend, "me", 50);
        let file = OutgoingAttachment {
            name: "invoice.pdf".into(),
            mime: "application/pdf".into(),
            bytes: vec![1, 2, 3],
        };
        let err = p.send("", Some(file)).await.unwrap_err();
        let SendError::Backend { temp_id, .. } = err else {
            panic!("expected backend error");
        };
        assert_eq!(p.message(&temp_id).unwrap().status, MessageStatus::Failed);

        let sent = p.retry(&temp_id).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert!(sent.attachment.unwrap().url.starts_with("memory://"));
        assert_eq!(p.len(), 1);
    }

    #[tokio::test]
    async fn retry_rejects_non_failed_messages() {
        let backend = MemoryBackend::new();
        let p = pipeline(&backend, "me", 50);
        let sent = p.send("hi", None).await.unwrap();
        assert!(matches!(p.retry(&sent.id).await, Err(SendError::NotRetryable(_))));
    }

    #[tokio::test]
    async fn mark_read_applies_returned_rows() {
        let backend = MemoryBackend::new();
        seed(&backend, 2).await;
        let p = pipeline(&backend, "me", 50);
        p.fetch_messages().await.unwrap();
        assert_eq!(p.mark_read().await.unwrap(), 2);
        assert!(p
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Read && m.read_at.is_some()));
    }

    async fn fetch_with_live_insert(seeded: usize) -> (MemoryBackend, ConversationPipeline) {
        let backend = MemoryBackend::new();
        seed(&backend, seeded).await;
        backend.set_fetch_latency(Duration::from_millis(100));
        let p = pipeline(&backend, "me", 50);

        let fetching = tokio::spawn({
            let p = p.clone();
            async move { p.fetch_messages().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let live = backend
            .insert_message(&NewMessage {
                conversation_id: "c1".into(),
                sender_id: "other".into(),
                content: Some("live".into()),
                attachment_url: None,
                attachment_type: None,
                attachment_name: None,
                client_nonce: None,
            })
            .await
            .unwrap();
        assert!(p.add_message(Message::from_row(&live)));

        assert_eq!(fetching.await.unwrap().unwrap(), seeded);
        (backend, p)
    }

    #[tokio::test(start_paused = true)]
    async fn live_message_survives_empty_first_page() {
        let (backend, p) = fetch_with_live_insert(0).await;
        assert_eq!(p.len(), backend.messages("c1").len());
        assert_eq!(p.messages()[0].content.as_deref(), Some("live"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_message_survives_page_refresh() {
        let (backend, p) = fetch_with_live_insert(2).await;
        assert_eq!(p.len(), 3);
        assert_eq!(p.len(), backend.messages("c1").len());
        assert_eq!(p.messages().last().and_then(|m| m.content.as_deref()), Some("live"));
    }

    #[tokio::test]
    async fn echo_of_failed_send_is_no_longer_retryable() {
        let backend = MemoryBackend::new();
        let p = pipeline(&backend, "me", 50);
        backend.fail_next_inserts(1);
        let Err(SendError::Backend { temp_id, .. }) = p.send("hello", None).await else {
            panic!("expected backend error");
        };

        // The write reached the server even though the response was lost.
        let row = backend
            .insert_message(&NewMessage {
                conversation_id: "c1".into(),
                sender_id: "me".into(),
                content: Some("hello".into()),
                attachment_url: None,
                attachment_type: None,
                attachment_name: None,
                client_nonce: Some(temp_id.clone()),
            })
            .await
            .unwrap();
        assert!(p.add_message(Message::from_row(&row)));

        assert_eq!(p.len(), 1);
        assert!(!p.contains(&temp_id));
        assert!(p.inner.state.lock().failed.is_empty());
        assert!(matches!(p.retry(&temp_id).await, Err(SendError::NotRetryable(_))));
    }

    #[test]
    fn scroll_intent_follows_sender() {
        let own = ListChange::Appended { id: "a".into(), own: true };
        let inbound = ListChange::Appended { id: "b".into(), own: false };
        assert_eq!(own.scroll_intent(), ScrollIntent::ForceBottom);
        assert_eq!(inbound.scroll_intent(), ScrollIntent::BottomIfPinned);
        assert_eq!(ListChange::Prepended { count: 3 }.scroll_intent(), ScrollIntent::Keep);
    }
}
