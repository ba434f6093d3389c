//! Emoji reactions of one open conversation.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use bidroom_shared::{
    BackendError, ChangeEvent, EventFilter, EventKind, NewReaction, ReactionRow, Table,
};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{AuthSession, DataBackend};
use crate::pipeline::ConversationPipeline;
use crate::realtime::{FeedConnection, Subscription};
use crate::stores::{is_temp_id, new_temp_id};

/// One emoji on one message, as a view renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    Added,
    Removed,
}

#[derive(Default)]
struct ReactionState {
    /// Rows in first-seen order.
    rows: Vec<ReactionRow>,
    tracked: HashSet<String>,
}

impl ReactionState {
    fn own_position(&self, message_id: &str, user_id: &str, emoji: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.message_id == message_id && r.user_id == user_id && r.emoji == emoji)
    }

    fn upsert(&mut self, row: ReactionRow) -> bool {
        if self.rows.iter().any(|r| r.id == row.id) {
            return false;
        }
        // Our own echo takes over the optimistic row.
        if let Some(pos) = self
            .rows
            .iter()
            .position(|r| is_temp_id(&r.id) && r.message_id == row.message_id && r.user_id == row.user_id && r.emoji == row.emoji)
        {
            self.rows[pos] = row;
            return true;
        }
        self.rows.push(row);
        true
    }

    fn remove_id(&mut self, id: &str) -> Option<ReactionRow> {
        let pos = self.rows.iter().position(|r| r.id == id)?;
        Some(self.rows.remove(pos))
    }
}

struct ReactionInner {
    session: AuthSession,
    backend: Arc<dyn DataBackend>,
    pipeline: Option<ConversationPipeline>,
    state: Mutex<ReactionState>,
    updates: broadcast::Sender<String>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Reactions keyed by message. Clones share state.
#[derive(Clone)]
pub struct ReactionBook {
    inner: Arc<ReactionInner>,
}

impl ReactionBook {
    pub fn new(session: AuthSession, backend: Arc<dyn DataBackend>) -> Self {
        Self::build(session, backend, None)
    }

    /// Book scoped to the messages of `pipeline`, including ones that arrive later.
    pub fn for_pipeline(session: AuthSession, backend: Arc<dyn DataBackend>, pipeline: ConversationPipeline) -> Self {
        Self::build(session, backend, Some(pipeline))
    }

    fn build(session: AuthSession, backend: Arc<dyn DataBackend>, pipeline: Option<ConversationPipeline>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ReactionInner {
                session,
                backend,
                pipeline,
                state: Mutex::new(ReactionState::default()),
                updates,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fetch reactions for `message_ids` and start tracking those messages.
    pub async fn load(&self, message_ids: &[String]) -> Result<usize, BackendError> {
        let rows = self.inner.backend.fetch_reactions(message_ids).await?;
        let count = rows.len();
        {
            let mut state = self.inner.state.lock();
            state.tracked.extend(message_ids.iter().cloned());
            for row in rows {
                state.upsert(row);
            }
        }
        for id in message_ids {
            let _ = self.inner.updates.send(id.clone());
        }
        Ok(count)
    }

    pub fn attach(&self, feed: &FeedConnection) {
        let weak: Weak<ReactionInner> = Arc::downgrade(&self.inner);
        let subscription = feed.subscribe(Table::MessageReactions, EventFilter::Any, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_change(event);
            }
            Ok(())
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    /// Add the viewer's `emoji` to a message, or remove it if already there.
    ///
    /// Applied locally first; rolled back if the write fails.
    pub async fn toggle(&self, message_id: &str, emoji: &str) -> Result<Toggled, BackendError> {
        let inner = &self.inner;
        let user_id = inner.session.user_id.clone();

        let existing = {
            let mut state = inner.state.lock();
            state.tracked.insert(message_id.to_string());
            match state.own_position(message_id, &user_id, emoji) {
                Some(pos) if is_temp_id(&state.rows[pos].id) => {
                    return Err(BackendError::Rejected("reaction is still being saved".to_string()));
                }
                Some(pos) => Some((pos, state.rows.remove(pos))),
                None => {
                    state.rows.push(ReactionRow {
                        id: new_temp_id(),
                        message_id: message_id.to_string(),
                        user_id: user_id.clone(),
                        emoji: emoji.to_string(),
                        created_at: Utc::now(),
                    });
                    None
                }
            }
        };
        inner.notify(message_id);

        match existing {
            Some((pos, row)) => match inner.backend.remove_reaction(&row.id).await {
                Ok(()) => Ok(Toggled::Removed),
                Err(e) => {
                    crate::log_warn!("Removing reaction {} failed: {}", row.id, e);
                    {
                        let mut state = inner.state.lock();
                        if !state.rows.iter().any(|r| r.id == row.id) {
                            let pos = pos.min(state.rows.len());
                            state.rows.insert(pos, row);
                        }
                    }
                    inner.notify(message_id);
                    Err(e)
                }
            },
            None => {
                let request = NewReaction {
                    message_id: message_id.to_string(),
                    user_id: user_id.clone(),
                    emoji: emoji.to_string(),
                };
                match inner.backend.add_reaction(&request).await {
                    Ok(row) => {
                        inner.state.lock().upsert(row);
                        inner.notify(message_id);
                        Ok(Toggled::Added)
                    }
                    Err(e) => {
                        crate::log_warn!("Adding reaction on {} failed: {}", message_id, e);
                        {
                            let mut state = inner.state.lock();
                            state.rows.retain(|r| {
                                !(is_temp_id(&r.id)
                                    && r.message_id == message_id
                                    && r.user_id == user_id
                                    && r.emoji == emoji)
                            });
                        }
                        inner.notify(message_id);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Reactions on a message grouped by emoji, in first-seen order.
    pub fn summaries(&self, message_id: &str) -> Vec<ReactionSummary> {
        let state = self.inner.state.lock();
        let mut out: Vec<ReactionSummary> = Vec::new();
        for row in state.rows.iter().filter(|r| r.message_id == message_id) {
            let mine = row.user_id == self.inner.session.user_id;
            match out.iter_mut().find(|s| s.emoji == row.emoji) {
                Some(summary) => {
                    summary.count += 1;
                    summary.reacted_by_me |= mine;
                }
                None => out.push(ReactionSummary {
                    emoji: row.emoji.clone(),
                    count: 1,
                    reacted_by_me: mine,
                }),
            }
        }
        out
    }

    /// Ids of messages whose reactions changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.updates.subscribe()
    }

    pub fn close(&self) {
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }
}

impl ReactionInner {
    fn notify(&self, message_id: &str) {
        let _ = self.updates.send(message_id.to_string());
    }

    fn in_scope(&self, message_id: &str) -> bool {
        self.state.lock().tracked.contains(message_id)
            || self
                .pipeline
                .as_ref()
                .is_some_and(|pipeline| pipeline.contains(message_id))
    }

    fn apply_change(&self, event: &ChangeEvent) {
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                let Some(row) = event.new_reaction() else {
                    return;
                };
                if !self.in_scope(&row.message_id) {
                    return;
                }
                let message_id = row.message_id.clone();
                if self.state.lock().upsert(row.clone()) {
                    self.notify(&message_id);
                }
            }
            EventKind::Delete => {
                let Some(id) = event.row_id() else {
                    return;
                };
                let removed = self.state.lock().remove_id(id);
                if let Some(row) = removed {
                    self.notify(&row.message_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn book(backend: &MemoryBackend, user: &str) -> ReactionBook {
        ReactionBook::new(AuthSession::new(user, user), Arc::new(backend.clone()))
    }

    #[tokio::test]
    async fn toggle_adds_then_removes() {
        let backend = MemoryBackend::new();
        let reactions = book(&backend, "me");

        assert_eq!(reactions.toggle("m1", "👍").await.unwrap(), Toggled::Added);
        assert_eq!(
            reactions.summaries("m1"),
            vec![ReactionSummary {
                emoji: "👍".into(),
                count: 1,
                reacted_by_me: true
            }]
        );
        assert_eq!(backend.reactions().len(), 1);

        assert_eq!(reactions.toggle("m1", "👍").await.unwrap(), Toggled::Removed);
        assert!(reactions.summaries("m1").is_empty());
        assert!(backend.reactions().is_empty());
    }

    #[tokio::test]
    async fn failed_add_rolls_back() {
        let backend = MemoryBackend::new();
        let reactions = book(&backend, "me");
        backend.fail_next_reactions(1);
        assert!(reactions.toggle("m1", "🔥").await.is_err());
        assert!(reactions.summaries("m1").is_empty());
    }

    #[tokio::test]
    async fn failed_remove_restores_row() {
        let backend = MemoryBackend::new();
        let reactions = book(&backend, "me");
        reactions.toggle("m1", "🔥").await.unwrap();
        backend.fail_next_reactions(1);
        assert!(reactions.toggle("m1", "🔥").await.is_err());
        assert_eq!(reactions.summaries("m1")[0].count, 1);
    }

    #[tokio::test]
    async fn summaries_group_in_first_seen_order() {
        let backend = MemoryBackend::new();
        for (user, emoji) in [("a", "❤️"), ("b", "👍"), ("me", "❤️")] {
            backend
                .add_reaction(&NewReaction {
                    message_id: "m1".into(),
                    user_id: user.into(),
                    emoji: emoji.into(),
                })
                .await
                .unwrap();
        }
        let reactions = book(&backend, "me");
        assert_eq!(reactions.load(&["m1".to_string()]).await.unwrap(), 3);
        let summaries = reactions.summaries("m1");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].emoji, "❤️");
        assert_eq!(summaries[0].count, 2);
        assert!(summaries[0].reacted_by_me);
        assert!(!summaries[1].reacted_by_me);
    }

    #[tokio::test(start_paused = true)]
    async fn feed_events_apply_idempotently() {
        let backend = MemoryBackend::new();
        let feed = FeedConnection::new(Arc::new(backend.clone()), Default::default());
        let reactions = book(&backend, "me");
        reactions.load(&["m1".to_string()]).await.unwrap();
        reactions.attach(&feed);
        feed.wait_for_ready().await;

        // Own toggle: the insert response and the echo must collapse into one row.
        reactions.toggle("m1", "👍").await.unwrap();
        let other = backend
            .add_reaction(&NewReaction {
                message_id: "m1".into(),
                user_id: "other".into(),
                emoji: "👍".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(reactions.summaries("m1")[0].count, 2);

        backend.remove_reaction(&other.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(reactions.summaries("m1")[0].count, 1);
    }
}
