//! Wiring of the realtime components for one signed-in user.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    AuthSession, ChangeFeedTransport, DataBackend, MemoryBackend, PresenceTransport,
};
use crate::config::ClientConfig;
use crate::notifications::{NotificationCenter, NotificationHost, UnreadCounter};
use crate::pipeline::ConversationPipeline;
use crate::reactions::ReactionBook;
use crate::realtime::FeedConnection;
use crate::typing::TypingSignal;

/// Everything an open conversation view needs.
#[derive(Clone)]
pub struct ConversationSession {
    pub messages: ConversationPipeline,
    pub reactions: ReactionBook,
    /// Absent when the presence channel could not be joined.
    pub typing: Option<TypingSignal>,
}

impl ConversationSession {
    fn close(&self) {
        self.messages.close();
        self.reactions.close();
        if let Some(typing) = &self.typing {
            typing.leave();
        }
    }
}

/// Owns the change feed and the process-wide consumers.
pub struct RealtimeClient {
    config: ClientConfig,
    session: AuthSession,
    data: Arc<dyn DataBackend>,
    presence: Arc<dyn PresenceTransport>,
    feed: FeedConnection,
    notifications: NotificationCenter,
    unread: UnreadCounter,
    conversations: Mutex<HashMap<String, ConversationSession>>,
}

impl RealtimeClient {
    pub fn new(
        config: ClientConfig,
        session: AuthSession,
        data: Arc<dyn DataBackend>,
        feed_transport: Arc<dyn ChangeFeedTransport>,
        presence: Arc<dyn PresenceTransport>,
        host: Arc<dyn NotificationHost>,
    ) -> Self {
        let feed = FeedConnection::new(feed_transport, config.feed.clone());
        let notifications = NotificationCenter::new(config.notifications.clone(), host);
        let unread = UnreadCounter::new(session.clone(), data.clone());
        Self {
            config,
            session,
            data,
            presence,
            feed,
            notifications,
            unread,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Client whose every collaborator is one in-process backend.
    pub fn in_memory(
        config: ClientConfig,
        session: AuthSession,
        backend: MemoryBackend,
        host: Arc<dyn NotificationHost>,
    ) -> Self {
        let backend = Arc::new(backend);
        Self::new(config, session, backend.clone(), backend.clone(), backend, host)
    }

    /// Attach the process-wide consumers and bring the feed up.
    pub fn start(&self) {
        self.notifications
            .attach(&self.feed, self.data.clone(), &self.session);
        self.unread.attach(&self.feed);
        self.feed.init();
        crate::log_info!("Realtime client started for {}", self.session.user_id);
    }

    /// Open (or re-focus) a conversation and make it the active one.
    pub async fn open_conversation(&self, conversation_id: &str) -> ConversationSession {
        if let Some(existing) = self.conversation(conversation_id) {
            self.notifications.set_active_conversation(Some(conversation_id));
            return existing;
        }

        let messages = ConversationPipeline::open(
            &self.feed,
            conversation_id,
            self.session.clone(),
            self.data.clone(),
            &self.config.messages,
        )
        .await;

        let reactions =
            ReactionBook::for_pipeline(self.session.clone(), self.data.clone(), messages.clone());
        reactions.attach(&self.feed);
        let ids: Vec<String> = messages.messages().into_iter().map(|m| m.id).collect();
        if let Err(e) = reactions.load(&ids).await {
            crate::log_warn!("Loading reactions for {} failed: {}", conversation_id, e);
        }

        let typing = match TypingSignal::join(
            self.presence.as_ref(),
            &self.session,
            conversation_id,
            self.config.typing.clone(),
        )
        .await
        {
            Ok(typing) => Some(typing),
            Err(e) => {
                crate::log_warn!("Typing channel for {} unavailable: {}", conversation_id, e);
                None
            }
        };

        if let Err(e) = messages.mark_read().await {
            crate::log_warn!("Marking {} read failed: {}", conversation_id, e);
        }

        let session = ConversationSession {
            messages,
            reactions,
            typing,
        };

        let raced = {
            let mut open = self.conversations.lock();
            match open.get(conversation_id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    open.insert(conversation_id.to_string(), session.clone());
                    None
                }
            }
        };
        self.notifications.set_active_conversation(Some(conversation_id));

        match raced {
            // Someone else opened it while we were loading; keep theirs.
            Some(existing) => {
                session.close();
                existing
            }
            None => session,
        }
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationSession> {
        self.conversations.lock().get(conversation_id).cloned()
    }

    /// Tear a conversation down. Returns false if it was not open.
    pub fn close_conversation(&self, conversation_id: &str) -> bool {
        let Some(session) = self.conversations.lock().remove(conversation_id) else {
            return false;
        };
        session.close();
        if self.notifications.active_conversation().as_deref() == Some(conversation_id) {
            self.notifications.set_active_conversation(None);
        }
        self.feed.cleanup();
        true
    }

    pub fn handle_visibility_change(&self, visible: bool) -> bool {
        self.feed.handle_visibility_change(visible)
    }

    pub fn set_window_focused(&self, focused: bool) {
        self.notifications.set_window_focused(focused);
    }

    pub fn record_interaction(&self) {
        self.notifications.record_interaction();
    }

    /// Close everything and stop the feed for good.
    pub fn shutdown(&self) {
        let open: Vec<ConversationSession> = self
            .conversations
            .lock()
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in open {
            session.close();
        }
        self.notifications.detach();
        self.unread.detach();
        self.feed.force_cleanup();
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn feed(&self) -> &FeedConnection {
        &self.feed
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }
}
