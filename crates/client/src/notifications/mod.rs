//! In-app notification dispatch: toasts, title badge, alert tone and native
//! notifications, with suppression for the active conversation and repeats.

mod badge;
mod host;
mod unread;

pub use badge::{DedupSet, TitleBadge};
pub use host::{HeadlessHost, NativeNotification, NativePermission, NotificationHost};
pub use unread::UnreadCounter;

use std::collections::HashMap;
use std::sync::Arc;

use bidroom_shared::{EventFilter, MessageRow, NotificationPayload, Profile, Table};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::audio::AlertTone;
use crate::backend::{AuthSession, DataBackend};
use crate::config::NotificationConfig;
use crate::realtime::{FeedConnection, Subscription};

/// Preview text used when a message has no text.
pub const ATTACHMENT_PREVIEW: &str = "Sent an attachment";

/// Deep link to a conversation.
pub fn conversation_link(conversation_id: &str) -> String {
    format!("/messages/{conversation_id}")
}

/// Cut `text` to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

fn message_text(row: &MessageRow) -> &str {
    match row.content.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ if row.attachment_url.is_some() => ATTACHMENT_PREVIEW,
        _ => "",
    }
}

struct CenterState {
    active_conversation: Option<String>,
    dedup: DedupSet,
    badge: TitleBadge,
    interacted: bool,
    focused: bool,
}

struct CenterInner {
    config: NotificationConfig,
    host: Arc<dyn NotificationHost>,
    tone: AlertTone,
    state: Mutex<CenterState>,
    toasts: broadcast::Sender<NotificationPayload>,
    navigation: broadcast::Sender<String>,
    profiles: Mutex<HashMap<String, Profile>>,
    subscriptions: Mutex<Vec<Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide notification dispatcher. Clones share state.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl NotificationCenter {
    pub fn new(config: NotificationConfig, host: Arc<dyn NotificationHost>) -> Self {
        let (toasts, _) = broadcast::channel(64);
        let (navigation, _) = broadcast::channel(16);
        let state = CenterState {
            active_conversation: None,
            dedup: DedupSet::new(config.dedup_capacity),
            badge: TitleBadge::new(config.base_title.clone()),
            interacted: false,
            focused: true,
        };
        host.set_title(&config.base_title);
        Self {
            inner: Arc::new(CenterInner {
                config,
                host,
                tone: AlertTone::default(),
                state: Mutex::new(state),
                toasts,
                navigation,
                profiles: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Set (or clear) the conversation on screen. Opening one clears the badge.
    pub fn set_active_conversation(&self, conversation_id: Option<&str>) {
        let title = {
            let mut state = self.inner.state.lock();
            state.active_conversation = conversation_id.map(str::to_string);
            if conversation_id.is_none() {
                return;
            }
            state.badge.reset();
            state.badge.title()
        };
        self.inner.host.set_title(&title);
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.inner.state.lock().active_conversation.clone()
    }

    pub fn set_window_focused(&self, focused: bool) {
        self.inner.state.lock().focused = focused;
    }

    /// The user has interacted with the page; the alert tone may play from now on.
    pub fn record_interaction(&self) {
        self.inner.state.lock().interacted = true;
    }

    /// Deliver a notification. Returns false if it was suppressed.
    pub fn notify(&self, payload: NotificationPayload) -> bool {
        let body = payload.message.clone();
        self.inner.deliver(payload, &body)
    }

    /// A native notification was clicked: focus the window and ask for navigation.
    pub fn handle_native_click(&self, conversation_id: &str) {
        if let Err(e) = self.inner.host.focus_window() {
            crate::log_debug!("Focusing window failed: {}", e);
        }
        self.set_window_focused(true);
        let _ = self.inner.navigation.send(conversation_id.to_string());
    }

    pub fn clear_badge(&self) {
        let title = {
            let mut state = self.inner.state.lock();
            state.badge.reset();
            state.badge.title()
        };
        self.inner.host.set_title(&title);
    }

    pub fn unread_badge(&self) -> u32 {
        self.inner.state.lock().badge.unread()
    }

    pub fn subscribe_toasts(&self) -> broadcast::Receiver<NotificationPayload> {
        self.inner.toasts.subscribe()
    }

    /// Conversation ids the user asked to navigate to.
    pub fn subscribe_navigation(&self) -> broadcast::Receiver<String> {
        self.inner.navigation.subscribe()
    }

    /// Notify for every inbound message on the change feed.
    pub fn attach(&self, feed: &FeedConnection, backend: Arc<dyn DataBackend>, session: &AuthSession) {
        let (tx, mut rx) = unbounded::<MessageRow>();

        // One worker keeps notifications in arrival order while profiles resolve.
        let inner = self.inner.clone();
        let worker = tokio::spawn(async move {
            while let Some(row) = rx.next().await {
                let profile = inner.profile(backend.as_ref(), &row.sender_id).await;
                let payload = NotificationPayload {
                    id: row.id.clone(),
                    sender_name: profile
                        .as_ref()
                        .map_or("Someone", Profile::display_name)
                        .to_string(),
                    sender_avatar: profile.and_then(|p| p.avatar_url),
                    message: truncate_preview(message_text(&row), inner.config.preview_chars),
                    conversation_id: row.conversation_id.clone(),
                };
                inner.deliver(payload, message_text(&row));
            }
        });
        if let Some(previous) = self.inner.worker.lock().replace(worker) {
            previous.abort();
        }

        let viewer = session.user_id.clone();
        let queue: UnboundedSender<MessageRow> = tx;
        let subscription = feed.subscribe(Table::Messages, EventFilter::Insert, move |event| {
            let Some(row) = event.new_message() else {
                return Ok(());
            };
            if row.sender_id == viewer {
                return Ok(());
            }
            queue
                .unbounded_send(row.clone())
                .map_err(|_| anyhow::anyhow!("notification worker stopped"))
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    pub fn detach(&self) {
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }
    }
}

impl CenterInner {
    async fn profile(&self, backend: &dyn DataBackend, user_id: &str) -> Option<Profile> {
        if let Some(profile) = self.profiles.lock().get(user_id) {
            return Some(profile.clone());
        }
        match backend.fetch_profile(user_id).await {
            Ok(profile) => {
                self.profiles.lock().insert(user_id.to_string(), profile.clone());
                Some(profile)
            }
            Err(e) => {
                crate::log_debug!("No profile for {}: {}", user_id, e);
                None
            }
        }
    }

    fn deliver(&self, payload: NotificationPayload, full_text: &str) -> bool {
        let (title, interacted, focused) = {
            let mut state = self.state.lock();
            if state.active_conversation.as_deref() == Some(payload.conversation_id.as_str()) {
                return false;
            }
            if !state.dedup.insert(&payload.id) {
                return false;
            }
            state.badge.increment();
            (state.badge.title(), state.interacted, state.focused)
        };

        self.host.set_title(&title);
        if interacted {
            if let Err(e) = self.host.play_tone(&self.tone) {
                crate::log_debug!("Alert tone unavailable: {}", e);
            }
        }

        if !focused {
            match self.host.native_permission() {
                NativePermission::Granted => {
                    let native = NativeNotification {
                        title: payload.sender_name.clone(),
                        body: truncate_preview(full_text, self.config.native_body_chars),
                        icon: payload.sender_avatar.clone(),
                        link: conversation_link(&payload.conversation_id),
                        conversation_id: payload.conversation_id.clone(),
                        tag: payload.id.clone(),
                    };
                    if let Err(e) = self.host.show_native(&native) {
                        crate::log_debug!("Native notification failed: {}", e);
                    }
                }
                other => crate::log_debug!("Skipping native notification ({:?})", other),
            }
        }

        crate::log_debug!("Notified {} from {}", payload.id, payload.sender_name);
        let _ = self.toasts.send(payload);
        true
    }
}
