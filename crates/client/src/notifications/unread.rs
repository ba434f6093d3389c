//! Total unread inbound messages for the viewer.

use std::sync::{Arc, Weak};

use bidroom_shared::{BackendError, EventFilter, Table};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::backend::{AuthSession, DataBackend};
use crate::realtime::{FeedConnection, ListenerId, Subscription};

struct UnreadInner {
    session: AuthSession,
    backend: Arc<dyn DataBackend>,
    value: watch::Sender<u64>,
    subscriptions: Mutex<Vec<Subscription>>,
    listener: Mutex<Option<(FeedConnection, ListenerId)>>,
}

/// Live unread count. Clones share state.
#[derive(Clone)]
pub struct UnreadCounter {
    inner: Arc<UnreadInner>,
}

impl UnreadCounter {
    pub fn new(session: AuthSession, backend: Arc<dyn DataBackend>) -> Self {
        let (value, _) = watch::channel(0);
        Self {
            inner: Arc::new(UnreadInner {
                session,
                backend,
                value,
                subscriptions: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Refresh on every READY transition and track message changes in between.
    pub fn attach(&self, feed: &FeedConnection) {
        let weak = Arc::downgrade(&self.inner);
        let listener = feed.on_ready(move || {
            let weak: Weak<UnreadInner> = weak.clone();
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    if let Err(e) = inner.refresh().await {
                        crate::log_warn!("Unread count refresh failed: {}", e);
                    }
                }
            });
        });
        *self.inner.listener.lock() = Some((feed.clone(), listener));

        let weak = Arc::downgrade(&self.inner);
        let inserts = feed.subscribe(Table::Messages, EventFilter::Insert, move |event| {
            let (Some(inner), Some(row)) = (weak.upgrade(), event.new_message()) else {
                return Ok(());
            };
            if row.sender_id != inner.session.user_id && row.read_at.is_none() {
                inner.value.send_modify(|v| *v += 1);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.inner);
        let updates = feed.subscribe(Table::Messages, EventFilter::Update, move |event| {
            let (Some(inner), Some(new)) = (weak.upgrade(), event.new_message()) else {
                return Ok(());
            };
            let became_read = event
                .old_message()
                .is_some_and(|old| old.read_at.is_none() && new.read_at.is_some());
            if became_read && new.sender_id != inner.session.user_id {
                inner.value.send_modify(|v| *v = v.saturating_sub(1));
            }
            Ok(())
        });

        self.inner.subscriptions.lock().extend([inserts, updates]);
        if feed.is_ready() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.refresh().await {
                    crate::log_warn!("Unread count refresh failed: {}", e);
                }
            });
        }
    }

    /// Re-read the authoritative count.
    pub async fn refresh(&self) -> Result<u64, BackendError> {
        self.inner.refresh().await
    }

    pub fn get(&self) -> u64 {
        *self.inner.value.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.value.subscribe()
    }

    pub fn detach(&self) {
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some((feed, listener)) = self.inner.listener.lock().take() {
            feed.remove_ready_listener(listener);
        }
    }
}

impl UnreadInner {
    async fn refresh(&self) -> Result<u64, BackendError> {
        let count = self.backend.count_unread(&self.session.user_id).await?;
        self.value.send_replace(count);
        crate::log_debug!("Unread count is {}", count);
        Ok(count)
    }
}
