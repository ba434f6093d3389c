//! Ephemeral per-conversation typing signal.
//!
//! Nothing here touches durable storage: the local user's state goes out over
//! the presence channel and the remote roster lives only in memory.

use std::sync::{Arc, Weak};

use bidroom_shared::{BackendError, PresenceMember, PresenceMessage, TypingEntry};
use futures_channel::mpsc::UnboundedSender;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{typing_topic, AuthSession, PresenceTransport};
use crate::config::TypingConfig;
use crate::stores::{TypingRoster, TypingUser};

#[derive(Default)]
struct LocalTyping {
    typing: bool,
    idle: Option<JoinHandle<()>>,
}

struct TypingInner {
    conversation_id: String,
    member: PresenceMember,
    config: TypingConfig,
    outbound: UnboundedSender<PresenceMessage>,
    local: Mutex<LocalTyping>,
    roster: Mutex<TypingRoster>,
    updates: broadcast::Sender<Vec<TypingUser>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Typing state of one conversation. Clones share the channel.
#[derive(Clone)]
pub struct TypingSignal {
    inner: Arc<TypingInner>,
}

impl TypingSignal {
    /// Join the conversation's presence channel.
    pub async fn join(
        transport: &dyn PresenceTransport,
        session: &AuthSession,
        conversation_id: &str,
        config: TypingConfig,
    ) -> Result<Self, BackendError> {
        let member = session.member();
        let link = transport.join(&typing_topic(conversation_id), &member).await?;

        let (updates, _) = broadcast::channel(32);
        let inner = Arc::new(TypingInner {
            conversation_id: conversation_id.to_string(),
            roster: Mutex::new(TypingRoster::new(member.user_id.clone(), config.remote_expiry)),
            member,
            config,
            outbound: link.outbound,
            local: Mutex::new(LocalTyping::default()),
            updates,
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(read_loop(Arc::downgrade(&inner), link.inbound));
        *inner.reader.lock() = Some(reader);
        crate::log_debug!("Joined typing channel for {}", conversation_id);

        Ok(Self { inner })
    }

    /// The local user pressed a key.
    pub fn handle_typing_start(&self) {
        let mut local = self.inner.local.lock();
        if !local.typing {
            local.typing = true;
            self.inner.send(true);
        }
        if let Some(idle) = local.idle.take() {
            idle.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.idle_timeout;
        local.idle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.idle_expired();
            }
        }));
    }

    /// The local user stopped (sent, cleared the input, left).
    pub fn stop_typing(&self) {
        self.inner.stop_typing();
    }

    pub fn is_typing(&self) -> bool {
        self.inner.local.lock().typing
    }

    /// Remote participants currently typing, in the order they started.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        self.inner.roster.lock().users()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TypingUser>> {
        self.inner.updates.subscribe()
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Stop typing and leave the channel.
    pub fn leave(&self) {
        self.inner.stop_typing();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.outbound.close_channel();
        self.inner.roster.lock().clear();
        crate::log_debug!("Left typing channel for {}", self.inner.conversation_id);
    }
}

impl TypingInner {
    fn send(&self, typing: bool) {
        let entry = TypingEntry {
            user_id: self.member.user_id.clone(),
            name: self.member.name.clone(),
            typing,
        };
        if self.outbound.unbounded_send(PresenceMessage::Typing(entry)).is_err() {
            crate::log_debug!("Typing channel for {} is closed", self.conversation_id);
        }
    }

    fn stop_typing(&self) {
        let mut local = self.local.lock();
        if let Some(idle) = local.idle.take() {
            idle.abort();
        }
        if local.typing {
            local.typing = false;
            self.send(false);
        }
    }

    fn idle_expired(&self) {
        let mut local = self.local.lock();
        // Our own handle; the task is finishing.
        local.idle = None;
        if local.typing {
            local.typing = false;
            self.send(false);
        }
    }

    fn publish(&self) {
        let users = self.roster.lock().users();
        let _ = self.updates.send(users);
    }
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        if let Some(idle) = self.local.get_mut().idle.take() {
            idle.abort();
        }
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn read_loop(weak: Weak<TypingInner>, mut inbound: BoxStream<'static, PresenceMessage>) {
    loop {
        let deadline = match weak.upgrade() {
            Some(inner) => inner.roster.lock().next_deadline(),
            None => return,
        };
        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures_util::future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = inbound.next() => {
                let Some(msg) = msg else {
                    crate::log_debug!("Typing channel closed");
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let changed = match &msg {
                    PresenceMessage::Typing(entry) => inner.roster.lock().apply(entry, Instant::now()),
                    PresenceMessage::Sync { present } => inner.roster.lock().sync(present),
                };
                if changed {
                    inner.publish();
                }
            }
            _ = expiry => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let changed = inner.roster.lock().expire(Instant::now());
                if changed {
                    inner.publish();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, PresenceTransport};
    use futures_util::FutureExt;
    use std::time::Duration;

    async fn joined(backend: &MemoryBackend, user: &str) -> TypingSignal {
        TypingSignal::join(
            backend,
            &AuthSession::new(user, format!("{user} name")),
            "c1",
            TypingConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_stops_typing() {
        let backend = MemoryBackend::new();
        let alice = joined(&backend, "alice").await;
        let bob = joined(&backend, "bob").await;

        alice.handle_typing_start();
        settle().await;
        assert_eq!(bob.typing_users().len(), 1);
        assert_eq!(bob.typing_users()[0].name, "alice name");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        alice.handle_typing_start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(alice.is_typing());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!alice.is_typing());
        assert!(bob.typing_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_typing_is_immediate() {
        let backend = MemoryBackend::new();
        let alice = joined(&backend, "alice").await;
        let bob = joined(&backend, "bob").await;

        alice.handle_typing_start();
        settle().await;
        alice.stop_typing();
        settle().await;
        assert!(bob.typing_users().is_empty());
    }

    /// Typing flags seen so far by a bare channel member.
    fn drain_flags(inbound: &mut BoxStream<'static, PresenceMessage>) -> Vec<bool> {
        let mut flags = Vec::new();
        while let Some(Some(msg)) = inbound.next().now_or_never() {
            if let PresenceMessage::Typing(entry) = msg {
                flags.push(entry.typing);
            }
        }
        flags
    }

    async fn observer(backend: &MemoryBackend) -> crate::backend::PresenceLink {
        let member = PresenceMember {
            user_id: "observer".into(),
            name: "observer".into(),
        };
        backend.join(&typing_topic("c1"), &member).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn idle_expiry_sends_exactly_one_stop() {
        let backend = MemoryBackend::new();
        let mut link = observer(&backend).await;
        let alice = joined(&backend, "alice").await;

        alice.handle_typing_start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        alice.handle_typing_start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!alice.is_typing());
        assert_eq!(drain_flags(&mut link.inbound), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_typing_cancels_idle_timer() {
        let backend = MemoryBackend::new();
        let mut link = observer(&backend).await;
        let alice = joined(&backend, "alice").await;

        alice.handle_typing_start();
        settle().await;
        alice.stop_typing();
        alice.stop_typing();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(drain_flags(&mut link.inbound), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_clears_remote_roster() {
        let backend = MemoryBackend::new();
        let alice = joined(&backend, "alice").await;
        let bob = joined(&backend, "bob").await;
        assert_eq!(backend.presence_members("typing:c1"), 2);

        alice.handle_typing_start();
        settle().await;
        alice.leave();
        settle().await;
        assert!(bob.typing_users().is_empty());
        assert_eq!(backend.presence_members("typing:c1"), 1);
    }
}
