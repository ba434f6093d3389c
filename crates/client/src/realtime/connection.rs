//! The single shared change-feed connection: lifecycle, liveness and recovery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bidroom_shared::{ChangeEvent, EventFilter, Table};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::router::{Subscription, TopicRouter};
use crate::backend::{ChangeFeedTransport, FeedSignal};
use crate::config::FeedConfig;

/// Lifecycle of the wire connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Uninitialized,
    Connecting,
    Ready,
    Errored,
}

/// Persistent callback fired on every transition into READY.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies a registered ready listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ConnState {
    status: ConnectionStatus,
    last_event_at: Instant,
    /// Bumped for every wire connection; stale wire tasks compare against it.
    generation: u64,
    wire: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    ready_listeners: Vec<(ListenerId, ReadyCallback)>,
    next_listener_id: u64,
    reconnects: u64,
}

impl ConnState {
    fn abort_tasks(&mut self) {
        for handle in [self.wire.take(), self.reconnect.take(), self.health.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    transport: Arc<dyn ChangeFeedTransport>,
    config: FeedConfig,
    tables: Vec<Table>,
    router: TopicRouter,
    state: Mutex<ConnState>,
    ready: watch::Sender<bool>,
}

/// Handle to the process-wide change-feed connection. Clones share one connection.
#[derive(Clone)]
pub struct FeedConnection {
    inner: Arc<Inner>,
}

impl FeedConnection {
    /// Connection tracking every table.
    pub fn new(transport: Arc<dyn ChangeFeedTransport>, config: FeedConfig) -> Self {
        Self::with_tables(transport, config, Table::ALL.to_vec())
    }

    pub fn with_tables(transport: Arc<dyn ChangeFeedTransport>, config: FeedConfig, tables: Vec<Table>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                tables,
                router: TopicRouter::new(),
                state: Mutex::new(ConnState {
                    status: ConnectionStatus::Uninitialized,
                    last_event_at: Instant::now(),
                    generation: 0,
                    wire: None,
                    reconnect: None,
                    health: None,
                    ready_listeners: Vec::new(),
                    next_listener_id: 0,
                    reconnects: 0,
                }),
                ready,
            }),
        }
    }

    /// Open the wire connection unless one is live, connecting, or about to be reopened.
    pub fn init(&self) {
        self.inner.init();
    }

    /// Tear the wire connection down and reopen it after the reconnect delay.
    /// Subscriptions are kept.
    pub fn force_reconnect(&self) {
        self.inner.schedule_reconnect(None, "forced");
    }

    /// Run the staleness check once against `stale_after`. Returns true if it
    /// forced a reconnect.
    pub fn check_health(&self) -> bool {
        self.inner.check_health(self.inner.config.stale_after)
    }

    /// Host visibility changed. Coming back to the foreground applies the
    /// shorter staleness threshold immediately.
    pub fn handle_visibility_change(&self, visible: bool) -> bool {
        if !visible {
            return false;
        }
        self.inner.check_health(self.inner.config.visibility_stale_after)
    }

    /// Resolves once the connection is READY (immediately if it already is).
    pub async fn wait_for_ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Readiness as a watch channel.
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    /// Register a callback fired on every transition into READY.
    pub fn on_ready<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        state.next_listener_id += 1;
        let id = ListenerId(state.next_listener_id);
        state.ready_listeners.push((id, Arc::new(callback)));
        id
    }

    pub fn remove_ready_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.ready_listeners.len();
        state.ready_listeners.retain(|(lid, _)| *lid != id);
        state.ready_listeners.len() != before
    }

    /// Register a consumer and lazily bring the connection up.
    pub fn subscribe<F>(&self, table: Table, filter: EventFilter, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.inner.router.subscribe(table, filter, callback);
        self.init();
        subscription
    }

    /// Tear down the wire connection if nobody is subscribed. Returns true if it did.
    pub fn cleanup(&self) -> bool {
        if !self.inner.router.is_empty() {
            crate::log_debug!(
                "Keeping change feed up for {} subscription(s)",
                self.inner.router.len()
            );
            return false;
        }
        self.inner.teardown();
        true
    }

    /// Unconditional shutdown: timers, wire, listeners and subscriptions.
    pub fn force_cleanup(&self) {
        self.inner.teardown();
        self.inner.state.lock().ready_listeners.clear();
        self.inner.router.clear();
        crate::log_info!("Change feed shut down");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    /// Reconnects scheduled since construction.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.state.lock().reconnects
    }

    /// Time since the last inbound event or heartbeat.
    pub fn idle_for(&self) -> Duration {
        self.inner.state.lock().last_event_at.elapsed()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.inner.router
    }
}

impl Inner {
    fn init(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match state.status {
            ConnectionStatus::Ready | ConnectionStatus::Connecting => return,
            ConnectionStatus::Uninitialized | ConnectionStatus::Errored => {}
        }
        if state.reconnect.is_some() {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        state.status = ConnectionStatus::Connecting;
        crate::log_debug!("Opening change feed (generation {})", generation);

        let weak = Arc::downgrade(self);
        state.wire = Some(tokio::spawn(run_wire(weak.clone(), generation)));
        if state.health.is_none() {
            let period = self.config.health_check_interval;
            state.health = Some(tokio::spawn(health_loop(weak, period)));
        }
    }

    /// `origin` is the generation of the wire task asking for the reconnect,
    /// or `None` for external callers.
    fn schedule_reconnect(self: &Arc<Self>, origin: Option<u64>, reason: &str) {
        let mut state = self.state.lock();
        if origin.is_some_and(|generation| generation != state.generation) {
            return;
        }
        if state.reconnect.is_some() {
            crate::log_debug!("Reconnect already pending; ignoring ({})", reason);
            return;
        }
        if matches!(state.status, ConnectionStatus::Uninitialized) && origin.is_none() && state.wire.is_none() {
            // Nothing to recover; a plain init will do.
            drop(state);
            self.init();
            return;
        }

        if let Some(wire) = state.wire.take() {
            // A wire task reporting its own failure exits by itself.
            if origin.is_none() {
                wire.abort();
            }
        }
        state.status = ConnectionStatus::Errored;
        state.reconnects += 1;
        self.ready.send_replace(false);

        let delay = self.config.reconnect_delay;
        crate::log_warn!("Change feed reconnecting in {:?} ({})", delay, reason);

        let weak = Arc::downgrade(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.state.lock().reconnect = None;
            inner.init();
        }));
    }

    fn check_health(self: &Arc<Self>, threshold: Duration) -> bool {
        let idle = {
            let state = self.state.lock();
            if state.status != ConnectionStatus::Ready {
                return false;
            }
            state.last_event_at.elapsed()
        };
        if idle > threshold {
            self.schedule_reconnect(None, &format!("no events for {idle:?}"));
            true
        } else {
            false
        }
    }

    fn mark_ready(&self, generation: u64) -> bool {
        let listeners: Vec<ReadyCallback> = {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != ConnectionStatus::Connecting {
                return false;
            }
            state.status = ConnectionStatus::Ready;
            state.last_event_at = Instant::now();
            state.ready_listeners.iter().map(|(_, cb)| cb.clone()).collect()
        };
        self.ready.send_replace(true);
        crate::log_info!("Change feed ready ({} table(s))", self.tables.len());

        for callback in listeners {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                crate::log_error!("Ready listener panicked");
            }
        }
        true
    }

    fn touch(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.last_event_at = Instant::now();
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        state.abort_tasks();
        state.generation += 1;
        state.status = ConnectionStatus::Uninitialized;
        self.ready.send_replace(false);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state.get_mut().abort_tasks();
    }
}

async fn run_wire(weak: Weak<Inner>, generation: u64) {
    let (transport, tables, timeout) = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        (
            inner.transport.clone(),
            inner.tables.clone(),
            inner.config.handshake_timeout,
        )
    };

    let mut stream = match tokio::time::timeout(timeout, transport.open(&tables)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_reconnect(Some(generation), &format!("open failed: {e}"));
            }
            return;
        }
        Err(_) => {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_reconnect(Some(generation), "handshake timed out");
            }
            return;
        }
    };

    match weak.upgrade() {
        Some(inner) if inner.mark_ready(generation) => {}
        _ => return,
    }

    let reason = loop {
        let Some(signal) = stream.next().await else {
            break "feed ended".to_string();
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match signal {
            FeedSignal::Change(raw) => {
                inner.touch(generation);
                inner.router.route(&raw);
            }
            FeedSignal::Heartbeat => inner.touch(generation),
            FeedSignal::Closed(reason) => break reason,
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.schedule_reconnect(Some(generation), &format!("channel closed: {reason}"));
    }
}

async fn health_loop(weak: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.check_health(inner.config.stale_after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataBackend, MemoryBackend};
    use bidroom_shared::NewMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connection(backend: &MemoryBackend) -> FeedConnection {
        FeedConnection::new(Arc::new(backend.clone()), FeedConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn init_is_idempotent_while_ready() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        feed.init();
        feed.wait_for_ready().await;
        feed.init();
        feed.init();
        tokio::task::yield_now().await;
        assert_eq!(backend.open_count(), 1);
        assert!(feed.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_listeners_fire_on_every_connect() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        feed.on_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        feed.init();
        feed.wait_for_ready().await;
        feed.force_reconnect();
        assert!(!feed.is_ready());
        feed.wait_for_ready().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(feed.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_retries_after_delay() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(2);
        let feed = connection(&backend);
        feed.init();
        feed.wait_for_ready().await;
        assert_eq!(backend.open_count(), 3);
        assert_eq!(feed.reconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out() {
        let backend = MemoryBackend::new();
        backend.stall_next_opens(1);
        let feed = connection(&backend);
        feed.init();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(feed.status(), ConnectionStatus::Connecting);
        feed.wait_for_ready().await;
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reconnects_coalesce() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        feed.init();
        feed.wait_for_ready().await;
        feed.force_reconnect();
        feed.force_reconnect();
        backend.disconnect_feeds();
        feed.wait_for_ready().await;
        assert_eq!(backend.open_count(), 2);
        assert_eq!(feed.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_uses_shorter_threshold() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        feed.init();
        feed.wait_for_ready().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!feed.handle_visibility_change(true));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!feed.handle_visibility_change(false));
        assert!(feed.handle_visibility_change(true));
        feed.wait_for_ready().await;
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_only_without_subscribers() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        let sub = feed.subscribe(Table::Messages, EventFilter::Any, |_| Ok(()));
        feed.wait_for_ready().await;

        assert!(!feed.cleanup());
        assert!(feed.is_ready());
        sub.unsubscribe();
        assert!(feed.cleanup());
        assert_eq!(feed.status(), ConnectionStatus::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_connection_alive() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        feed.init();
        feed.wait_for_ready().await;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            backend.heartbeat();
        }
        assert_eq!(backend.open_count(), 1);
        assert_eq!(feed.reconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_subscribers() {
        let backend = MemoryBackend::new();
        let feed = connection(&backend);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = feed.subscribe(Table::Messages, EventFilter::Insert, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        feed.wait_for_ready().await;

        backend
            .insert_message(&NewMessage {
                conversation_id: "c1".into(),
                sender_id: "u1".into(),
                content: Some("hello".into()),
                attachment_url: None,
                attachment_type: None,
                attachment_name: None,
                client_nonce: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
