//! Fan-out of decoded change events to per-(table, event) callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bidroom_shared::{ChangeEvent, EventFilter, RawChange, Table};
use parking_lot::Mutex;

/// Consumer callback. An `Err` is logged and does not affect other consumers.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: u64,
    table: Table,
    filter: EventFilter,
    callback: ChangeCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Registration>,
}

/// Registered consumers, kept in registration order.
#[derive(Clone, Default)]
pub struct TopicRouter {
    registry: Arc<Mutex<Registry>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, table: Table, filter: EventFilter, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Registration {
            id,
            table,
            filter,
            callback: Arc::new(callback),
            active: active.clone(),
        });
        crate::log_debug!("Subscribed #{} to {} ({:?})", id, table, filter);

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            active,
        }
    }

    /// Decode a wire payload and dispatch it. Undecodable payloads are logged and dropped.
    pub fn route(&self, raw: &RawChange) -> usize {
        match raw.decode() {
            Ok(event) => self.dispatch(&event),
            Err(e) => {
                crate::log_warn!("Dropping undecodable change on `{}`: {}", raw.table, e);
                0
            }
        }
    }

    /// Invoke every matching callback in registration order. Returns how many ran.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let matching: Vec<(u64, ChangeCallback, Arc<AtomicBool>)> = self
            .registry
            .lock()
            .entries
            .iter()
            .filter(|r| r.table == event.table && r.filter.matches(event.kind))
            .map(|r| (r.id, r.callback.clone(), r.active.clone()))
            .collect();

        let mut invoked = 0;
        for (id, callback, active) in matching {
            // Unsubscribed earlier in this same dispatch.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    crate::log_warn!("Subscriber #{} failed on {} {:?}: {:#}", id, event.table, event.kind, e)
                }
                Err(_) => {
                    crate::log_error!("Subscriber #{} panicked on {} {:?}", id, event.table, event.kind)
                }
            }
        }
        invoked
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.registry.lock().entries);
        for entry in entries {
            entry.active.store(false, Ordering::Release);
        }
    }
}

/// Handle to one registration.
///
/// Dropping the handle keeps the registration alive; call [`Subscription::unsubscribe`].
#[must_use = "keep the handle to be able to unsubscribe"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove exactly this registration. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.retain(|r| r.id != self.id);
        }
        if was_active {
            crate::log_debug!("Unsubscribed #{}", self.id);
        }
        was_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidroom_shared::{EventKind, MessageRow, Row};
    use chrono::Utc;

    fn message_event(kind: EventKind) -> ChangeEvent {
        let row = MessageRow {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: Some("hi".into()),
            created_at: Utc::now(),
            sequence: None,
            read_at: None,
            attachment_url: None,
            attachment_type: None,
            attachment_name: None,
            client_nonce: None,
        };
        ChangeEvent {
            table: Table::Messages,
            kind,
            old: None,
            new: Some(Row::Message(row)),
            old_id: None,
            commit_timestamp: None,
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn(&ChangeEvent) -> anyhow::Result<()> {
        let log = log.clone();
        move |_| {
            log.lock().push(name);
            Ok(())
        }
    }

    #[test]
    fn filters_by_table_and_kind_in_registration_order() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = router.subscribe(Table::Messages, EventFilter::Any, recorder(&log, "any"));
        let _b = router.subscribe(Table::Messages, EventFilter::Update, recorder(&log, "update"));
        let _c = router.subscribe(Table::Messages, EventFilter::Insert, recorder(&log, "insert"));
        let _d = router.subscribe(Table::MessageReactions, EventFilter::Any, recorder(&log, "reactions"));

        assert_eq!(router.dispatch(&message_event(EventKind::Insert)), 2);
        assert_eq!(*log.lock(), vec!["any", "insert"]);
    }

    #[test]
    fn failing_callbacks_do_not_block_others() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = router.subscribe(Table::Messages, EventFilter::Any, |_| anyhow::bail!("boom"));
        let _b = router.subscribe(Table::Messages, EventFilter::Any, |_| panic!("kaboom"));
        let _c = router.subscribe(Table::Messages, EventFilter::Any, recorder(&log, "survivor"));

        assert_eq!(router.dispatch(&message_event(EventKind::Insert)), 3);
        assert_eq!(*log.lock(), vec!["survivor"]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = router.subscribe(Table::Messages, EventFilter::Any, recorder(&log, "a"));
        let _b = router.subscribe(Table::Messages, EventFilter::Any, recorder(&log, "b"));

        assert!(a.unsubscribe());
        assert!(!a.unsubscribe());
        router.dispatch(&message_event(EventKind::Insert));
        assert_eq!(*log.lock(), vec!["b"]);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn unsubscribed_during_dispatch_is_skipped() {
        let router = TopicRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let victim_for_first = victim.clone();
        let _first = router.subscribe(Table::Messages, EventFilter::Any, move |_| {
            if let Some(sub) = victim_for_first.lock().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *victim.lock() = Some(router.subscribe(Table::Messages, EventFilter::Any, recorder(&log, "victim")));

        assert_eq!(router.dispatch(&message_event(EventKind::Insert)), 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn undecodable_payload_is_dropped() {
        let router = TopicRouter::new();
        let _a = router.subscribe(Table::Messages, EventFilter::Any, |_| Ok(()));
        let raw = RawChange {
            schema: None,
            table: "offers".into(),
            event_type: "INSERT".into(),
            record: None,
            old_record: None,
            commit_timestamp: None,
        };
        assert_eq!(router.route(&raw), 0);
    }
}
