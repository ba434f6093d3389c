//! End-to-end flows through `RealtimeClient` on the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use bidroom_client::backend::DataBackend;
use bidroom_client::stores::is_temp_id;
use bidroom_client::{
    AuthSession, ClientConfig, HeadlessHost, ListChange, MemoryBackend, MessageStatus,
    RealtimeClient, SendError,
};
use bidroom_shared::NewMessage;

fn inbound(conversation: &str, text: &str) -> NewMessage {
    NewMessage {
        conversation_id: conversation.into(),
        sender_id: "seller".into(),
        content: Some(text.into()),
        attachment_url: None,
        attachment_type: None,
        attachment_name: None,
        client_nonce: None,
    }
}

fn backend() -> MemoryBackend {
    MemoryBackend::new()
        .with_profile("me", "Buyer Me")
        .with_profile("seller", "Sam Seller")
        .with_conversation("c1", &["me", "seller"])
        .with_conversation("c2", &["me", "seller"])
}

fn client(backend: &MemoryBackend) -> (RealtimeClient, Arc<HeadlessHost>) {
    let host = Arc::new(HeadlessHost::default());
    let client = RealtimeClient::in_memory(
        ClientConfig::default(),
        AuthSession::new("me", "Buyer Me"),
        backend.clone(),
        host.clone(),
    );
    client.start();
    (client, host)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn paging_stops_after_short_page() {
    let backend = backend();
    for i in 0..112 {
        backend.insert_message(&inbound("c1", &format!("bid {i}"))).await.unwrap();
    }
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;

    let session = client.open_conversation("c1").await;
    let messages = &session.messages;
    assert_eq!(messages.len(), 50);
    assert!(messages.has_more());

    assert_eq!(messages.load_more().await.unwrap(), 50);
    assert!(messages.has_more());

    assert_eq!(messages.load_more().await.unwrap(), 12);
    assert!(!messages.has_more());
    assert_eq!(messages.len(), 112);

    // Exhausted: no further request is made.
    assert_eq!(messages.load_more().await.unwrap(), 0);

    let list = messages.messages();
    assert_eq!(list.first().and_then(|m| m.content.as_deref()), Some("bid 0"));
    assert_eq!(list.last().and_then(|m| m.content.as_deref()), Some("bid 111"));
    assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

/// Open `c1` while a message lands on the feed mid-fetch.
async fn open_during_live_insert(seeded: usize) {
    let backend = backend();
    for i in 0..seeded {
        backend.insert_message(&inbound("c1", &format!("bid {i}"))).await.unwrap();
    }
    backend.set_fetch_latency(Duration::from_millis(100));
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;

    let live = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.insert_message(&inbound("c1", "live")).await.unwrap()
    };
    let (session, live) = tokio::join!(client.open_conversation("c1"), live);
    settle().await;

    let list = session.messages.messages();
    assert_eq!(list.len(), seeded + 1);
    assert_eq!(list.len(), backend.messages("c1").len());
    assert_eq!(list.last().map(|m| m.id.as_str()), Some(live.id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn message_during_open_of_empty_conversation_is_kept() {
    open_during_live_insert(0).await;
}

#[tokio::test(start_paused = true)]
async fn message_during_open_of_busy_conversation_is_kept() {
    open_during_live_insert(2).await;
}

#[tokio::test(start_paused = true)]
async fn online_send_shows_one_bubble() {
    let backend = backend();
    backend.set_write_latency(Duration::from_millis(200));
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;
    let session = client.open_conversation("c1").await;
    let mut updates = session.messages.subscribe();

    let pipeline = session.messages.clone();
    let send = tokio::spawn(async move { pipeline.send("hello", None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pending = session.messages.messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MessageStatus::Sending);
    assert!(is_temp_id(&pending[0].id));
    let first = updates.recv().await.unwrap();
    assert!(matches!(first.change, ListChange::Appended { own: true, .. }));

    let sent = send.await.unwrap().unwrap();
    assert!(!is_temp_id(&sent.id));
    settle().await;

    let list = session.messages.messages();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, sent.id);
    assert_eq!(list[0].content.as_deref(), Some("hello"));
    assert!(matches!(
        list[0].status,
        MessageStatus::Sent | MessageStatus::Delivered
    ));
    assert_eq!(backend.messages("c1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_send_retries_as_new_attempt() {
    let backend = backend();
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;
    let session = client.open_conversation("c1").await;

    backend.fail_next_inserts(1);
    let err = session.messages.send("hello", None).await.unwrap_err();
    let temp_id = match err {
        SendError::Backend { temp_id, .. } => temp_id,
        other => panic!("expected a backend failure, got {other:?}"),
    };
    let list = session.messages.messages();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, temp_id);
    assert_eq!(list[0].status, MessageStatus::Failed);

    let sent = session.messages.retry(&temp_id).await.unwrap();
    settle().await;

    assert_ne!(sent.id, temp_id);
    assert_ne!(sent.client_nonce.as_deref(), Some(temp_id.as_str()));
    assert!(!session.messages.contains(&temp_id));
    let list = session.messages.messages();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].content.as_deref(), Some("hello"));
    assert_eq!(backend.messages("c1").len(), 1);

    // The failed attempt is gone; it cannot be retried twice.
    assert!(matches!(
        session.messages.retry(&temp_id).await,
        Err(SendError::NotRetryable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn only_the_inactive_tab_notifies() {
    let backend = backend();
    let (tab_a, host_a) = client(&backend);
    let (tab_b, host_b) = client(&backend);
    tab_a.feed().wait_for_ready().await;
    tab_b.feed().wait_for_ready().await;
    tab_a.open_conversation("c1").await;
    tab_b.open_conversation("c2").await;

    let mut toasts_a = tab_a.notifications().subscribe_toasts();
    let mut toasts_b = tab_b.notifications().subscribe_toasts();

    backend.insert_message(&inbound("c1", "Final offer")).await.unwrap();
    settle().await;

    assert!(toasts_a.try_recv().is_err());
    assert_eq!(tab_a.notifications().unread_badge(), 0);
    assert_eq!(host_a.title(), "Bidroom");

    let toast = toasts_b.try_recv().unwrap();
    assert_eq!(toast.conversation_id, "c1");
    assert_eq!(toast.sender_name, "Sam Seller");
    assert_eq!(toast.message, "Final offer");
    assert_eq!(tab_b.notifications().unread_badge(), 1);
    assert_eq!(host_b.title(), "(1) Bidroom");

    // Tab A still received the message itself.
    let c1 = tab_a.conversation("c1").unwrap();
    assert_eq!(c1.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_feed_reconnects_once_and_keeps_subscriptions() {
    let backend = backend();
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;
    let session = client.open_conversation("c1").await;
    assert_eq!(backend.open_count(), 1);

    // Health checks run every 15s; the first one past 60s of silence is at 75s.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(client.feed().reconnect_count(), 0);
    tokio::time::sleep(Duration::from_secs(19)).await;

    assert_eq!(client.feed().reconnect_count(), 1);
    assert_eq!(backend.open_count(), 2);
    assert!(client.feed().is_ready());

    backend.insert_message(&inbound("c1", "Still there?")).await.unwrap();
    settle().await;
    assert_eq!(session.messages.len(), 1);
    assert_eq!(client.unread().get(), 1);
}

#[tokio::test(start_paused = true)]
async fn closing_the_last_conversation_keeps_global_consumers() {
    let backend = backend();
    let (client, _host) = client(&backend);
    client.feed().wait_for_ready().await;
    client.open_conversation("c1").await;

    assert!(client.close_conversation("c1"));
    assert!(!client.close_conversation("c1"));
    assert_eq!(client.notifications().active_conversation(), None);
    // Notifications and the unread counter still hold subscriptions.
    assert!(client.feed().is_ready());

    backend.insert_message(&inbound("c1", "Are you there?")).await.unwrap();
    settle().await;
    assert_eq!(client.notifications().unread_badge(), 1);
    assert_eq!(client.unread().get(), 1);

    client.shutdown();
    assert!(!client.feed().is_ready());
}

#[tokio::test(start_paused = true)]
async fn typing_reaches_the_other_participant() {
    let backend = backend();
    let (buyer, _) = client(&backend);
    let seller = RealtimeClient::in_memory(
        ClientConfig::default(),
        AuthSession::new("seller", "Sam Seller"),
        backend.clone(),
        Arc::new(HeadlessHost::default()),
    );
    seller.start();

    let mine = buyer.open_conversation("c1").await;
    let theirs = seller.open_conversation("c1").await;
    let typing = mine.typing.unwrap();
    let watcher = theirs.typing.unwrap();

    typing.handle_typing_start();
    settle().await;
    let users = watcher.typing_users();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, "me");

    // Idle timeout stops the local signal.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!typing.is_typing());
    assert!(watcher.typing_users().is_empty());
}
