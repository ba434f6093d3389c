//! Realtime socket binding (Phoenix channels over tokio-tungstenite).
//!
//! Each `open`/`join` dials its own socket and joins exactly one channel on
//! it, so tearing a channel down is just dropping it.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bidroom_shared::{
    BackendError, EventFilter, Inbound, JoinPayload, PhxFrame, PresenceMember, PresenceMessage,
    ReplyStatus, Table, TypingEntry,
};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::stream::Stream;
use futures_util::{future, SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{
    ChangeFeedTransport, FeedSignal, FeedStream, PresenceLink, PresenceTransport,
};
use crate::config::{BackendConfig, FeedConfig};

/// Channel topic of the shared change feed.
const CHANGES_TOPIC: &str = "realtime:bidroom-changes";

/// Broadcast event name carrying typing entries.
const TYPING_EVENT: &str = "typing";

/// Dials the backend's realtime socket.
#[derive(Clone)]
pub struct PhoenixSocket {
    backend: BackendConfig,
    heartbeat_interval: std::time::Duration,
    next_ref: Arc<AtomicU64>,
}

impl PhoenixSocket {
    pub fn new(backend: BackendConfig, feed: &FeedConfig) -> Self {
        Self {
            backend,
            heartbeat_interval: feed.heartbeat_interval,
            next_ref: Arc::new(AtomicU64::new(1)),
        }
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Dial, join `topic`, and wait for the join reply.
    async fn connect_channel(&self, topic: &str, payload: JoinPayload) -> Result<Channel, BackendError> {
        let url = self.backend.realtime_url();
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        crate::log_debug!("Realtime socket connected, joining {}", topic);

        let (mut write, mut read) = ws_stream.split();

        let join_ref = self.make_ref();
        let join = PhxFrame::join(topic, join_ref.clone(), &payload);
        let json = serde_json::to_string(&join)?;
        write
            .send(Message::text(json))
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        // Wait for our join reply; anything before it is noise.
        loop {
            let Some(msg) = read.next().await else {
                return Err(BackendError::Closed("socket closed during join".to_string()));
            };
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => {
                    return Err(BackendError::Closed("socket closed during join".to_string()))
                }
                Ok(_) => continue,
                Err(e) => return Err(BackendError::Network(e.to_string())),
            };
            let frame: PhxFrame = match serde_json::from_str(text.as_str()) {
                Ok(frame) => frame,
                Err(e) => {
                    crate::log_warn!("Ignoring unparseable frame during join: {}", e);
                    continue;
                }
            };
            if frame.topic != topic {
                continue;
            }
            match frame.classify() {
                Inbound::Reply { reference, status } if reference.as_deref() == Some(join_ref.as_str()) => {
                    match status {
                        ReplyStatus::Ok => break,
                        ReplyStatus::Error(reason) => return Err(BackendError::Rejected(reason)),
                    }
                }
                Inbound::Error(reason) => return Err(BackendError::Rejected(reason)),
                Inbound::Closed => {
                    return Err(BackendError::Closed("channel closed during join".to_string()))
                }
                _ => {}
            }
        }
        crate::log_info!("Joined realtime channel {}", topic);

        let (out_tx, mut out_rx) = unbounded::<PhxFrame>();
        let (in_tx, in_rx) = unbounded::<Inbound>();

        // Read task
        let topic_for_read = topic.to_string();
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<PhxFrame>(text.as_str()) {
                            Ok(frame) => {
                                if frame.topic != topic_for_read
                                    && frame.topic != bidroom_shared::PHOENIX_TOPIC
                                {
                                    continue;
                                }
                                let inbound = frame.classify();
                                let terminal = matches!(inbound, Inbound::Closed);
                                if in_tx.unbounded_send(inbound).is_err() || terminal {
                                    break;
                                }
                            }
                            Err(e) => crate::log_error!("Failed to parse frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        crate::log_info!("Realtime socket for {} received close frame", topic_for_read);
                        let _ = in_tx.unbounded_send(Inbound::Closed);
                        break;
                    }
                    Ok(_) => {
                        // Ping/pong handled by tungstenite
                    }
                    Err(e) => {
                        crate::log_error!("Realtime socket read error: {}", e);
                        let _ = in_tx.unbounded_send(Inbound::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        // Write task
        let write_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.next().await {
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::text(json)).await {
                            crate::log_error!("Realtime send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                }
            }
            let _ = write.close().await;
        });

        // Heartbeat task
        let heartbeat_tx = out_tx.clone();
        let interval = self.heartbeat_interval;
        let refs = self.next_ref.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reference = refs.fetch_add(1, Ordering::Relaxed).to_string();
                if heartbeat_tx.unbounded_send(PhxFrame::heartbeat(reference)).is_err() {
                    break;
                }
            }
        });

        Ok(Channel {
            topic: topic.to_string(),
            join_ref,
            outbound: out_tx,
            inbound: in_rx,
            tasks: vec![read_task, write_task, heartbeat_task],
        })
    }
}

/// One joined channel. Yields classified inbound frames; dropping it leaves
/// the channel and stops the socket tasks.
struct Channel {
    topic: String,
    join_ref: String,
    outbound: UnboundedSender<PhxFrame>,
    inbound: UnboundedReceiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stream for Channel {
    type Item = Inbound;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_next_unpin(cx)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let leave = PhxFrame::leave(&self.topic, &self.join_ref, &self.join_ref);
        let _ = self.outbound.unbounded_send(leave);
        // The writer (index 1) drains the leave and exits once every sender is gone.
        for (i, task) in self.tasks.iter().enumerate() {
            if i != 1 {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl ChangeFeedTransport for PhoenixSocket {
    async fn open(&self, tables: &[Table]) -> Result<FeedStream, BackendError> {
        let payload =
            JoinPayload::postgres_changes(tables, EventFilter::Any, self.backend.access_token.clone());
        let channel = self.connect_channel(CHANGES_TOPIC, payload).await?;

        let stream = channel.filter_map(|inbound| {
            future::ready(match inbound {
                Inbound::Change(raw) => Some(FeedSignal::Change(raw)),
                Inbound::Reply {
                    status: ReplyStatus::Ok,
                    ..
                } => Some(FeedSignal::Heartbeat),
                Inbound::Reply {
                    status: ReplyStatus::Error(reason),
                    ..
                } => Some(FeedSignal::Closed(format!("reply error: {reason}"))),
                Inbound::Error(reason) => Some(FeedSignal::Closed(reason)),
                Inbound::Closed => Some(FeedSignal::Closed("channel closed".to_string())),
                Inbound::Malformed(reason) => {
                    crate::log_warn!("Dropping malformed change frame: {}", reason);
                    None
                }
                _ => None,
            })
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl PresenceTransport for PhoenixSocket {
    async fn join(&self, topic: &str, member: &PresenceMember) -> Result<PresenceLink, BackendError> {
        let wire_topic = format!("realtime:{topic}");
        let payload = JoinPayload::presence(member.user_id.clone(), self.backend.access_token.clone());
        let mut channel = self.connect_channel(&wire_topic, payload).await?;

        let meta = serde_json::to_value(member)?;
        let _ = channel
            .outbound
            .unbounded_send(PhxFrame::track(&wire_topic, &channel.join_ref, meta));

        // Outbound typing entries become channel broadcasts.
        let (tx, mut rx) = unbounded::<PresenceMessage>();
        let frames = channel.outbound.clone();
        let join_ref = channel.join_ref.clone();
        let forward_topic = wire_topic.clone();
        channel.tasks.push(tokio::spawn(async move {
            while let Some(msg) = rx.next().await {
                let PresenceMessage::Typing(entry) = msg else {
                    // Membership is tracked by the server.
                    continue;
                };
                let payload = match serde_json::to_value(&entry) {
                    Ok(payload) => payload,
                    Err(e) => {
                        crate::log_error!("Serialize failed: {}", e);
                        continue;
                    }
                };
                let frame = PhxFrame::broadcast(&forward_topic, &join_ref, TYPING_EVENT, payload);
                if frames.unbounded_send(frame).is_err() {
                    break;
                }
            }
        }));

        let mut present: HashSet<String> = HashSet::new();
        let inbound = channel.filter_map(move |inbound| {
            let out = match inbound {
                Inbound::Broadcast { event, payload } if event == TYPING_EVENT => {
                    match serde_json::from_value::<TypingEntry>(payload) {
                        Ok(entry) => Some(PresenceMessage::Typing(entry)),
                        Err(e) => {
                            crate::log_warn!("Dropping malformed typing payload: {}", e);
                            None
                        }
                    }
                }
                Inbound::PresenceState { present: keys } => {
                    present = keys.into_iter().collect();
                    Some(sync_of(&present))
                }
                Inbound::PresenceDiff { joins, leaves } => {
                    present.extend(joins);
                    for key in &leaves {
                        present.remove(key);
                    }
                    Some(sync_of(&present))
                }
                Inbound::Error(reason) => {
                    crate::log_warn!("Presence channel error: {}", reason);
                    None
                }
                _ => None,
            };
            future::ready(out)
        });

        Ok(PresenceLink {
            outbound: tx,
            inbound: inbound.boxed(),
        })
    }
}

fn sync_of(present: &HashSet<String>) -> PresenceMessage {
    let mut keys: Vec<String> = present.iter().cloned().collect();
    keys.sort();
    PresenceMessage::Sync { present: keys }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_is_sorted() {
        let present: HashSet<String> = ["u2", "u1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            sync_of(&present),
            PresenceMessage::Sync {
                present: vec!["u1".into(), "u2".into()]
            }
        );
    }

    #[test]
    fn refs_are_unique() {
        let socket = PhoenixSocket::new(BackendConfig::default(), &FeedConfig::default());
        let a = socket.make_ref();
        let b = socket.make_ref();
        assert_ne!(a, b);
    }
}
