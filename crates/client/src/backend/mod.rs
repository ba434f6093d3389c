//! Backend collaborator seams.
//!
//! The realtime core never talks to a concrete service directly. It consumes
//! three capabilities, each behind a trait:
//!
//! - [`DataBackend`]: query and mutate rows (message pages, inserts, read
//!   marks, reactions, profiles, attachment uploads)
//! - [`ChangeFeedTransport`]: open one wire subscription to row changes
//! - [`PresenceTransport`]: join an ephemeral per-topic broadcast channel
//!
//! Bindings: [`RestBackend`] + [`PhoenixSocket`] for the hosted service,
//! [`MemoryBackend`] for in-process use.

mod memory;
mod rest;
mod session;
mod socket;

pub use memory::MemoryBackend;
pub use rest::RestBackend;
pub use session::AuthSession;
pub use socket::PhoenixSocket;

use async_trait::async_trait;
use bidroom_shared::{
    Attachment, BackendError, MessageRow, NewMessage, NewReaction, PresenceMember,
    PresenceMessage, Profile, RawChange, ReactionRow, Table,
};
use chrono::{DateTime, Utc};
use futures_channel::mpsc::UnboundedSender;
use futures_util::stream::BoxStream;

/// A file the user attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Query/mutate capability of the backend.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Newest-first page of a conversation; `before` restricts to strictly older rows.
    async fn fetch_messages_page(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRow, BackendError>;

    /// Mark every message in the conversation not sent by `reader_id` as read.
    /// Returns the rows that changed.
    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<Vec<MessageRow>, BackendError>;

    /// Unread inbound messages across the user's conversations.
    async fn count_unread(&self, user_id: &str) -> Result<u64, BackendError>;

    async fn fetch_reactions(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>, BackendError>;

    async fn add_reaction(&self, reaction: &NewReaction) -> Result<ReactionRow, BackendError>;

    async fn remove_reaction(&self, reaction_id: &str) -> Result<(), BackendError>;

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, BackendError>;

    async fn upload_attachment(
        &self,
        conversation_id: &str,
        attachment: &OutgoingAttachment,
    ) -> Result<Attachment, BackendError>;
}

/// What a live change-feed wire connection yields.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Change(RawChange),
    /// Transport-level liveness (e.g. a heartbeat reply).
    Heartbeat,
    /// The wire connection is gone; the stream ends after this.
    Closed(String),
}

/// A live wire subscription. Dropping it tears the connection down.
pub type FeedStream = BoxStream<'static, FeedSignal>;

#[async_trait]
pub trait ChangeFeedTransport: Send + Sync {
    /// Open one wire connection registered for every table with a catch-all filter.
    /// Resolves once the handshake has been acknowledged.
    async fn open(&self, tables: &[Table]) -> Result<FeedStream, BackendError>;
}

/// Both halves of a joined presence channel. Dropping `inbound` leaves the channel.
pub struct PresenceLink {
    pub outbound: UnboundedSender<PresenceMessage>,
    pub inbound: BoxStream<'static, PresenceMessage>,
}

#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn join(&self, topic: &str, member: &PresenceMember) -> Result<PresenceLink, BackendError>;
}

/// Presence topic for a conversation's typing channel.
pub fn typing_topic(conversation_id: &str) -> String {
    format!("typing:{conversation_id}")
}
