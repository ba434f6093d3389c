//! Bidroom client realtime core
//!
//! One shared change-feed connection per process, fanned out to the
//! conversation pipelines, reaction books, unread counter and notification
//! center that consume it, plus per-conversation typing channels.

pub mod logging;

pub mod audio;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod notifications;
pub mod pipeline;
pub mod reactions;
pub mod realtime;
pub mod stores;
pub mod typing;

pub use backend::{AuthSession, MemoryBackend, PhoenixSocket, RestBackend};
pub use client::{ConversationSession, RealtimeClient};
pub use config::ClientConfig;
pub use error::{HostError, SendError};
pub use notifications::{HeadlessHost, NotificationCenter, NotificationHost, UnreadCounter};
pub use pipeline::{ConversationPipeline, ListChange, PipelineUpdate, ScrollIntent};
pub use reactions::{ReactionBook, ReactionSummary, Toggled};
pub use realtime::{ConnectionStatus, FeedConnection, Subscription, TopicRouter};
pub use stores::{Message, MessageStatus};
pub use typing::TypingSignal;
