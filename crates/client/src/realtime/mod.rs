//! Shared change feed: one wire connection multiplexed into per-topic subscriptions.

mod connection;
mod router;

pub use connection::{ConnectionStatus, FeedConnection, ListenerId, ReadyCallback};
pub use router::{ChangeCallback, Subscription, TopicRouter};
