//! Shared types for the bidroom realtime core and its backend bindings.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
