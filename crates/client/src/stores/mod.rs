//! In-memory state owned by the realtime components.

pub mod messages;
pub mod typing;

pub use messages::{
    display_order, is_temp_id, new_temp_id, AddOutcome, Message, MessageList, MessagePatch,
    MessageStatus,
};
pub use typing::{TypingRoster, TypingUser};
