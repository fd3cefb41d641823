//! Conversation history: the in-memory message store, the conversation
//! directory, and the shared message types.
//!
//! [`MessageStore`] owns the active conversation, [`ConversationDirectory`]
//! manages the set of conversations per user. Both sit on top of a
//! [`DurableCache`](crate::plugins::storage::DurableCache) and, optionally, a
//! [`LongTermMemory`](crate::services::memory::LongTermMemory) backend.

mod directory;
mod error;
mod store;
pub(crate) mod types;

pub use directory::ConversationDirectory;
pub use error::StoreError;
pub use store::{MessageStore, StoreEvent, Subscription};
pub use types::{
    ConversationMetadata, ConversationSummary, DebugInfo, ListenerCounts, Message, PaginationInfo,
    PendingWrite,
};
