//! Durable local history of chat conversations.
//!
//! Conversations are stored as one JSON record per conversation plus an
//! ordered index of summaries. See [`HistoryStore`] for the write discipline.

mod error;
mod export;
mod paths;
mod schema;
mod store;

pub use error::HistoryStoreError;
pub use export::render_markdown;
pub use paths::{conversation_file_name, history_root, HISTORY_DIR};
pub use schema::{
    title_from_content, Conversation, ConversationSummary, ImageKind, ImageRef, Message,
    NewMessage, Role, TITLE_MAX_GRAPHEMES, UNTITLED,
};
pub use store::HistoryStore;
