//! Root of the `elephie-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the appropriate abstraction (e.g.,
// the CLI renderer or the tracing stack).
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod client;
pub mod config;
pub mod conversation;
mod conversation_history;
pub mod error;
mod flags;
pub mod history_window;
pub mod models;
pub mod relay_stream;
pub mod sse;
pub mod transcript;

pub use client::ChatBackend;
pub use client::RelayClient;
pub use client::ReplyStream;
pub use config::ClientConfig;
pub use config::Config;
pub use config::ConfigOverrides;
pub use config::RelayConfig;
pub use conversation::Conversation;
pub use conversation::ConversationSnapshot;
pub use conversation::SaveOutcome;
pub use conversation_history::ConversationHistory;
pub use history_window::DEFAULT_HISTORY_CHAR_BUDGET;
pub use history_window::window_history;
pub use models::Message;
pub use models::Role;
pub use relay_stream::ChatRelay;
pub use relay_stream::RelayStream;
pub use relay_stream::StaticToken;
pub use relay_stream::TokenProvider;
