//! Conversation engine and terminal client for a web chat service.
//!
//! A [`session::Session`] drives one server thread through opaque
//! continuation tokens and an optional [`history_store::HistoryStore`].
//! The [`runtime::ChatController`] runs sends, uploads and store work on
//! worker threads and reports back through [`runtime::UiEvent`]s, which the
//! line-mode [`shell::Shell`] renders.
//!
//! # Module map
//! - [`parser`]: response envelope to [`chat_provider::ModelOutput`] plus tokens.
//! - [`session`]: turn state machine with persistence ordering.
//! - [`attachments`], [`gems`]: upload intake and persona catalog.
//! - [`commands`], [`shell`], [`cli`]: user surfaces.
//! - [`config`], [`cookies`], [`logging`], [`backends`]: startup wiring.

pub mod attachments;
pub mod backends;
pub mod cli;
pub mod commands;
pub mod config;
pub mod cookies;
pub mod error;
pub mod gems;
pub mod logging;
pub mod parser;
pub mod runtime;
pub mod session;
pub mod shell;

pub use attachments::{AttachmentManager, DEFAULT_MAX_UPLOAD_BYTES};
pub use commands::{parse_chat_command, ChatCommand, ExportFormat};
pub use config::Config;
pub use gems::{GemJar, GemRegistry};
pub use parser::{parse_generate_response, ParsedTurn};
pub use runtime::{ChatController, SendId, UiEvent};
pub use session::{Session, SessionState, TurnRequest};
pub use shell::Shell;
