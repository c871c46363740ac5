/// chatsync - realtime conversation sync engine
///
/// Keeps a user's conversation list and the open conversation's message
/// history consistent by merging REST snapshots with live push events,
/// across reconnects, session changes and rapid conversation switching.

pub mod backoff;
pub mod cli_app;
pub mod config;
pub mod conversation_index;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod http_client;
pub mod message_stream;
pub mod model;
pub mod rest;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use coordinator::{SelectOutcome, SyncCoordinator};
pub use error::{Result, SyncError};
pub use event::SyncEvent;
pub use model::{
    ConnectionState, ConnectionStatus, Conversation, ConversationView, Credential, Generation,
    Message, MessageView,
};
pub use session::SessionWatch;
pub use supervisor::ConnectionSupervisor;
