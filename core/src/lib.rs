/// PlanChat - client-side chat core
///
/// Conversation loading, optimistic sends reconciled against the realtime
/// echo, typing presence with local expiry and ownership of realtime feeds,
/// all on top of a hosted backend reached through `MessageGateway`.

pub mod error;
pub mod config;
pub mod session;
pub mod messenger_types;
pub mod gateway;
pub mod inbox;
pub mod conversation;
pub mod typing;
pub mod subscription;
pub mod client;
pub mod cli_app;

pub use error::{ChatError, Result};
pub use config::ChatConfig;
pub use client::ChatClient;
pub use session::{LocalUser, SessionState};
