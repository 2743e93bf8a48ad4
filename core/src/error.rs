/// Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message body is empty")]
    EmptyMessage,

    #[error("User is not authenticated")]
    NotAuthenticated,

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
