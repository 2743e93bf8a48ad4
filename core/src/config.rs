/// Configuration management
use crate::error::{ChatError, Result};
use crate::messenger_types::Role;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TYPING_EXPIRY_MS: u64 = 2000;
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Chat client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Quiet period after which a peer's typing indicator disappears
    pub typing_expiry: Duration,

    /// Number of messages fetched for the global (inbox) view
    pub history_limit: usize,

    /// Capacity of the client event bus
    pub event_capacity: usize,

    /// Identifier of the local user (signed-in session)
    pub local_user_id: String,

    /// Email of the local user, shown to peers in typing events
    pub local_email: String,

    /// Role of the local user
    pub role: Role,

    /// Start without a signed-in user
    pub guest: bool,

    /// Open the advisor conversation on start for customers
    pub auto_open_advisor: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_millis(DEFAULT_TYPING_EXPIRY_MS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_capacity: 256,
            local_user_id: "local-user".to_string(),
            local_email: "local@planchat.dev".to_string(),
            role: Role::Customer,
            guest: false,
            auto_open_advisor: true,
        }
    }
}

impl ChatConfig {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--user" => {
                    config.local_user_id = required_value(args, i, "--user")?.to_string();
                    i += 2;
                }
                "--email" => {
                    config.local_email = required_value(args, i, "--email")?.to_string();
                    i += 2;
                }
                "--advisor" => {
                    config.role = Role::Advisor;
                    i += 1;
                }
                "--guest" => {
                    config.guest = true;
                    i += 1;
                }
                "--typing-expiry-ms" => {
                    let v = required_value(args, i, "--typing-expiry-ms")?;
                    config.typing_expiry = Duration::from_millis(parse_u64(v, "--typing-expiry-ms")?);
                    i += 2;
                }
                "--history-limit" => {
                    let v = required_value(args, i, "--history-limit")?;
                    config.history_limit = parse_u64(v, "--history-limit")? as usize;
                    i += 2;
                }
                "--no-auto-advisor" => {
                    config.auto_open_advisor = false;
                    i += 1;
                }
                other => {
                    return Err(ChatError::Config(format!(
                        "Unknown argument '{}'. Usage: {} [--user <id>] [--email <addr>] [--advisor] [--guest] [--typing-expiry-ms <n>] [--history-limit <n>] [--no-auto-advisor]",
                        other,
                        args.first().map(String::as_str).unwrap_or("planchat")
                    )));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(ms) = std::env::var("PLANCHAT_TYPING_EXPIRY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.typing_expiry = Duration::from_millis(ms);
        }
        if let Some(limit) = std::env::var("PLANCHAT_HISTORY_LIMIT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.history_limit = limit;
        }

        if config.history_limit == 0 {
            return Err(ChatError::Config("--history-limit must be at least 1".to_string()));
        }

        Ok(config)
    }
}

fn required_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

fn parse_u64(value: &str, flag: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| ChatError::Config(format!("{} must be a non-negative number", flag)))
}
