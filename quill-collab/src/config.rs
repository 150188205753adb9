//! Server configuration with environment overrides.
//!
//! | variable                    | field                 | default          |
//! |-----------------------------|-----------------------|------------------|
//! | `QUILL_BIND_ADDR`           | `bind_addr`           | `127.0.0.1:9090` |
//! | `QUILL_HTTP_ADDR`           | `http_addr`           | `127.0.0.1:9091` |
//! | `QUILL_BROADCAST_CAPACITY`  | `broadcast_capacity`  | 256              |
//! | `QUILL_CLEANUP_GRACE_SECS`  | `cleanup_grace`       | 3600 s           |
//! | `QUILL_CHAT_HISTORY_LIMIT`  | `chat_history_limit`  | 1000             |
//! | `QUILL_ASSIST_TIMEOUT_MS`   | `assist_timeout`      | 5000 ms          |
//! | `QUILL_MAX_PENDING_ASSISTS` | `max_pending_assists` | 4                |

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::directory::DEFAULT_CLEANUP_GRACE;
use crate::document::{DEFAULT_LANGUAGE, DEFAULT_WELCOME_TEXT};
use crate::room::RoomSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listener address
    pub bind_addr: String,
    /// HTTP side-channel listener address
    pub http_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long an empty room survives
    pub cleanup_grace: Duration,
    /// Chat messages retained per room
    pub chat_history_limit: usize,
    /// Deadline for one assistance request
    pub assist_timeout: Duration,
    /// Assistance requests in flight per connection
    pub max_pending_assists: usize,
    /// Initial content of new rooms
    pub welcome_text: String,
    /// Initial language of new rooms
    pub default_language: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:9091".to_string(),
            broadcast_capacity: 256,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            chat_history_limit: 1000,
            assist_timeout: Duration::from_millis(5000),
            max_pending_assists: 4,
            welcome_text: DEFAULT_WELCOME_TEXT.to_string(),
            default_language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUILL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("QUILL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(addr) = lookup("QUILL_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(v) = parse(&lookup, "QUILL_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = v;
        }
        if let Some(secs) = parse(&lookup, "QUILL_CLEANUP_GRACE_SECS")? {
            config.cleanup_grace = Duration::from_secs(secs);
        }
        if let Some(v) = parse(&lookup, "QUILL_CHAT_HISTORY_LIMIT")? {
            config.chat_history_limit = v;
        }
        if let Some(ms) = parse(&lookup, "QUILL_ASSIST_TIMEOUT_MS")? {
            config.assist_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "QUILL_MAX_PENDING_ASSISTS")? {
            config.max_pending_assists = v;
        }

        if config.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "QUILL_BROADCAST_CAPACITY",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }

    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            welcome_text: self.welcome_text.clone(),
            default_language: self.default_language.clone(),
            broadcast_capacity: self.broadcast_capacity,
            chat_history_limit: self.chat_history_limit,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
