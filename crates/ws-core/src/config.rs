//! Server configuration loading.
//!
//! TOML is the sole config source; every field has a code default so
//! embedded use needs no file at all.
//!
//! # Fields
//! - `max_text_message_buffer_size` — default cap for reassembled text
//!   messages, bytes (default 65536)
//! - `max_binary_message_buffer_size` — same for binary (default 65536)
//! - `max_idle_timeout_ms` — default per-session idle timeout, 0 disables
//!   (default 0)
//! - `dispose_grace_ms` — how long endpoint dispose waits for live sessions
//!   to drain before abandoning them (default 5000)

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_MESSAGE_BUFFER_SIZE: usize = 65536;
pub const DEFAULT_DISPOSE_GRACE_MS: u64 = 5000;

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Default cap on a reassembled text message, in bytes.  Sessions may
    /// override their own copy at runtime.
    pub max_text_message_buffer_size: usize,
    /// Default cap on a reassembled binary message, in bytes.
    pub max_binary_message_buffer_size: usize,
    /// Default idle timeout in milliseconds; 0 disables idle closing.
    pub max_idle_timeout_ms: u64,
    /// Grace period for endpoint dispose, in milliseconds.
    pub dispose_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_text_message_buffer_size: DEFAULT_MESSAGE_BUFFER_SIZE,
            max_binary_message_buffer_size: DEFAULT_MESSAGE_BUFFER_SIZE,
            max_idle_timeout_ms: 0,
            dispose_grace_ms: DEFAULT_DISPOSE_GRACE_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization type (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    max_text_message_buffer_size: Option<usize>,
    max_binary_message_buffer_size: Option<usize>,
    max_idle_timeout_ms: Option<u64>,
    dispose_grace_ms: Option<u64>,
}

impl ServerConfig {
    /// Parse a TOML document, filling absent fields with defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            max_text_message_buffer_size: raw
                .max_text_message_buffer_size
                .unwrap_or(defaults.max_text_message_buffer_size),
            max_binary_message_buffer_size: raw
                .max_binary_message_buffer_size
                .unwrap_or(defaults.max_binary_message_buffer_size),
            max_idle_timeout_ms: raw
                .max_idle_timeout_ms
                .unwrap_or(defaults.max_idle_timeout_ms),
            dispose_grace_ms: raw.dispose_grace_ms.unwrap_or(defaults.dispose_grace_ms),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_text_message_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "max_text_message_buffer_size must be at least 1".to_owned(),
            ));
        }
        if self.max_binary_message_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "max_binary_message_buffer_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
