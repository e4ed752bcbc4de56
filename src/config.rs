//! Endpoint configuration parameters
//!
//! Runtime-tunable values for one endpoint. Table sizes and queue depths are
//! compile-time constants next to the code that owns them; only timing and
//! sizing knobs live here. Values can be loaded from JSON, with missing
//! fields falling back to the defaults.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::rpc::invoke::MAX_NESTING;
use crate::rpc::transport::MAX_FRAME_SIZE;

/// Per-endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    // --- Calls ---
    /// How long a synchronous call waits for its response (milliseconds)
    pub response_timeout_ms: u32,
    /// How long an asynchronous call may stay outstanding (milliseconds)
    pub async_timeout_ms: u32,
    /// Maximum depth of nested calls issued from handlers
    pub max_nesting: u8,

    // --- Callbacks ---
    /// Payload bytes reserved for a proxied callback's results
    pub callback_reply_capacity: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            async_timeout_ms: 5000,
            max_nesting: 4,
            callback_reply_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// JSON text did not describe an `EndpointConfig`.
    Parse,
    ZeroTimeout,
    NestingOutOfRange(u8),
    ReplyCapacityOutOfRange(u16),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse => write!(f, "invalid configuration JSON"),
            Self::ZeroTimeout => write!(f, "timeouts must be non-zero"),
            Self::NestingOutOfRange(n) => {
                write!(f, "max_nesting {n} outside 1..={MAX_NESTING}")
            }
            Self::ReplyCapacityOutOfRange(n) => {
                write!(f, "callback_reply_capacity {n} outside 1..{MAX_FRAME_SIZE}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EndpointConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|_| ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 || self.async_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_nesting == 0 || usize::from(self.max_nesting) > MAX_NESTING {
            return Err(ConfigError::NestingOutOfRange(self.max_nesting));
        }
        if self.callback_reply_capacity == 0
            || usize::from(self.callback_reply_capacity) >= MAX_FRAME_SIZE
        {
            return Err(ConfigError::ReplyCapacityOutOfRange(self.callback_reply_capacity));
        }
        Ok(())
    }
}
