//! Interaction configuration.
use crate::messages::MIN_MESSAGE_SIZE;
use crate::registry::DEFAULT_MAX_PATHS_PER_INVOKE;
use std::time::Duration;

/// Default upper bound on an encoded interaction message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;
/// Default time a client waits for each response message.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default window opened by a timed request.
pub const DEFAULT_TIMED_REQUEST_TIMEOUT_MS: u16 = 500;

/// Errors produced when validating interaction configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Messages must hold at least one status reply.
    MessageSizeTooSmall {
        /// Value provided by caller.
        provided: usize,
        /// Smallest accepted value.
        minimum: usize,
    },
    /// A handler must accept at least one path per invoke.
    InvalidMaxPaths {
        /// Value provided by caller.
        provided: u16,
    },
    /// Response timeout must be > 0.
    InvalidResponseTimeout(Duration),
    /// Timed request window must be > 0.
    InvalidTimedRequestTimeout {
        /// Value provided by caller.
        provided: u16,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MessageSizeTooSmall { provided, minimum } => {
                write!(f, "max_message_size must be >= {} (got {})", minimum, provided)
            }
            ConfigError::InvalidMaxPaths { provided } => {
                write!(f, "max_paths_per_invoke must be > 0 (got {})", provided)
            }
            ConfigError::InvalidResponseTimeout(timeout) => {
                write!(f, "response_timeout must be > 0 (got {:?})", timeout)
            }
            ConfigError::InvalidTimedRequestTimeout { provided } => {
                write!(f, "timed_request_timeout_ms must be > 0 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validated configuration shared by senders and handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvokeConfig {
    max_message_size: usize,
    max_paths_per_invoke: u16,
    response_timeout: Duration,
    timed_request_timeout_ms: u16,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_paths_per_invoke: DEFAULT_MAX_PATHS_PER_INVOKE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            timed_request_timeout_ms: DEFAULT_TIMED_REQUEST_TIMEOUT_MS,
        }
    }
}

impl InvokeConfig {
    /// Builder starting from the defaults.
    pub fn builder() -> InvokeConfigBuilder {
        InvokeConfigBuilder::new()
    }

    /// Largest encoded message either side produces.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Commands a handler accepts in one invoke.
    pub fn max_paths_per_invoke(&self) -> u16 {
        self.max_paths_per_invoke
    }

    /// Wait per response message before a client gives up.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Window requested by timed invokes.
    pub fn timed_request_timeout_ms(&self) -> u16 {
        self.timed_request_timeout_ms
    }

    /// Check a config obtained other than through the builder (e.g. deserialized).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::MessageSizeTooSmall {
                provided: self.max_message_size,
                minimum: MIN_MESSAGE_SIZE,
            });
        }
        if self.max_paths_per_invoke == 0 {
            return Err(ConfigError::InvalidMaxPaths { provided: 0 });
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::InvalidResponseTimeout(self.response_timeout));
        }
        if self.timed_request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimedRequestTimeout { provided: 0 });
        }
        Ok(())
    }
}

/// Builder for [`InvokeConfig`].
#[derive(Debug, Clone)]
pub struct InvokeConfigBuilder {
    config: InvokeConfig,
}

impl InvokeConfigBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self { config: InvokeConfig::default() }
    }

    /// Upper bound on encoded messages, at least [`MIN_MESSAGE_SIZE`].
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Commands a handler accepts per invoke.
    pub fn max_paths_per_invoke(mut self, paths: u16) -> Self {
        self.config.max_paths_per_invoke = paths;
        self
    }

    /// Per-message response wait for clients.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Timed request window in milliseconds.
    pub fn timed_request_timeout_ms(mut self, ms: u16) -> Self {
        self.config.timed_request_timeout_ms = ms;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<InvokeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for InvokeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sender settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SenderConfig {
    /// Commands the peer accepts in one invoke.
    pub remote_max_paths_per_invoke: u16,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { remote_max_paths_per_invoke: DEFAULT_MAX_PATHS_PER_INVOKE }
    }
}
