//! Client configuration.
//!
//! Everything here comes from command-line flags; there is no client config
//! file.

use std::time::Duration;

use url::Url;

use crate::error::{ClientError, Result};

/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound for the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Default timeout for opening the WebSocket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for the `create_terminal` acknowledgement.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default resize debounce window.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);
/// Default number of input chunks held while a session is being created.
pub const DEFAULT_PENDING_INPUT_LIMIT: usize = 1024;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the client transport and session controller.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the daemon, e.g. `ws://host:8080/ws`.
    pub url: String,
    /// Consecutive failed connection attempts allowed before giving up.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_reconnect_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Grace period for a heartbeat pong.
    pub heartbeat_timeout: Duration,
    /// Timeout for the `create_terminal` acknowledgement.
    pub create_timeout: Duration,
    /// Resize events closer together than this are coalesced.
    pub resize_debounce: Duration,
    /// Input chunks queued while waiting for the create ack.
    pub pending_input_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            pending_input_limit: DEFAULT_PENDING_INPUT_LIMIT,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the number of reconnect attempts.
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Sets the initial and maximum reconnect delay.
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval and pong grace period.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the create acknowledgement timeout.
    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Sets the resize debounce window.
    pub fn with_resize_debounce(mut self, debounce: Duration) -> Self {
        self.resize_debounce = debounce;
        self
    }

    /// Sets the pending input limit.
    pub fn with_pending_input_limit(mut self, limit: usize) -> Self {
        self.pending_input_limit = limit;
        self
    }

    /// Parse and check the server URL.
    pub fn server_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.url)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::InvalidUrl(format!(
                "{}: scheme must be ws or wss, not {other}",
                self.url
            ))),
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        self.server_url()?;
        if self.create_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "create timeout must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.pending_input_limit == 0 {
            return Err(ClientError::InvalidConfig(
                "pending input limit must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ClientError::InvalidConfig(
                "backoff multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay after `delay`, growing by the multiplier up to the maximum.
    pub fn next_backoff(&self, delay: Duration) -> Duration {
        std::cmp::min(
            Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
            self.max_reconnect_delay,
        )
    }
}
