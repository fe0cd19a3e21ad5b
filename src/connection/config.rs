//! Connection configuration.

use std::time::Duration;

use crate::address::DEFAULT_ADDRESS_CACHE_CAPACITY;
use crate::protocol::{ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::writer::WriterConfig;

/// Environment override for [`ConnectionConfig::max_frame_size`].
pub const ENV_MAX_FRAME_SIZE: &str = "PROCLINK_MAX_FRAME_SIZE";

/// Environment override for [`ConnectionConfig::keep_alive_interval`], in
/// milliseconds. `0` disables keep-alives.
pub const ENV_KEEP_ALIVE_MS: &str = "PROCLINK_KEEP_ALIVE_MS";

/// Environment override for [`ConnectionConfig::max_pending_calls`].
pub const ENV_MAX_PENDING_CALLS: &str = "PROCLINK_MAX_PENDING_CALLS";

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default limit on outstanding calls per connection.
pub const DEFAULT_MAX_PENDING_CALLS: usize = 8192;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest data frame accepted from the peer.
    pub max_frame_size: u32,
    /// Idle interval after which a keep-alive is written. `None` disables it.
    pub keep_alive_interval: Option<Duration>,
    /// Outstanding calls allowed before `send_request` is refused.
    pub max_pending_calls: usize,
    /// After forwarding a cancellation, resolve the call locally as cancelled
    /// if the peer stays silent this long. `None` waits for the peer.
    pub cancel_grace_period: Option<Duration>,
    /// Entries kept by the connection's address cache.
    pub address_cache_capacity: usize,
    /// Writer task settings (keep-alive is taken from this config).
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            cancel_grace_period: None,
            address_cache_capacity: DEFAULT_ADDRESS_CACHE_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `PROCLINK_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(size) = parse_var::<u32>(&var, ENV_MAX_FRAME_SIZE) {
            self = self.max_frame_size(size);
        }
        if let Some(ms) = parse_var::<u64>(&var, ENV_KEEP_ALIVE_MS) {
            self.keep_alive_interval = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(max) = parse_var::<usize>(&var, ENV_MAX_PENDING_CALLS).filter(|v| *v > 0) {
            self.max_pending_calls = max;
        }
        self
    }

    /// Set the maximum accepted frame size (clamped to `1..=i32::MAX`).
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size.clamp(1, ABSOLUTE_MAX_FRAME_SIZE);
        self
    }

    /// Set or disable the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the outstanding call limit.
    pub fn max_pending_calls(mut self, max: usize) -> Self {
        self.max_pending_calls = max.max(1);
        self
    }

    /// Set or disable the cancellation grace period.
    pub fn cancel_grace_period(mut self, period: Option<Duration>) -> Self {
        self.cancel_grace_period = period;
        self
    }

    /// Replace the writer settings.
    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            keep_alive_interval: self.keep_alive_interval,
            ..self.writer.clone()
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
