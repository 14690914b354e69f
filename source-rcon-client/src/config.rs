use std::time::Duration;

/// Connection and request policy for a [`Client`](crate::Client).
///
/// The client never mutates its configuration; a new one only takes effect through
/// [`Client::setup`](crate::Client::setup).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// How long a request waits for its answer, in seconds. Zero or less waits forever.
    pub timeout_seconds: f64,
    /// Whether transport failures trigger reconnection.
    pub retry_connect: bool,
    /// How many reconnection attempts are made before giving up.
    pub reconnect_attempts: u32,
    /// Pause between reconnection attempts, in seconds.
    pub reconnect_delay_seconds: f64,
    /// Whether the server answers concurrent requests safely, possibly out of order.
    ///
    /// Fire-and-forget sends only collect their answer when this is set.
    pub server_supports_concurrent_reads: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout_seconds: 5.0,
            retry_connect: true,
            reconnect_attempts: 3,
            reconnect_delay_seconds: 1.0,
            server_supports_concurrent_reads: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_retry_connect(mut self, retry: bool) -> Self {
        self.retry_connect = retry;
        self
    }

    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay_seconds(mut self, seconds: f64) -> Self {
        self.reconnect_delay_seconds = seconds;
        self
    }

    pub fn with_concurrent_reads(mut self, supported: bool) -> Self {
        self.server_supports_concurrent_reads = supported;
        self
    }

    /// The request timeout, or `None` to wait forever.
    ///
    /// Timeouts too large to represent also wait forever.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds > 0.0 {
            Duration::try_from_secs_f64(self.timeout_seconds).ok()
        } else {
            None
        }
    }

    /// The pause between reconnect attempts. Delays too large to represent saturate.
    pub fn reconnect_delay(&self) -> Duration {
        if self.reconnect_delay_seconds > 0.0 {
            Duration::try_from_secs_f64(self.reconnect_delay_seconds).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}
