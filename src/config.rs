use std::time::Duration;

/// Per-connection channel ceiling enforced by the venue, minus headroom.
pub const MAX_SHARD_SUBSCRIPTIONS: usize = 250;

/// Consecutive failures tolerated before a connection is marked failed.
pub const MAX_RECONNECTS: u32 = 5;

/// Candle timeframe used when none is configured
pub const DEFAULT_TIMEFRAME: &str = "5min";

/// Configuration for the fleet manager
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Candle timeframe appended to every topic (e.g. "1min", "5min")
    pub timeframe: String,
    /// Maximum markets assigned to one connection
    pub max_subscriptions_per_shard: usize,
    /// Interval of the per-shard credential refresh timer
    pub refresh_interval: Duration,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Reconnect budget and backoff
    pub reconnect: ReconnectConfig,
    /// Subscription request pacing
    pub pacing: PacingConfig,
    /// Bounded retry for sends issued before the socket is open
    pub send_retry: SendRetryConfig,
    /// Control-plane endpoint settings
    pub session: SessionConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            max_subscriptions_per_shard: MAX_SHARD_SUBSCRIPTIONS,
            refresh_interval: Duration::from_secs(12 * 60 * 60), // 12 hours
            connection: ConnectionConfig::default(),
            reconnect: ReconnectConfig::default(),
            pacing: PacingConfig::default(),
            send_retry: SendRetryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Create a new builder for configuration
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::default()
    }
}

/// Builder for FleetConfig
#[derive(Debug, Clone, Default)]
pub struct FleetConfigBuilder {
    config: FleetConfig,
}

impl FleetConfigBuilder {
    /// Set the candle timeframe
    pub fn timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.config.timeframe = timeframe.into();
        self
    }

    /// Set maximum subscriptions per shard
    pub fn max_subscriptions_per_shard(mut self, max: usize) -> Self {
        self.config.max_subscriptions_per_shard = max;
        self
    }

    /// Set the credential refresh interval in whole hours
    pub fn refresh_interval_hours(mut self, hours: u64) -> Self {
        self.config.refresh_interval = Duration::from_secs(hours * 60 * 60);
        self
    }

    /// Set the credential refresh interval
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    /// Set the subscription pacing factor
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.pacing.backoff_factor = factor;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set reconnect configuration
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Set pacing configuration
    pub fn pacing(mut self, config: PacingConfig) -> Self {
        self.config.pacing = config;
        self
    }

    /// Set send retry configuration
    pub fn send_retry(mut self, config: SendRetryConfig) -> Self {
        self.config.send_retry = config;
        self
    }

    /// Set control-plane configuration
    pub fn session(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<FleetConfig, ConfigError> {
        if self.config.max_subscriptions_per_shard == 0 {
            return Err(ConfigError::InvalidSubscriptionLimit(
                "max_subscriptions_per_shard cannot be 0".to_string(),
            ));
        }

        if self.config.timeframe.trim().is_empty() {
            return Err(ConfigError::InvalidTimeframe(
                "timeframe cannot be empty".to_string(),
            ));
        }

        if self.config.refresh_interval.is_zero() {
            return Err(ConfigError::InvalidRefreshInterval(
                "refresh_interval must be > 0".to_string(),
            ));
        }

        let factor = self.config.pacing.backoff_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ConfigError::InvalidPacing(
                "backoff_factor must be a finite value > 0".to_string(),
            ));
        }

        if self.config.reconnect.max_reconnects == 0 {
            return Err(ConfigError::InvalidReconnect(
                "max_reconnects must be > 0".to_string(),
            ));
        }

        if self.config.connection.command_buffer == 0 {
            return Err(ConfigError::InvalidConnection(
                "command_buffer must be > 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid subscription limit
    #[error("Invalid subscription limit: {0}")]
    InvalidSubscriptionLimit(String),
    /// Invalid timeframe
    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),
    /// Invalid refresh interval
    #[error("Invalid refresh interval: {0}")]
    InvalidRefreshInterval(String),
    /// Invalid pacing configuration
    #[error("Invalid pacing configuration: {0}")]
    InvalidPacing(String),
    /// Invalid reconnect configuration
    #[error("Invalid reconnect configuration: {0}")]
    InvalidReconnect(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for TCP connect plus WebSocket handshake
    pub connect_timeout: Duration,
    /// Capacity of the per-connection command channel
    pub command_buffer: usize,
    /// Low-latency mode: disable panic protection for message handlers.
    /// When enabled, handler panics will crash the connection task.
    pub low_latency_mode: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_buffer: 100,
            low_latency_mode: false,
        }
    }
}

/// Reconnect budget and jittered backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failures before the connection is marked failed
    pub max_reconnects: u32,
    /// Length of one backoff step (one second in production)
    pub delay_unit: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_reconnects: MAX_RECONNECTS,
            delay_unit: Duration::from_secs(1),
        }
    }
}

impl ReconnectConfig {
    /// Upper bound, in steps, of the backoff for `attempt`.
    ///
    /// The delay always lies in `[1, min(max_reconnects, 2^attempt - 1) + 1]`.
    pub fn max_steps_for_attempt(&self, attempt: u32) -> u64 {
        let exponential = 2u64.saturating_pow(attempt).saturating_sub(1);
        exponential.min(u64::from(self.max_reconnects)) + 1
    }

    /// Calculate the jittered delay for a given attempt number (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }

    /// Delay for `attempt` using a caller-supplied uniform sample in `[0, 1]`
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let span = (self.max_steps_for_attempt(attempt) - 1) as f64;
        let steps = (sample.clamp(0.0, 1.0) * span + 1.0).round() as u32;
        self.delay_unit * steps
    }
}

/// Pacing for bulk subscribe/unsubscribe
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Wait before the first request
    pub initial_wait: Duration,
    /// Multiplier applied to the wait after each request.
    /// Values below 1 shrink the delay between successive requests.
    pub backoff_factor: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(500),
            backoff_factor: 0.1,
        }
    }
}

/// Bounded retry for sends attempted while the connection is not open
#[derive(Debug, Clone)]
pub struct SendRetryConfig {
    /// Readiness re-checks before the message is dropped
    pub max_attempts: u32,
    /// Sleep between re-checks
    pub interval: Duration,
}

impl Default for SendRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// Control-plane (token endpoint) configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// REST base URL
    pub base_url: String,
    /// API version segment, e.g. "v1"
    pub api_version: String,
    /// Timeout for the token request
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.kucoin.com".to_string(),
            api_version: "v1".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Full URL of the public token route
    pub fn bullet_public_url(&self) -> String {
        format!(
            "{}/api/{}/bullet-public",
            self.base_url.trim_end_matches('/'),
            self.api_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_bounds() {
        let config = ReconnectConfig::default();

        assert_eq!(config.delay_with_jitter(1, 0.0), Duration::from_secs(1));
        assert_eq!(config.delay_with_jitter(1, 1.0), Duration::from_secs(2));
        assert_eq!(config.max_steps_for_attempt(2), 4);
        assert_eq!(config.max_steps_for_attempt(3), 6);
        assert_eq!(config.max_steps_for_attempt(10), 6);
        assert_eq!(config.max_steps_for_attempt(64), 6);
    }

    #[test]
    fn test_reconnect_delay_with_jitter_in_range() {
        let config = ReconnectConfig::default();

        for attempt in 1..8 {
            let upper = config.max_steps_for_attempt(attempt);
            for _ in 0..50 {
                let delay = config.delay_for_attempt(attempt);
                assert!(delay >= Duration::from_secs(1));
                assert!(delay <= Duration::from_secs(upper));
            }
        }
    }

    #[test]
    fn test_bullet_public_url() {
        let session = SessionConfig {
            base_url: "https://api.kucoin.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            session.bullet_public_url(),
            "https://api.kucoin.com/api/v1/bullet-public"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = FleetConfig::builder()
            .timeframe("1min")
            .refresh_interval_hours(6)
            .backoff_factor(0.2)
            .build()
            .expect("valid config");

        assert_eq!(config.timeframe, "1min");
        assert_eq!(config.refresh_interval, Duration::from_secs(6 * 3600));
        assert_eq!(config.pacing.backoff_factor, 0.2);
        assert_eq!(config.max_subscriptions_per_shard, MAX_SHARD_SUBSCRIPTIONS); // default
    }

    #[test]
    fn test_config_builder_rejects_invalid() {
        assert!(FleetConfig::builder().max_subscriptions_per_shard(0).build().is_err());
        assert!(FleetConfig::builder().backoff_factor(0.0).build().is_err());
        assert!(FleetConfig::builder().backoff_factor(f64::NAN).build().is_err());
        assert!(FleetConfig::builder().timeframe("  ").build().is_err());
        assert!(FleetConfig::builder().refresh_interval_hours(0).build().is_err());
    }
}
