use std::time::Instant;
use tokio::time::Duration;

/// Tracks keepalive state for a single physical connection.
///
/// The server drops a connection after a period of silence, so the client
/// pings whenever its own (shorter) silence threshold has elapsed since the
/// last ping.
#[derive(Debug)]
pub struct KeepAlive {
    /// Silence threshold, refreshed from the current credentials
    ping_timeout: Duration,

    /// Time of last ping sent (or loop start)
    last_ping_at: Instant,

    /// Time of last inbound frame
    last_frame_at: Option<Instant>,

    /// Pings sent on this connection
    pings_sent: u64,
}

impl KeepAlive {
    /// Create a tracker; the loop start counts as the first ping
    pub fn new(ping_timeout: Duration) -> Self {
        Self {
            ping_timeout,
            last_ping_at: Instant::now(),
            last_frame_at: None,
            pings_sent: 0,
        }
    }

    /// Current silence threshold
    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Apply a new threshold after a credential refresh
    pub fn set_ping_timeout(&mut self, ping_timeout: Duration) {
        self.ping_timeout = ping_timeout;
    }

    /// Record that we sent a ping
    pub fn record_ping_sent(&mut self) {
        self.last_ping_at = Instant::now();
        self.pings_sent += 1;
    }

    /// Record that a frame arrived
    pub fn record_frame_received(&mut self) {
        self.last_frame_at = Some(Instant::now());
    }

    /// Whether more than the threshold has passed since the last ping
    pub fn is_ping_due(&self) -> bool {
        self.last_ping_at.elapsed() > self.ping_timeout
    }

    /// Time since the last inbound frame, if any arrived
    pub fn time_since_last_frame(&self) -> Option<Duration> {
        self.last_frame_at.map(|t| t.elapsed())
    }

    /// Pings sent on this connection
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let keepalive = KeepAlive::new(Duration::from_secs(29));
        assert!(!keepalive.is_ping_due());
        assert_eq!(keepalive.pings_sent(), 0);
        assert!(keepalive.time_since_last_frame().is_none());
    }

    #[tokio::test]
    async fn test_ping_becomes_due() {
        let mut keepalive = KeepAlive::new(Duration::from_millis(30));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(keepalive.is_ping_due());

        keepalive.record_ping_sent();
        assert!(!keepalive.is_ping_due());
        assert_eq!(keepalive.pings_sent(), 1);
    }

    #[tokio::test]
    async fn test_frames_do_not_reset_ping_clock() {
        let mut keepalive = KeepAlive::new(Duration::from_millis(30));

        tokio::time::sleep(Duration::from_millis(50)).await;
        keepalive.record_frame_received();

        assert!(keepalive.is_ping_due());
        assert!(keepalive.time_since_last_frame().is_some());
    }

    #[test]
    fn test_threshold_update() {
        let mut keepalive = KeepAlive::new(Duration::from_secs(29));
        keepalive.set_ping_timeout(Duration::from_secs(4));
        assert_eq!(keepalive.ping_timeout(), Duration::from_secs(4));
    }
}
