use crate::connection::ConnectionState;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard of a fleet; they are written by the
/// shards and only ever read by callers. Nothing in the fleet makes decisions
/// based on them.
///
/// # Example
/// ```ignore
/// let metrics = fleet.metrics();
/// println!("Forwarded: {}", metrics.messages_forwarded());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    frames_received_total: AtomicU64,
    messages_forwarded_total: AtomicU64,
    frames_discarded_total: AtomicU64,
    messages_sent_total: AtomicU64,
    sends_dropped_total: AtomicU64,
    pings_sent_total: AtomicU64,
    credential_refreshes_total: AtomicU64,
    credential_failures_total: AtomicU64,
    errors_total: AtomicU64,
    shard_failures_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: usize,
    /// Markets assigned to this shard
    pub market_count: usize,
    /// Last published connection state
    pub state: ConnectionState,
    /// Consecutive failed attempts (0 once open)
    pub reconnect_attempt: u32,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last message forwarded (None if no messages)
    pub time_since_last_message: Option<Duration>,
    /// Total time spent open
    pub total_uptime: Duration,
    /// Keepalive pings sent on the current connection
    pub pings_sent: u64,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            shard_id: 0,
            market_count: 0,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            time_since_connected: None,
            time_since_last_message: None,
            total_uptime: Duration::ZERO,
            pings_sent: 0,
            last_connected_at: None,
            last_message_at: None,
        }
    }
}

impl ShardMetrics {
    /// Whether the shard's socket is currently open
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnect attempts scheduled
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total frames received
    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    /// Get total messages forwarded to the handler
    pub fn messages_forwarded(&self) -> u64 {
        self.messages_forwarded_total.load(Ordering::Relaxed)
    }

    /// Get total frames discarded as undecodable
    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded_total.load(Ordering::Relaxed)
    }

    /// Get total messages sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total sends dropped because the connection never became ready
    pub fn sends_dropped(&self) -> u64 {
        self.sends_dropped_total.load(Ordering::Relaxed)
    }

    /// Get total pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Get total successful credential refreshes
    pub fn credential_refreshes(&self) -> u64 {
        self.credential_refreshes_total.load(Ordering::Relaxed)
    }

    /// Get total failed credential fetches
    pub fn credential_failures(&self) -> u64 {
        self.credential_failures_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total shards that exhausted their reconnect budget
    pub fn shard_failures(&self) -> u64 {
        self.shard_failures_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_discarded(&self) {
        self.frames_discarded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_dropped(&self) {
        self.sends_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_credential_refresh(&self) {
        self.credential_refreshes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_credential_failure(&self) {
        self.credential_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shard_failure(&self) {
        self.shard_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a forwarded message and stamp the shard's last-message time
    pub(crate) fn record_message_forwarded(&self, shard_id: usize) {
        self.messages_forwarded_total.fetch_add(1, Ordering::Relaxed);
        self.update_shard(shard_id, |s| s.last_message_at = Some(Instant::now()));
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: usize, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();

        while shards.len() <= shard_id {
            let id = shards.len();
            shards.push(ShardMetrics {
                shard_id: id,
                ..Default::default()
            });
        }

        update_fn(&mut shards[shard_id]);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Get current open connection count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            messages_forwarded_total: self.messages_forwarded_total.load(Ordering::Acquire),
            frames_discarded_total: self.frames_discarded_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            sends_dropped_total: self.sends_dropped_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            credential_refreshes_total: self.credential_refreshes_total.load(Ordering::Acquire),
            credential_failures_total: self.credential_failures_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            shard_failures_total: self.shard_failures_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected()).count(),
            total_markets: shard_snapshots.iter().map(|s| s.market_count).sum(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub frames_received_total: u64,
    pub messages_forwarded_total: u64,
    pub frames_discarded_total: u64,
    pub messages_sent_total: u64,
    pub sends_dropped_total: u64,
    pub pings_sent_total: u64,
    pub credential_refreshes_total: u64,
    pub credential_failures_total: u64,
    pub errors_total: u64,
    pub shard_failures_total: u64,
    pub active_connections: usize,
    pub total_markets: usize,
    pub shards: Vec<ShardMetrics>,
}
