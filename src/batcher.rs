use crate::config::PacingConfig;
use crate::connection::{ConnectionHandle, SendOutcome};
use crate::protocol::{candle_topic, OutboundFrame};
use tokio::time::Duration;
use tracing::{debug, warn};

/// Wait intervals between consecutive batch requests.
///
/// Starts at `initial_wait` and is multiplied by `backoff_factor` after every
/// step. With the default factor of 0.1 the interval shrinks (0.5s, 0.05s,
/// 0.005s, ...), so later requests go out faster than earlier ones.
#[derive(Debug, Clone)]
pub struct PacingSchedule {
    next: Duration,
    factor: f64,
}

impl PacingSchedule {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            next: config.initial_wait,
            factor: config.backoff_factor,
        }
    }
}

impl Iterator for PacingSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        Some(current)
    }
}

/// Summary of one batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub dropped: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent => self.sent += 1,
            SendOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// Issues paced subscribe/unsubscribe sequences over one connection
#[derive(Debug, Clone)]
pub struct SubscriptionBatcher {
    pacing: PacingConfig,
}

impl SubscriptionBatcher {
    pub fn new(pacing: PacingConfig) -> Self {
        Self { pacing }
    }

    /// Subscribe to the candle channel of every market, in order
    pub async fn subscribe_many(
        &self,
        handle: &ConnectionHandle,
        markets: &[String],
        timeframe: &str,
    ) -> BatchReport {
        let frames = markets
            .iter()
            .map(|market| OutboundFrame::subscribe(candle_topic(market, timeframe)));
        let report = self.run(handle, frames).await;

        debug!(
            "[SHARD-{}] Subscribed {} markets ({} dropped)",
            handle.shard_id(),
            report.sent,
            report.dropped
        );
        report
    }

    /// Unsubscribe from every topic, in order
    pub async fn unsubscribe_many(&self, handle: &ConnectionHandle, topics: &[String]) -> BatchReport {
        let report = self.run(handle, topics.iter().map(OutboundFrame::unsubscribe)).await;

        debug!(
            "[SHARD-{}] Unsubscribed {} topics ({} dropped)",
            handle.shard_id(),
            report.sent,
            report.dropped
        );
        report
    }

    /// Sleep, send, shrink the wait; repeat.
    ///
    /// Request ids are generated when each frame is built, just before it is sent.
    async fn run(
        &self,
        handle: &ConnectionHandle,
        frames: impl Iterator<Item = OutboundFrame>,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for (wait, frame) in PacingSchedule::new(&self.pacing).zip(frames) {
            tokio::time::sleep(wait).await;
            let outcome = handle.send(frame).await;
            if outcome == SendOutcome::Dropped {
                warn!("[SHARD-{}] Batch request dropped", handle.shard_id());
            }
            report.record(outcome);
        }

        report
    }
}
