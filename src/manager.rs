use crate::batcher::{BatchReport, SubscriptionBatcher};
use crate::config::FleetConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionState};
use crate::error::Error;
use crate::handler::MessageHandler;
use crate::metrics::Metrics;
use crate::session::{BulletSessionProvider, SessionProvider};
use crate::shard::{partition, Shard};
use crate::Result;
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Entry point for building a fleet of sharded candle connections.
pub struct FleetManager;

impl FleetManager {
    /// Build a fleet that fetches session credentials from the public bullet endpoint.
    pub fn build<H: MessageHandler>(
        config: FleetConfig,
        markets: Vec<String>,
        handler: H,
    ) -> Result<Fleet<H, BulletSessionProvider>> {
        let provider = BulletSessionProvider::new(&config.session)?;
        Ok(Self::build_with_provider(config, markets, handler, provider))
    }

    /// Build a fleet with a caller-supplied credential source.
    ///
    /// Markets are partitioned into order-preserving shards of at most
    /// `max_subscriptions_per_shard`; each shard gets one connection. Nothing
    /// touches the network until [`Fleet::start`].
    pub fn build_with_provider<H: MessageHandler, P: SessionProvider>(
        config: FleetConfig,
        markets: Vec<String>,
        handler: H,
        provider: P,
    ) -> Fleet<H, P> {
        let handler = Arc::new(handler);
        let provider = Arc::new(provider);
        let metrics = Arc::new(Metrics::new());

        let assignments = partition(&markets, config.max_subscriptions_per_shard);
        if assignments.is_empty() {
            warn!("Building fleet with no markets");
        }

        let mut shards = Vec::with_capacity(assignments.len());
        let mut pending = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let (connection, handle) = Connection::new(
                assignment.id,
                assignment.len(),
                handler.clone(),
                provider.clone(),
                &config,
                metrics.clone(),
            );

            debug!(
                "[SHARD-{}] Created shard with {} markets",
                assignment.id,
                assignment.len()
            );
            metrics.update_shard(assignment.id, |s| s.market_count = assignment.len());

            pending.push(connection);
            shards.push(Shard { assignment, handle });
        }

        info!(
            "Built fleet: {} markets across {} shards (max {} per shard, timeframe {})",
            markets.len(),
            shards.len(),
            config.max_subscriptions_per_shard,
            config.timeframe
        );

        Fleet {
            batcher: SubscriptionBatcher::new(config.pacing.clone()),
            config,
            metrics,
            shards,
            pending: Mutex::new(Some(pending)),
            connection_tasks: Mutex::new(Vec::new()),
            support_tasks: Mutex::new(Vec::new()),
        }
    }
}

/// A set of independent shards sharing one message handler.
///
/// Shards never coordinate: a shard that exhausts its reconnect budget stays
/// `Failed` while its siblings keep running.
pub struct Fleet<H: MessageHandler, P: SessionProvider> {
    config: FleetConfig,
    metrics: Arc<Metrics>,
    batcher: SubscriptionBatcher,
    shards: Vec<Shard>,
    /// Connections not yet started; taken by `start`
    pending: Mutex<Option<Vec<Connection<H, P>>>>,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Resubscription and credential-refresh tasks
    support_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: MessageHandler, P: SessionProvider> Fleet<H, P> {
    /// Launch every shard.
    ///
    /// Per shard this spawns the connection task, a task that subscribes the
    /// shard's markets each time the connection opens, and a timer that
    /// refreshes credentials every `refresh_interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the fleet was already started.
    pub fn start(&self) -> Result<()> {
        let connections = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::Fleet("Fleet already started".to_string()))?;

        info!("Starting fleet with {} shards", connections.len());

        let mut connection_tasks = Vec::with_capacity(connections.len());
        let mut support_tasks = Vec::with_capacity(connections.len() * 2);

        for (connection, shard) in connections.into_iter().zip(&self.shards) {
            let shard_id = shard.id();
            let metrics = self.metrics.clone();
            connection_tasks.push(tokio::spawn(run_connection_with_recovery(
                shard_id, connection, metrics,
            )));

            support_tasks.push(tokio::spawn(resubscribe_on_open(
                shard.handle.clone(),
                shard.markets().to_vec(),
                self.config.timeframe.clone(),
                self.batcher.clone(),
            )));

            support_tasks.push(tokio::spawn(refresh_periodically(
                shard.handle.clone(),
                self.config.refresh_interval,
            )));
        }

        self.connection_tasks.lock().extend(connection_tasks);
        self.support_tasks.lock().extend(support_tasks);
        Ok(())
    }

    /// Close every shard and wait for its tasks to finish.
    pub async fn stop(&self) -> Vec<ConnectionState> {
        info!("Stopping fleet");

        for shard in &self.shards {
            if let Err(e) = shard.handle.shutdown().await {
                debug!("[SHARD-{}] Already stopped: {}", shard.id(), e);
            }
        }

        let states = self.wait().await;
        info!("Fleet stopped");
        states
    }

    /// Wait until every shard has stopped (shut down or failed).
    ///
    /// Returns the final state of each shard, indexed by shard id.
    pub async fn wait(&self) -> Vec<ConnectionState> {
        let connection_tasks = std::mem::take(&mut *self.connection_tasks.lock());
        for task in connection_tasks {
            let _ = task.await;
        }

        let support_tasks = std::mem::take(&mut *self.support_tasks.lock());
        for task in support_tasks {
            task.abort();
        }

        self.states()
    }

    /// Unsubscribe topics on the shards that own them.
    ///
    /// Applies to the current connections only; a shard that reconnects
    /// subscribes its full assignment again. Topics no shard owns are skipped.
    pub async fn unsubscribe(&self, topics: &[String]) -> BatchReport {
        let mut per_shard: Vec<Vec<String>> = vec![Vec::new(); self.shards.len()];

        for topic in topics {
            match self.shards.iter().find(|s| s.assignment.owns_topic(topic)) {
                Some(shard) => per_shard[shard.id()].push(topic.clone()),
                None => warn!("No shard owns topic {}, skipping", topic),
            }
        }

        let batches = self
            .shards
            .iter()
            .zip(&per_shard)
            .filter(|(_, topics)| !topics.is_empty())
            .map(|(shard, topics)| self.batcher.unsubscribe_many(&shard.handle, topics));

        join_all(batches)
            .await
            .into_iter()
            .fold(BatchReport::default(), |total, report| BatchReport {
                sent: total.sent + report.sent,
                dropped: total.dropped + report.dropped,
            })
    }

    /// Candle topics the fleet subscribes, in shard order
    pub fn topics(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|s| s.assignment.topics(&self.config.timeframe))
            .collect()
    }

    /// Current state of every shard, indexed by shard id
    pub fn states(&self) -> Vec<ConnectionState> {
        self.shards.iter().map(Shard::state).collect()
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard(&self, shard_id: usize) -> Option<&Shard> {
        self.shards.get(shard_id)
    }

    /// Handle of a shard's connection
    pub fn handle(&self, shard_id: usize) -> Option<&ConnectionHandle> {
        self.shards.get(shard_id).map(|s| &s.handle)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get the metrics for this fleet
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }
}

impl<H: MessageHandler, P: SessionProvider> Drop for Fleet<H, P> {
    fn drop(&mut self) {
        // Abort all tasks to prevent orphaned shards
        for task in self.connection_tasks.get_mut().drain(..) {
            task.abort();
        }
        for task in self.support_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Run a connection with panic recovery
async fn run_connection_with_recovery<H: MessageHandler, P: SessionProvider>(
    shard_id: usize,
    connection: Connection<H, P>,
    metrics: Arc<Metrics>,
) {
    match AssertUnwindSafe(connection.start()).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("[SHARD-{}] Connection task completed normally", shard_id);
        }
        Ok(Err(e)) => {
            warn!("[SHARD-{}] Connection task ended with error: {}", shard_id, e);
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                shard_id, panic_msg
            );
            metrics.record_error();
            metrics.update_shard(shard_id, |s| s.state = ConnectionState::Failed);
        }
    }
}

/// Subscribe the shard's markets every time its connection opens.
///
/// A fresh socket carries no subscriptions, so each open gets a full batch.
/// Ends once the connection task has gone away.
async fn resubscribe_on_open(
    handle: ConnectionHandle,
    markets: Vec<String>,
    timeframe: String,
    batcher: SubscriptionBatcher,
) {
    let mut opens = handle.opens();

    while opens.changed().await.is_ok() {
        let epoch = *opens.borrow_and_update();
        info!(
            "[SHARD-{}] Subscribing to {} markets (connection #{})",
            handle.shard_id(),
            markets.len(),
            epoch
        );
        batcher.subscribe_many(&handle, &markets, &timeframe).await;
    }
}

/// Ask the connection to refresh its credentials on a fixed interval.
///
/// The first tick fires one interval after start, not immediately.
async fn refresh_periodically(handle: ConnectionHandle, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!("[SHARD-{}] Scheduled credential refresh", handle.shard_id());
        if handle.refresh_credentials().await.is_err() {
            debug!("[SHARD-{}] Connection gone, stopping refresh timer", handle.shard_id());
            return;
        }
    }
}
