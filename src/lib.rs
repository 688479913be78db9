//! # kucoin-candle-fleet
//!
//! A resilient client for KuCoin's public candle streams, sharded across as
//! many WebSocket connections as the subscription list requires.
//!
//! ## Features
//!
//! - **Ephemeral sessions** - a fresh bullet token is fetched before every connect
//! - **Auto-reconnection** with jittered backoff and a bounded retry budget
//! - **Keepalive** pings derived from the server's declared timeout
//! - **Sharding** of the market list into fixed-capacity, order-preserving slices
//! - **Paced subscriptions**, re-issued every time a connection opens
//! - **Isolated failure domains** - a failed shard never affects its siblings
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use kucoin_candle_fleet::{FleetConfig, FleetManager, FnHandler, ShardContext, StreamMessage};
//!
//! let config = FleetConfig::builder()
//!     .timeframe("1min")
//!     .refresh_interval_hours(12)
//!     .backoff_factor(0.1)
//!     .build()?;
//!
//! let handler = FnHandler(|msg: StreamMessage, _ctx: ShardContext| async move {
//!     if let Some(candle) = msg.candle() {
//!         println!("{} close={}", candle.symbol, candle.close);
//!     }
//! });
//!
//! let fleet = FleetManager::build(config, vec!["BTC-USDT".into(), "ETH-USDT".into()], handler)?;
//! fleet.start()?;
//! fleet.wait().await;
//! ```

mod batcher;
mod config;
mod connection;
mod error;
mod handler;
mod health;
mod manager;
mod metrics;
mod protocol;
mod session;
mod shard;

pub use batcher::{BatchReport, PacingSchedule, SubscriptionBatcher};
pub use config::{
    ConfigError, ConnectionConfig, FleetConfig, FleetConfigBuilder, PacingConfig, ReconnectConfig,
    SendRetryConfig, SessionConfig, DEFAULT_TIMEFRAME, MAX_RECONNECTS, MAX_SHARD_SUBSCRIPTIONS,
};
pub use connection::{Connection, ConnectionCommand, ConnectionHandle, ConnectionState, SendOutcome};
pub use error::{Error, ErrorKind};
pub use handler::{FnHandler, MessageHandler, ShardContext};
pub use health::KeepAlive;
pub use manager::{Fleet, FleetManager};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    candle_topic, decode_inbound, parse_candle_topic, request_id, streaming_url, CandleUpdate,
    InboundFrame, OutboundFrame, StreamMessage, CANDLE_TOPIC_PREFIX,
};
pub use session::{BulletSessionProvider, SessionCredentials, SessionProvider};
pub use shard::{partition, Shard, ShardAssignment};

/// Result type for kucoin-candle-fleet operations
pub type Result<T> = std::result::Result<T, Error>;
