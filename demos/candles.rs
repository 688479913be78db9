//! Example: streaming KuCoin candles across a sharded fleet
//!
//! Subscribes a handful of markets, prints every candle update for a while,
//! then shuts the fleet down.
//!
//! Run with: cargo run --example candles

use kucoin_candle_fleet::{FleetConfig, FleetManager, FnHandler, ShardContext, StreamMessage};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let markets: Vec<String> = ["BTC-USDT", "ETH-USDT", "BNB-USDT"]
        .iter()
        .map(|m| m.to_string())
        .collect();

    let config = FleetConfig::builder()
        .timeframe("1min")
        .refresh_interval_hours(12)
        .backoff_factor(0.1)
        .build()?;

    // Only candle topics are of interest; everything else is ignored here
    let handler = FnHandler(|message: StreamMessage, ctx: ShardContext| async move {
        if !message.is_candle() {
            return;
        }
        match message.candle() {
            Some(candle) => info!(
                "[SHARD-{}] {} start={} o={} h={} l={} c={} v={}",
                ctx.shard_id,
                candle.symbol,
                candle.start_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            ),
            None => info!("[SHARD-{}] Unparsed candle payload: {}", ctx.shard_id, message.data),
        }
    });

    let fleet = FleetManager::build(config, markets, handler)?;
    fleet.start()?;
    info!("Fleet started with {} shards", fleet.shard_count());

    tokio::time::sleep(tokio::time::Duration::from_secs(120)).await;

    let snapshot = fleet.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnections: {}", snapshot.reconnections_total);
    info!("  Messages forwarded: {}", snapshot.messages_forwarded_total);
    info!("  Active connections: {}", snapshot.active_connections);

    let states = fleet.stop().await;
    info!("Fleet stopped: {:?}", states);

    Ok(())
}
