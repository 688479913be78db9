use crate::connection::ConnectionState;
use crate::protocol::StreamMessage;
use std::future::Future;

/// Shard information passed to handlers
#[derive(Debug, Clone)]
pub struct ShardContext {
    /// Unique identifier for this shard (0-indexed)
    pub shard_id: usize,
    /// Number of markets assigned to this shard
    pub market_count: usize,
    /// Physical connections opened so far by this shard (1 for the first)
    pub connection_epoch: u64,
}

/// Trait that users implement to receive decoded stream messages.
///
/// One handler instance is shared by every shard of a fleet, so it is
/// invoked concurrently from several tasks with no ordering between shards.
/// Within a shard, messages arrive in receipt order.
///
/// # Example
///
/// ```ignore
/// use kucoin_candle_fleet::{MessageHandler, ShardContext, StreamMessage};
///
/// struct PrintCandles;
///
/// impl MessageHandler for PrintCandles {
///     async fn on_message(&self, message: StreamMessage, ctx: &ShardContext) {
///         if let Some(candle) = message.candle() {
///             println!("[{}] {} close={}", ctx.shard_id, candle.symbol, candle.close);
///         }
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Called for every inbound frame that carries a `data` field.
    fn on_message(&self, message: StreamMessage, ctx: &ShardContext) -> impl Future<Output = ()> + Send;

    /// Called whenever the shard's connection changes state.
    fn on_state_change(&self, _state: ConnectionState, _ctx: &ShardContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Adapts an async closure into a [`MessageHandler`].
///
/// ```ignore
/// let handler = FnHandler(|msg: StreamMessage, _ctx: ShardContext| async move {
///     println!("{}", msg.data);
/// });
/// ```
pub struct FnHandler<F>(pub F);

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(StreamMessage, ShardContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn on_message(&self, message: StreamMessage, ctx: &ShardContext) -> impl Future<Output = ()> + Send {
        (self.0)(message, ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = FnHandler(move |msg: StreamMessage, ctx: ShardContext| {
            let counter = counter.clone();
            async move {
                assert_eq!(ctx.shard_id, 3);
                assert!(msg.is_candle());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let ctx = ShardContext {
            shard_id: 3,
            market_count: 1,
            connection_epoch: 1,
        };
        let message = StreamMessage {
            topic: "/market/candles:BTC-USDT_1min".to_string(),
            subject: None,
            kind: None,
            data: json!({}),
        };

        handler.on_message(message, &ctx).await;
        handler.on_state_change(ConnectionState::Open, &ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
