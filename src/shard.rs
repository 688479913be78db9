use crate::connection::{ConnectionHandle, ConnectionState};
use crate::protocol::{candle_topic, parse_candle_topic};

/// A contiguous slice of the fleet's market list, served by one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    /// Shard identifier (position in the partition)
    pub id: usize,
    /// Markets in input order
    pub markets: Vec<String>,
}

impl ShardAssignment {
    /// Number of markets assigned
    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }

    /// Candle topics for every assigned market
    pub fn topics(&self, timeframe: &str) -> Vec<String> {
        self.markets
            .iter()
            .map(|market| candle_topic(market, timeframe))
            .collect()
    }

    /// Whether `topic` belongs to one of this shard's markets
    pub fn owns_topic(&self, topic: &str) -> bool {
        parse_candle_topic(topic)
            .map(|(market, _)| self.markets.iter().any(|m| m == market))
            .unwrap_or(false)
    }
}

/// Split `markets` into order-preserving chunks of at most `capacity`.
///
/// The result has `ceil(len / capacity)` shards; only the last may be short.
/// A zero capacity is treated as one market per shard.
pub fn partition(markets: &[String], capacity: usize) -> Vec<ShardAssignment> {
    markets
        .chunks(capacity.max(1))
        .enumerate()
        .map(|(id, chunk)| ShardAssignment {
            id,
            markets: chunk.to_vec(),
        })
        .collect()
}

/// A running shard: its assignment and the handle of its connection
#[derive(Debug, Clone)]
pub struct Shard {
    pub assignment: ShardAssignment,
    pub handle: ConnectionHandle,
}

impl Shard {
    pub fn id(&self) -> usize {
        self.assignment.id
    }

    pub fn markets(&self) -> &[String] {
        &self.assignment.markets
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }
}
