//! Wire formats for the streaming API.
//!
//! Outbound frames are JSON text with a `type` tag. Inbound frames are decoded
//! best-effort; only those carrying a `data` field are of interest to handlers.

use crate::error::Error;
use crate::session::SessionCredentials;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Prefix shared by every candle channel
pub const CANDLE_TOPIC_PREFIX: &str = "/market/candles:";

/// Request id derived from the current wall-clock time in milliseconds.
///
/// Used for client-side correlation only; two requests issued within the
/// same millisecond share an id.
pub fn request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    millis.to_string()
}

/// Topic for the candle channel of `market` at `timeframe`
pub fn candle_topic(market: &str, timeframe: &str) -> String {
    format!("{}{}_{}", CANDLE_TOPIC_PREFIX, market, timeframe)
}

/// Split a candle topic into `(market, timeframe)`
pub fn parse_candle_topic(topic: &str) -> Option<(&str, &str)> {
    topic
        .strip_prefix(CANDLE_TOPIC_PREFIX)?
        .rsplit_once('_')
        .filter(|(market, timeframe)| !market.is_empty() && !timeframe.is_empty())
}

/// Build `<endpoint>?token=<token>&connectId=<connect_id>`.
///
/// When the session requires encryption a plain `ws` endpoint is upgraded to `wss`.
pub fn streaming_url(credentials: &SessionCredentials, connect_id: &str) -> Result<Url> {
    let mut url = Url::parse(&credentials.endpoint)
        .map_err(|e| Error::ConnectionFailed(format!("Invalid endpoint URL: {}", e)))?;

    if credentials.require_encryption && url.scheme() == "ws" {
        // ws -> wss cannot fail, both are special schemes
        let _ = url.set_scheme("wss");
    }

    url.query_pairs_mut()
        .append_pair("token", &credentials.token)
        .append_pair("connectId", connect_id);

    Ok(url)
}

/// Frames sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    /// Join a channel
    Subscribe {
        id: String,
        topic: String,
        response: bool,
    },
    /// Leave a channel
    Unsubscribe {
        id: String,
        topic: String,
        response: bool,
    },
    /// Application-level keepalive
    Ping { id: String },
}

impl OutboundFrame {
    /// Subscribe request for `topic`, asking for an ack
    pub fn subscribe(topic: impl Into<String>) -> Self {
        OutboundFrame::Subscribe {
            id: request_id(),
            topic: topic.into(),
            response: true,
        }
    }

    /// Unsubscribe request for `topic`, asking for an ack
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        OutboundFrame::Unsubscribe {
            id: request_id(),
            topic: topic.into(),
            response: true,
        }
    }

    /// Keepalive ping
    pub fn ping() -> Self {
        OutboundFrame::Ping { id: request_id() }
    }

    /// Topic carried by the frame, if any
    pub fn topic(&self) -> Option<&str> {
        match self {
            OutboundFrame::Subscribe { topic, .. } | OutboundFrame::Unsubscribe { topic, .. } => {
                Some(topic)
            }
            OutboundFrame::Ping { .. } => None,
        }
    }

    /// Encode as a WebSocket text message
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// A decoded inbound frame that carries a `data` payload
///
/// Envelope fields that are missing or not strings come through empty.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Channel the payload belongs to
    pub topic: String,
    /// Event name within the channel, e.g. "trade.candles.update"
    pub subject: Option<String>,
    /// Frame type, normally "message"
    pub kind: Option<String>,
    /// Channel payload
    pub data: Value,
}

impl StreamMessage {
    fn from_object(mut map: Map<String, Value>) -> Self {
        let mut text = |key: &str| match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let topic = text("topic").unwrap_or_default();
        let subject = text("subject");
        let kind = text("type");
        let data = map.remove("data").unwrap_or(Value::Null);

        Self {
            topic,
            subject,
            kind,
            data,
        }
    }

    /// Whether the message belongs to a candle channel
    pub fn is_candle(&self) -> bool {
        self.topic.contains("candles")
    }

    /// Parse the payload as a candle update
    pub fn candle(&self) -> Option<CandleUpdate> {
        if !self.is_candle() {
            return None;
        }
        let raw: RawCandle = serde_json::from_value(self.data.clone()).ok()?;
        CandleUpdate::try_from(raw).ok()
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Frame with a `data` field, to be forwarded
    Data(StreamMessage),
    /// Ack, pong, welcome or any other frame without `data`
    Control(Value),
}

/// Decode an inbound payload.
///
/// Fails only when the payload is not JSON. Any object with a `data` field
/// is a data frame, whatever the rest of its envelope looks like.
pub fn decode_inbound(payload: &[u8]) -> Result<InboundFrame> {
    let value: Value = serde_json::from_slice(payload)?;

    match value {
        Value::Object(map) if map.contains_key("data") => {
            Ok(InboundFrame::Data(StreamMessage::from_object(map)))
        }
        other => Ok(InboundFrame::Control(other)),
    }
}

#[derive(Debug, Deserialize)]
struct RawCandle {
    symbol: String,
    candles: Vec<String>,
    #[serde(default)]
    time: u64,
}

/// One candle update: `[start, open, close, high, low, volume, turnover]`
#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub symbol: String,
    /// Candle start, seconds since epoch
    pub start_time: i64,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub turnover: f64,
    /// Server push time, nanoseconds since epoch
    pub time: u64,
}

impl TryFrom<RawCandle> for CandleUpdate {
    type Error = Error;

    fn try_from(raw: RawCandle) -> Result<Self> {
        if raw.candles.len() < 7 {
            return Err(Error::Decode(format!(
                "candle for {} has {} fields, expected 7",
                raw.symbol,
                raw.candles.len()
            )));
        }

        let num = |idx: usize| -> Result<f64> {
            raw.candles[idx]
                .parse::<f64>()
                .map_err(|e| Error::Decode(format!("bad candle field {}: {}", idx, e)))
        };

        let start_time = raw.candles[0]
            .parse::<i64>()
            .map_err(|e| Error::Decode(format!("bad candle start: {}", e)))?;

        Ok(Self {
            start_time,
            open: num(1)?,
            close: num(2)?,
            high: num(3)?,
            low: num(4)?,
            volume: num(5)?,
            turnover: num(6)?,
            time: raw.time,
            symbol: raw.symbol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credentials(endpoint: &str, encrypt: bool) -> SessionCredentials {
        SessionCredentials {
            token: "abc-123".to_string(),
            endpoint: endpoint.to_string(),
            require_encryption: encrypt,
            ping_interval_ms: 18000,
            raw_ping_timeout_ms: 10000,
        }
    }

    #[test]
    fn test_candle_topic() {
        assert_eq!(candle_topic("BTC-USDT", "1min"), "/market/candles:BTC-USDT_1min");
        assert_eq!(
            parse_candle_topic("/market/candles:BTC-USDT_1min"),
            Some(("BTC-USDT", "1min"))
        );
        assert_eq!(parse_candle_topic("/market/ticker:BTC-USDT"), None);
        assert_eq!(parse_candle_topic("/market/candles:_1min"), None);
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = OutboundFrame::subscribe(candle_topic("ETH-USDT", "5min"));
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["topic"], "/market/candles:ETH-USDT_5min");
        assert_eq!(value["response"], true);
        assert!(value["id"].as_str().unwrap().parse::<u128>().is_ok());
    }

    #[test]
    fn test_unsubscribe_and_ping_frame_shape() {
        let unsub = serde_json::to_value(OutboundFrame::unsubscribe("/market/candles:A-B_1min")).unwrap();
        assert_eq!(unsub["type"], "unsubscribe");
        assert_eq!(unsub["topic"], "/market/candles:A-B_1min");
        assert_eq!(unsub["response"], true);

        let ping = serde_json::to_value(OutboundFrame::ping()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping.get("topic").is_none());
        assert_eq!(ping.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_streaming_url() {
        let url = streaming_url(&credentials("wss://ws-api-spot.kucoin.com/", true), "42").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://ws-api-spot.kucoin.com/?token=abc-123&connectId=42"
        );
    }

    #[test]
    fn test_streaming_url_upgrades_to_tls() {
        let url = streaming_url(&credentials("ws://127.0.0.1:9000/", true), "1").unwrap();
        assert_eq!(url.scheme(), "wss");

        let plain = streaming_url(&credentials("ws://127.0.0.1:9000/", false), "1").unwrap();
        assert_eq!(plain.scheme(), "ws");
    }

    #[test]
    fn test_streaming_url_rejects_garbage() {
        assert!(streaming_url(&credentials("not a url", true), "1").is_err());
    }

    #[test]
    fn test_decode_data_frame() {
        let frame = br#"{"type":"message","topic":"/market/candles:BTC-USDT_1min","subject":"trade.candles.update","data":{"symbol":"BTC-USDT"}}"#;
        match decode_inbound(frame).unwrap() {
            InboundFrame::Data(msg) => {
                assert_eq!(msg.topic, "/market/candles:BTC-USDT_1min");
                assert!(msg.is_candle());
                assert_eq!(msg.data, json!({"symbol": "BTC-USDT"}));
            }
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_data_frame_with_odd_envelope() {
        let frame = br#"{"topic":"/market/candles:BTC-USDT_1min","subject":5,"type":["x"],"data":{"x":1}}"#;
        match decode_inbound(frame).unwrap() {
            InboundFrame::Data(msg) => {
                assert_eq!(msg.topic, "/market/candles:BTC-USDT_1min");
                assert_eq!(msg.subject, None);
                assert_eq!(msg.kind, None);
                assert_eq!(msg.data, json!({"x": 1}));
            }
            other => panic!("expected data frame, got {:?}", other),
        }

        match decode_inbound(br#"{"topic":null,"data":{"symbol":"ETH-USDT"}}"#).unwrap() {
            InboundFrame::Data(msg) => {
                assert_eq!(msg.topic, "");
                assert!(!msg.is_candle());
                assert_eq!(msg.data, json!({"symbol": "ETH-USDT"}));
            }
            other => panic!("expected data frame, got {:?}", other),
        }

        match decode_inbound(br#"{"data":null}"#).unwrap() {
            InboundFrame::Data(msg) => assert_eq!(msg.data, Value::Null),
            other => panic!("expected data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        assert!(matches!(
            decode_inbound(br#"{"id":"123","type":"pong"}"#).unwrap(),
            InboundFrame::Control(_)
        ));
        assert!(matches!(
            decode_inbound(br#"{"id":"hQvf8jkno","type":"welcome"}"#).unwrap(),
            InboundFrame::Control(_)
        ));
        assert!(matches!(decode_inbound(b"[1,2,3]").unwrap(), InboundFrame::Control(_)));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_inbound(b"not json").is_err());
        assert!(decode_inbound(b"").is_err());
    }

    #[test]
    fn test_candle_parsing() {
        let msg = StreamMessage {
            topic: "/market/candles:BTC-USDT_1hour".to_string(),
            subject: Some("trade.candles.update".to_string()),
            kind: Some("message".to_string()),
            data: json!({
                "symbol": "BTC-USDT",
                "candles": ["1589968800", "9786.9", "9740.8", "9806.1", "9732", "27.45649579", "268280.09830877"],
                "time": 1589970010253893337u64
            }),
        };

        let candle = msg.candle().expect("candle");
        assert_eq!(candle.symbol, "BTC-USDT");
        assert_eq!(candle.start_time, 1589968800);
        assert_eq!(candle.open, 9786.9);
        assert_eq!(candle.close, 9740.8);
        assert_eq!(candle.high, 9806.1);
        assert_eq!(candle.low, 9732.0);
        assert_eq!(candle.time, 1589970010253893337);
    }

    #[test]
    fn test_candle_parsing_rejects_short_rows() {
        let msg = StreamMessage {
            topic: "/market/candles:BTC-USDT_1hour".to_string(),
            subject: None,
            kind: None,
            data: json!({"symbol": "BTC-USDT", "candles": ["1589968800", "1"], "time": 0}),
        };
        assert!(msg.candle().is_none());

        let ticker = StreamMessage {
            topic: "/market/ticker:BTC-USDT".to_string(),
            subject: None,
            kind: None,
            data: json!({}),
        };
        assert!(ticker.candle().is_none());
    }
}
