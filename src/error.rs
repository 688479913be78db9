use thiserror::Error;

/// Categorizes errors for logging and decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be stored in metrics or passed around without the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or transport error
    WebSocket,
    /// Control-plane HTTP request failed
    Http,
    /// Session descriptor missing or malformed
    Session,
    /// Connection failed (timeout, refused, bad URL, etc.)
    ConnectionFailed,
    /// Reconnect budget exhausted, shard is offline
    ReconnectBudgetExhausted,
    /// Connection task is gone
    ChannelClosed,
    /// Other error
    Other,
}

/// Errors that can occur in kucoin-candle-fleet
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP request to the control plane failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The control plane returned an unusable session descriptor
    #[error("Invalid session response: {0}")]
    InvalidSession(String),

    /// Inbound payload did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection gave up after consuming its reconnect budget
    #[error("Reconnect budget exhausted after {attempts} attempts")]
    ReconnectBudgetExhausted { attempts: u32 },

    /// Command channel to the connection task is closed
    #[error("Connection channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration rejected at build time
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Fleet lifecycle misuse (e.g. started twice)
    #[error("Fleet error: {0}")]
    Fleet(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Http(_) => ErrorKind::Http,
            Error::Json(_) | Error::InvalidSession(_) => ErrorKind::Session,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::ReconnectBudgetExhausted { .. } => ErrorKind::ReconnectBudgetExhausted,
            Error::ChannelClosed(_) => ErrorKind::ChannelClosed,
            Error::Decode(_) | Error::Config(_) | Error::Fleet(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::InvalidSession("no servers".into()).kind(),
            ErrorKind::Session
        );
        assert_eq!(
            Error::ReconnectBudgetExhausted { attempts: 5 }.kind(),
            ErrorKind::ReconnectBudgetExhausted
        );
        assert_eq!(
            Error::ConnectionFailed("timeout".into()).kind(),
            ErrorKind::ConnectionFailed
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: Error = crate::config::ConfigError::InvalidTimeframe("empty".into()).into();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::ReconnectBudgetExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "Reconnect budget exhausted after 5 attempts");
    }
}
