use crate::config::{ConnectionConfig, FleetConfig, ReconnectConfig, SendRetryConfig};
use crate::error::Error;
use crate::handler::{MessageHandler, ShardContext};
use crate::health::KeepAlive;
use crate::metrics::Metrics;
use crate::protocol::{candle_topic, decode_inbound, request_id, streaming_url, InboundFrame, OutboundFrame, StreamMessage};
use crate::session::{SessionCredentials, SessionProvider};
use crate::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Lifecycle of one connection.
///
/// `Idle -> Connecting -> Open -> Reconnecting -> Connecting ...`, ending in
/// `Failed` once the reconnect budget is spent. A graceful shutdown returns
/// the connection to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Only an open connection may carry outbound traffic
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// No further automatic transitions happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Commands that can be sent to a connection
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Write a frame to the socket
    Send(OutboundFrame),
    /// Re-fetch session credentials
    RefreshCredentials,
    /// Gracefully close the connection and stop
    Close,
}

/// What happened to a best-effort send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the open connection
    Sent,
    /// Connection never became ready within the retry budget
    Dropped,
}

/// Why a receive loop ended without an error
#[derive(Debug)]
enum LoopExit {
    /// Close requested, do not reconnect
    Shutdown,
    /// Socket closed by the peer or the stream ended
    Closed(String),
}

/// Replace the token in a streaming URL so it can be logged.
fn redact_token(url: &Url) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Cloneable control surface for a running [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shard_id: usize,
    command_tx: mpsc::Sender<ConnectionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    open_rx: watch::Receiver<u64>,
    cancel: Arc<Notify>,
    send_retry: SendRetryConfig,
    metrics: Arc<Metrics>,
}

impl ConnectionHandle {
    /// Shard this connection belongs to
    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receiver that changes every time a new physical connection opens.
    ///
    /// The value is the connection epoch (1 for the first open). Unlike
    /// [`state_changes`](Self::state_changes) a quick close/reopen cycle is
    /// never coalesced away.
    pub fn opens(&self) -> watch::Receiver<u64> {
        self.open_rx.clone()
    }

    /// Physical connections opened so far
    pub fn epoch(&self) -> u64 {
        *self.open_rx.borrow()
    }

    /// Wait until the connection reaches `target`, or `limit` elapses.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = matches!(timeout(limit, rx.wait_for(|s| *s == target)).await, Ok(Ok(_)));
        reached
    }

    /// Wait until the connection is open, or `limit` elapses.
    pub async fn wait_until_open(&self, limit: Duration) -> bool {
        self.wait_for_state(ConnectionState::Open, limit).await
    }

    /// Best-effort send.
    ///
    /// If the connection is not open, readiness is re-checked a bounded number
    /// of times with a fixed sleep in between. When the budget runs out the
    /// frame is dropped; the caller is not told beyond the returned outcome.
    pub async fn send(&self, frame: OutboundFrame) -> SendOutcome {
        let mut retries = 0u32;

        loop {
            if self.state().can_send() {
                match self.command_tx.send(ConnectionCommand::Send(frame)).await {
                    Ok(()) => return SendOutcome::Sent,
                    Err(e) => {
                        warn!("[SHARD-{}] Connection task gone, dropping frame: {:?}", self.shard_id, e.0);
                        self.metrics.record_send_dropped();
                        return SendOutcome::Dropped;
                    }
                }
            }

            if retries >= self.send_retry.max_attempts {
                warn!(
                    "[SHARD-{}] Connection not ready after {} retries, dropping {:?}",
                    self.shard_id, retries, frame
                );
                self.metrics.record_send_dropped();
                return SendOutcome::Dropped;
            }

            retries += 1;
            trace!(
                "[SHARD-{}] Connection {}, retrying send ({}/{})",
                self.shard_id,
                self.state(),
                retries,
                self.send_retry.max_attempts
            );
            tokio::time::sleep(self.send_retry.interval).await;
        }
    }

    /// Subscribe to the candle channel of one market
    pub async fn subscribe(&self, market: &str, timeframe: &str) -> SendOutcome {
        self.send(OutboundFrame::subscribe(candle_topic(market, timeframe))).await
    }

    /// Unsubscribe from one topic
    pub async fn unsubscribe(&self, topic: &str) -> SendOutcome {
        self.send(OutboundFrame::unsubscribe(topic)).await
    }

    /// Ask the connection to re-fetch its credentials.
    ///
    /// Does not interrupt an open socket; the new snapshot affects the
    /// keepalive threshold and nothing else until the next connect.
    pub async fn refresh_credentials(&self) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::RefreshCredentials)
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))
    }

    /// Interrupt an in-flight receive wait.
    ///
    /// The loop answers with a ping and keeps running. A no-op when nothing
    /// is waiting.
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// Close the socket and stop the connection without reconnecting
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Close)
            .await
            .map_err(|e| Error::ChannelClosed(e.to_string()))
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Manages a single WebSocket connection with keepalive and auto-reconnection
pub struct Connection<H: MessageHandler, P: SessionProvider> {
    shard_id: usize,
    market_count: usize,
    handler: Arc<H>,
    provider: Arc<P>,
    config: ConnectionConfig,
    reconnect: ReconnectConfig,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    open_tx: watch::Sender<u64>,
    cancel: Arc<Notify>,
    /// Snapshot used by the current or most recent socket
    credentials: Option<Arc<SessionCredentials>>,
    reconnect_attempts: u32,
    epoch: u64,
}

impl<H: MessageHandler, P: SessionProvider> Connection<H, P> {
    /// Create a connection and the handle that controls it
    pub fn new(
        shard_id: usize,
        market_count: usize,
        handler: Arc<H>,
        provider: Arc<P>,
        config: &FleetConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.connection.command_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (open_tx, open_rx) = watch::channel(0u64);
        let cancel = Arc::new(Notify::new());

        let handle = ConnectionHandle {
            shard_id,
            command_tx,
            state_rx,
            open_rx,
            cancel: cancel.clone(),
            send_retry: config.send_retry.clone(),
            metrics: metrics.clone(),
        };

        let connection = Self {
            shard_id,
            market_count,
            handler,
            provider,
            config: config.connection.clone(),
            reconnect: config.reconnect.clone(),
            metrics,
            command_rx,
            state_tx,
            open_tx,
            cancel,
            credentials: None,
            reconnect_attempts: 0,
            epoch: 0,
        };

        (connection, handle)
    }

    /// Run the connection until shutdown or until the reconnect budget is spent.
    ///
    /// Every physical connect fetches fresh credentials first. Failures of any
    /// kind (credential fetch, handshake, socket error, peer close) consume one
    /// attempt; a successful open resets the count.
    pub async fn start(mut self) -> Result<()> {
        loop {
            self.set_state(ConnectionState::Connecting).await;

            match self.connect_and_run().await {
                Ok(LoopExit::Shutdown) => {
                    info!("[SHARD-{}] Connection closed gracefully", self.shard_id);
                    self.set_state(ConnectionState::Idle).await;
                    return Ok(());
                }
                Ok(LoopExit::Closed(reason)) => {
                    warn!(
                        "[SHARD-{}] Websocket connection closed ({}). Reconnecting...",
                        self.shard_id, reason
                    );
                }
                Err(e) => {
                    self.metrics.record_error();
                    error!("[SHARD-{}] Websocket threw an exception: {}", self.shard_id, e);
                }
            }

            self.set_state(ConnectionState::Reconnecting).await;
            self.reconnect_attempts += 1;

            if self.reconnect_attempts >= self.reconnect.max_reconnects {
                error!(
                    "[SHARD-{}] Websocket could not reconnect after {} attempts",
                    self.shard_id, self.reconnect_attempts
                );
                self.metrics.record_shard_failure();
                self.set_state(ConnectionState::Failed).await;
                return Err(Error::ReconnectBudgetExhausted {
                    attempts: self.reconnect_attempts,
                });
            }

            let delay = self.reconnect.delay_for_attempt(self.reconnect_attempts);
            warn!(
                "[SHARD-{}] Websocket attempting to reconnect in {:?} ({}/{})",
                self.shard_id, delay, self.reconnect_attempts, self.reconnect.max_reconnects
            );
            self.metrics.record_reconnection();

            if self.wait_before_reconnect(delay).await {
                info!("[SHARD-{}] Shutdown requested while reconnecting", self.shard_id);
                self.set_state(ConnectionState::Idle).await;
                return Ok(());
            }
        }
    }

    fn context(&self) -> ShardContext {
        ShardContext {
            shard_id: self.shard_id,
            market_count: self.market_count,
            connection_epoch: self.epoch,
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }

        debug!("[SHARD-{}] {} -> {}", self.shard_id, previous, state);
        let attempts = self.reconnect_attempts;
        self.metrics.update_shard(self.shard_id, |s| {
            s.state = state;
            s.reconnect_attempt = attempts;
        });
        self.call_on_state_change(state).await;
    }

    /// Call handler.on_state_change behind the same panic guard as messages
    async fn call_on_state_change(&self, state: ConnectionState) {
        let handler = self.handler.clone();
        let ctx = self.context();
        let shard_id = self.shard_id;

        let result = tokio::task::spawn(async move {
            handler.on_state_change(state, &ctx).await;
        })
        .await;

        if let Err(e) = result {
            if e.is_panic() {
                error!(
                    "[SHARD-{}] Handler.on_state_change panicked on {}. Error: {:?}",
                    shard_id, state, e
                );
                self.metrics.record_error();
            } else {
                warn!("[SHARD-{}] Handler.on_state_change task failed: {:?}", shard_id, e);
            }
        }
    }

    /// Sleep out the backoff while still honoring commands.
    ///
    /// Returns true if a shutdown was requested.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnectionCommand::Close) | None => return true,
                    Some(ConnectionCommand::Send(frame)) => {
                        debug!("[SHARD-{}] Dropping {:?} queued for a closed socket", self.shard_id, frame);
                        self.metrics.record_send_dropped();
                    }
                    Some(ConnectionCommand::RefreshCredentials) => {
                        debug!("[SHARD-{}] Refresh skipped, next connect fetches fresh credentials", self.shard_id);
                    }
                },
            }
        }
    }

    /// Re-fetch credentials, keeping the previous snapshot on failure
    async fn refresh_credentials(&mut self) {
        debug!("[SHARD-{}] Refreshing WebSocket details", self.shard_id);
        match self.provider.fetch().await {
            Ok(credentials) => {
                self.credentials = Some(Arc::new(credentials));
                self.metrics.record_credential_refresh();
            }
            Err(e) => {
                self.metrics.record_credential_failure();
                warn!(
                    "[SHARD-{}] Credential refresh failed, keeping previous snapshot: {}",
                    self.shard_id, e
                );
            }
        }
    }

    async fn send_ping(&self, write: &mut WsSink, keepalive: &mut KeepAlive) -> Result<()> {
        write.send(OutboundFrame::ping().to_message()?).await?;
        keepalive.record_ping_sent();
        self.metrics.record_ping();
        let pings = keepalive.pings_sent();
        self.metrics.update_shard(self.shard_id, |s| s.pings_sent = pings);
        trace!("[SHARD-{}] Sent ping", self.shard_id);
        Ok(())
    }

    /// Call handler.on_message, optionally with panic protection.
    ///
    /// The call is awaited either way, so messages reach the handler in
    /// receipt order.
    async fn call_on_message(&self, message: StreamMessage, ctx: &ShardContext) {
        if self.config.low_latency_mode {
            self.handler.on_message(message, ctx).await;
            return;
        }

        let handler = self.handler.clone();
        let ctx = ctx.clone();
        let shard_id = self.shard_id;

        let result = tokio::task::spawn(async move {
            handler.on_message(message, &ctx).await;
        })
        .await;

        if let Err(e) = result {
            if e.is_panic() {
                error!(
                    "[SHARD-{}] Handler.on_message panicked! Message dropped. Error: {:?}",
                    shard_id, e
                );
                self.metrics.record_error();
            } else {
                warn!("[SHARD-{}] Handler.on_message task failed: {:?}", shard_id, e);
            }
        }
    }

    /// Decode one payload and forward it if it carries data
    async fn dispatch(&self, payload: &[u8], ctx: &ShardContext) {
        self.metrics.record_frame_received();

        match decode_inbound(payload) {
            Ok(InboundFrame::Data(message)) => {
                self.call_on_message(message, ctx).await;
                self.metrics.record_message_forwarded(self.shard_id);
            }
            Ok(InboundFrame::Control(value)) => {
                trace!("[SHARD-{}] Control frame: {}", self.shard_id, value);
            }
            Err(e) => {
                self.metrics.record_frame_discarded();
                trace!("[SHARD-{}] Discarding undecodable frame: {}", self.shard_id, e);
            }
        }
    }

    /// Connect and run until disconnection
    async fn connect_and_run(&mut self) -> Result<LoopExit> {
        let credentials = match self.provider.fetch().await {
            Ok(credentials) => Arc::new(credentials),
            Err(e) => {
                self.metrics.record_credential_failure();
                return Err(e);
            }
        };
        self.credentials = Some(credentials.clone());

        let url = streaming_url(&credentials, &request_id())?;
        debug!("[SHARD-{}] Connecting to {}", self.shard_id, redact_token(&url));

        let ws_stream = match timeout(self.config.connect_timeout, connect_stream(&url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionFailed("Connection timeout".to_string())),
        };

        self.reconnect_attempts = 0;
        self.epoch += 1;
        self.metrics.record_connection();
        self.metrics.update_shard(self.shard_id, |s| {
            s.last_connected_at = Some(Instant::now());
            s.pings_sent = 0;
        });
        self.set_state(ConnectionState::Open).await;
        self.open_tx.send_replace(self.epoch);
        info!("[SHARD-{}] Connected to {}", self.shard_id, url.host_str().unwrap_or_default());

        let result = self.receive_loop(ws_stream, &credentials).await;

        self.metrics.update_shard(self.shard_id, |s| {
            if let Some(connected_at) = s.last_connected_at {
                s.total_uptime += connected_at.elapsed();
            }
        });

        result
    }

    /// Keepalive, inbound dispatch and command handling for one open socket
    async fn receive_loop(
        &mut self,
        ws_stream: WsStream,
        credentials: &SessionCredentials,
    ) -> Result<LoopExit> {
        let (mut write, mut read) = ws_stream.split();
        let ctx = self.context();
        let mut keepalive = KeepAlive::new(credentials.ping_timeout());

        let exit = loop {
            if keepalive.is_ping_due() {
                self.send_ping(&mut write, &mut keepalive).await?;
            }

            let wait = keepalive.ping_timeout();

            tokio::select! {
                received = timeout(wait, read.next()) => {
                    match received {
                        Err(_) => {
                            debug!(
                                "[SHARD-{}] No message received in {:?} (last frame {:?} ago)",
                                self.shard_id,
                                wait,
                                keepalive.time_since_last_frame()
                            );
                            self.send_ping(&mut write, &mut keepalive).await?;
                        }
                        Ok(Some(Ok(message))) => {
                            keepalive.record_frame_received();
                            match message {
                                Message::Text(text) => self.dispatch(text.as_bytes(), &ctx).await,
                                Message::Binary(data) => self.dispatch(&data, &ctx).await,
                                Message::Ping(data) => {
                                    trace!("[SHARD-{}] Received ping, sending pong", self.shard_id);
                                    write.send(Message::Pong(data)).await?;
                                }
                                Message::Pong(_) => {
                                    trace!("[SHARD-{}] Received pong", self.shard_id);
                                }
                                Message::Close(frame) => {
                                    break LoopExit::Closed(format!("close frame {:?}", frame));
                                }
                                Message::Frame(_) => {}
                            }
                        }
                        Ok(Some(Err(e))) => return Err(Error::WebSocket(e)),
                        Ok(None) => break LoopExit::Closed("stream ended".to_string()),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Send(frame)) => {
                            write.send(frame.to_message()?).await?;
                            self.metrics.record_message_sent();
                            trace!("[SHARD-{}] Sent {:?}", self.shard_id, frame);
                        }
                        Some(ConnectionCommand::RefreshCredentials) => {
                            self.refresh_credentials().await;
                            if let Some(credentials) = &self.credentials {
                                keepalive.set_ping_timeout(credentials.ping_timeout());
                            }
                        }
                        Some(ConnectionCommand::Close) | None => {
                            info!("[SHARD-{}] Closing connection", self.shard_id);
                            let _ = write.send(Message::Close(None)).await;
                            break LoopExit::Shutdown;
                        }
                    }
                }

                _ = self.cancel.notified() => {
                    debug!("[SHARD-{}] Receive wait cancelled", self.shard_id);
                    if let Err(e) = self.send_ping(&mut write, &mut keepalive).await {
                        debug!("[SHARD-{}] Best-effort ping failed: {}", self.shard_id, e);
                    }
                }
            }
        };

        debug!(
            "[SHARD-{}] Receive loop ended after {} pings: {:?}",
            self.shard_id,
            keepalive.pings_sent(),
            exit
        );
        Ok(exit)
    }
}

/// Open a TCP connection and perform the WebSocket handshake (TLS for `wss`).
async fn connect_stream(url: &Url) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = url.scheme() == "wss";
    let port = url
        .port_or_known_default()
        .unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {}:{} failed: {}", host, port, e)))?;

    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) =
        client_async_tls_with_config(url.as_str(), tcp_stream, None, connector).await?;

    Ok(ws_stream)
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    // Kernel keepalive as a backstop for dead peers
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendRetryConfig;

    struct NoopHandler;

    impl MessageHandler for NoopHandler {
        async fn on_message(&self, _message: StreamMessage, _ctx: &ShardContext) {}
    }

    struct PanicOnStateChange;

    impl MessageHandler for PanicOnStateChange {
        async fn on_message(&self, _message: StreamMessage, _ctx: &ShardContext) {}

        async fn on_state_change(&self, state: ConnectionState, _ctx: &ShardContext) {
            panic!("state hook failed on {}", state);
        }
    }

    struct NoSession;

    impl SessionProvider for NoSession {
        async fn fetch(&self) -> Result<SessionCredentials> {
            Err(Error::InvalidSession("unavailable".to_string()))
        }
    }

    fn test_config() -> FleetConfig {
        FleetConfig::builder()
            .send_retry(SendRetryConfig {
                max_attempts: 3,
                interval: Duration::from_millis(10),
            })
            .reconnect(ReconnectConfig {
                max_reconnects: 5,
                delay_unit: Duration::from_millis(1),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_redact_token() {
        let url = Url::parse("wss://ws-api-spot.kucoin.com/?token=secret&connectId=42").unwrap();
        let redacted = redact_token(&url);
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("token=***") || redacted.contains("token=%2A%2A%2A"));
        assert!(redacted.contains("connectId=42"));
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Open.can_send());
        assert!(!ConnectionState::Connecting.can_send());
        assert!(!ConnectionState::Reconnecting.can_send());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Idle.is_terminal());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_send_dropped_when_never_open() {
        let metrics = Arc::new(Metrics::new());
        let (_connection, handle) = Connection::new(
            0,
            1,
            Arc::new(NoopHandler),
            Arc::new(NoSession),
            &test_config(),
            metrics.clone(),
        );

        let started = Instant::now();
        let outcome = handle.send(OutboundFrame::ping()).await;

        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(metrics.sends_dropped(), 1);
    }

    #[tokio::test]
    async fn test_cancel_without_loop_is_noop() {
        let (_connection, handle) = Connection::new(
            0,
            1,
            Arc::new(NoopHandler),
            Arc::new(NoSession),
            &test_config(),
            Arc::new(Metrics::new()),
        );

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_credential_failures_exhaust_budget() {
        let metrics = Arc::new(Metrics::new());
        let (connection, handle) = Connection::new(
            7,
            1,
            Arc::new(NoopHandler),
            Arc::new(NoSession),
            &test_config(),
            metrics.clone(),
        );

        let result = connection.start().await;

        assert!(matches!(
            result,
            Err(Error::ReconnectBudgetExhausted { attempts: 5 })
        ));
        assert_eq!(handle.state(), ConnectionState::Failed);
        assert_eq!(metrics.credential_failures(), 5);
        assert_eq!(metrics.reconnections(), 4);
        assert_eq!(metrics.shard_failures(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let (_connection, handle) = Connection::new(
            0,
            1,
            Arc::new(NoopHandler),
            Arc::new(NoSession),
            &test_config(),
            Arc::new(Metrics::new()),
        );

        let started = Instant::now();
        assert!(!handle.wait_for_state(ConnectionState::Open, Duration::from_millis(20)).await);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(handle.wait_for_state(ConnectionState::Idle, Duration::from_millis(20)).await);
        assert!(!handle.wait_until_open(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_state_hook_panic_is_contained() {
        let metrics = Arc::new(Metrics::new());
        let (connection, handle) = Connection::new(
            3,
            1,
            Arc::new(PanicOnStateChange),
            Arc::new(NoSession),
            &test_config(),
            metrics.clone(),
        );

        let result = connection.start().await;

        assert!(matches!(
            result,
            Err(Error::ReconnectBudgetExhausted { attempts: 5 })
        ));
        assert_eq!(handle.state(), ConnectionState::Failed);
        // 5 failed fetches plus 11 hook panics (5 Connecting, 5 Reconnecting, Failed)
        assert_eq!(metrics.errors(), 16);
        assert_eq!(metrics.shard_failures(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let config = FleetConfig::builder()
            .reconnect(ReconnectConfig {
                max_reconnects: 5,
                delay_unit: Duration::from_secs(60),
            })
            .build()
            .unwrap();
        let (connection, handle) = Connection::new(
            0,
            1,
            Arc::new(NoopHandler),
            Arc::new(NoSession),
            &config,
            Arc::new(Metrics::new()),
        );

        let task = tokio::spawn(connection.start());
        assert!(
            handle
                .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(5))
                .await
        );
        handle.shutdown().await.unwrap();

        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.state(), ConnectionState::Idle);
    }
}
